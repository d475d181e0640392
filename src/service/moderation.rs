//! Board moderation
//!
//! Admin operations on a single board plus the poster's own delete and
//! reports. Tombstoning goes through the same storage cascade as remote
//! deletes, so replies and the live-thread window behave identically.
//!
//! Bans are keyed on the poster hash recorded with each local post; the raw
//! address is never stored.

use chrono::{DateTime, Duration, TimeZone, Utc};
use regex::Regex;
use std::sync::Arc;

use super::captcha::CaptchaStore;
use super::options::verify_delete_password;
use crate::data::{
    Actor, Ban, BlacklistEntry, BoardCache, Database, Post, Report, TombstoneOutcome,
};
use crate::error::AppError;
use crate::federation::activity::builder;
use crate::federation::{DeliveryDispatcher, Signer};
use crate::storage::MediaStorage;

pub const MAX_REPORT_CHARS: usize = 100;

pub struct ModerationService {
    db: Arc<Database>,
    boards: Arc<BoardCache>,
    storage: Arc<MediaStorage>,
    captcha: Arc<CaptchaStore>,
    delivery: DeliveryDispatcher,
    live_thread_window: usize,
}

impl ModerationService {
    pub fn new(
        db: Arc<Database>,
        boards: Arc<BoardCache>,
        storage: Arc<MediaStorage>,
        captcha: Arc<CaptchaStore>,
        delivery: DeliveryDispatcher,
        live_thread_window: usize,
    ) -> Self {
        Self {
            db,
            boards,
            storage,
            captcha,
            delivery,
            live_thread_window,
        }
    }

    // =========================================================================
    // Posts
    // =========================================================================

    /// Tombstone a post (and an OP's replies), then tell followers
    pub async fn delete_post(&self, board: &Actor, id: &str) -> Result<TombstoneOutcome, AppError> {
        let post = self.board_post(board, id).await?;
        self.tombstone(board, post).await
    }

    /// Poster-initiated delete, authorized by the delete password
    pub async fn self_delete(
        &self,
        board: &Actor,
        id: &str,
        password: &str,
    ) -> Result<TombstoneOutcome, AppError> {
        let post = self.board_post(board, id).await?;

        let Some(secret) = self.db.get_post_secret(&post.id).await? else {
            return Err(AppError::Refused("Post has no delete password".to_string()));
        };
        if !verify_delete_password(&post.id, password, &secret) {
            tracing::info!(post = %post.id, "Delete password mismatch");
            return Err(AppError::Refused("Incorrect password".to_string()));
        }

        self.tombstone(board, post).await
    }

    pub async fn toggle_sticky(&self, board: &Actor, id: &str) -> Result<bool, AppError> {
        let thread = self.board_thread(board, id).await?;
        let sticky = self.db.toggle_sticky(&thread.id).await?.ok_or(AppError::NotFound)?;
        tracing::info!(thread = %thread.id, sticky, "Sticky toggled");
        Ok(sticky)
    }

    pub async fn toggle_lock(&self, board: &Actor, id: &str) -> Result<bool, AppError> {
        let thread = self.board_thread(board, id).await?;
        let locked = self.db.toggle_locked(&thread.id).await?.ok_or(AppError::NotFound)?;
        tracing::info!(thread = %thread.id, locked, "Lock toggled");
        Ok(locked)
    }

    pub async fn mark_sensitive(&self, board: &Actor, id: &str) -> Result<(), AppError> {
        let post = self.live_board_post(board, id).await?;
        if !self.db.mark_sensitive(&post.id).await? {
            return Err(AppError::NotFound);
        }
        tracing::info!(post = %post.id, "Marked sensitive");
        Ok(())
    }

    /// Remove a post's attachment but keep the post
    pub async fn delete_attachment(&self, board: &Actor, id: &str) -> Result<(), AppError> {
        let post = self.live_board_post(board, id).await?;
        let Some(href) = self.db.clear_attachment(&post.id).await? else {
            return Err(AppError::Validation(format!("{} has no attachment", post.id)));
        };

        if post.is_local {
            if let Some(key) = self.storage.key_from_url(&href) {
                if let Err(error) = self.storage.delete(key).await {
                    tracing::warn!(post = %post.id, %error, "Attachment not removed");
                }
            }
        }
        tracing::info!(post = %post.id, "Attachment deleted");
        Ok(())
    }

    /// Return an archived thread to the live set
    pub async fn pop_archive(&self, board: &Actor, id: &str) -> Result<(), AppError> {
        let thread = self.board_thread(board, id).await?;
        if !self.db.unarchive_thread(&thread.id).await? {
            return Err(AppError::Validation(format!("{} is not archived", thread.id)));
        }
        tracing::info!(thread = %thread.id, "Thread unarchived");
        Ok(())
    }

    // =========================================================================
    // Board settings
    // =========================================================================

    pub async fn toggle_auto_subscribe(&self, board: &Actor) -> Result<bool, AppError> {
        let enabled = self
            .db
            .toggle_auto_subscribe(&board.id)
            .await?
            .ok_or(AppError::NotFound)?;
        self.boards.refresh().await?;
        tracing::info!(board = %board.id, enabled, "Auto-subscribe toggled");
        Ok(enabled)
    }

    /// Store a regular expression matched against subjects and comments
    pub async fn add_blacklist(&self, pattern: &str) -> Result<i64, AppError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(AppError::Validation("Pattern must not be empty".to_string()));
        }
        Regex::new(pattern).map_err(|e| AppError::Validation(format!("Invalid pattern: {}", e)))?;
        self.db
            .add_blacklist_pattern(pattern)
            .await?
            .ok_or_else(|| AppError::Validation("Pattern already exists".to_string()))
    }

    pub async fn remove_blacklist(&self, id: i64) -> Result<(), AppError> {
        if !self.db.remove_blacklist_pattern(id).await? {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    pub async fn list_blacklist(&self) -> Result<Vec<BlacklistEntry>, AppError> {
        self.db.list_blacklist().await
    }

    // =========================================================================
    // Reports
    // =========================================================================

    /// File a report against a live post; open to anyone with a captcha
    pub async fn report_post(
        &self,
        board: &Actor,
        id: &str,
        reason: &str,
        captcha: &str,
    ) -> Result<i64, AppError> {
        let reason = reason.trim();
        if reason.chars().count() > MAX_REPORT_CHARS {
            return Err(AppError::Validation(format!(
                "Report comment limit {} characters",
                MAX_REPORT_CHARS
            )));
        }
        if reason.is_empty() {
            return Err(AppError::Validation("No report reason provided".to_string()));
        }
        if let Err(error) = self.captcha.validate(captcha).await {
            tracing::debug!(%error, "Report captcha refused");
            return Err(AppError::Refused("Invalid captcha".to_string()));
        }

        let post = self.live_board_post(board, id).await?;
        let report = self.db.insert_report(&post.id, &board.id, reason).await?;
        tracing::info!(post = %post.id, report, "Post reported");
        Ok(report)
    }

    pub async fn list_reports(&self, board: &Actor) -> Result<Vec<Report>, AppError> {
        self.db.list_reports(&board.id).await
    }

    /// Closing a report discards it
    pub async fn close_report(&self, board: &Actor, id: i64) -> Result<(), AppError> {
        if !self.db.delete_report(&board.id, id).await? {
            return Err(AppError::NotFound);
        }
        tracing::info!(board = %board.id, report = id, "Report closed");
        Ok(())
    }

    // =========================================================================
    // Bans
    // =========================================================================

    /// Ban whoever wrote `id` from posting for `duration`
    ///
    /// Durations: `1day`, `3days`, `1week`, `2weeks`, `1month`, `permanent`.
    pub async fn ban_poster(
        &self,
        board: &Actor,
        id: &str,
        reason: &str,
        duration: &str,
    ) -> Result<Ban, AppError> {
        let now = Utc::now();
        let expires_at = ban_expiry(duration, now)?;
        let post = self.board_post(board, id).await?;
        let poster_hash = self
            .db
            .get_poster_hash(&post.id)
            .await?
            .ok_or_else(|| AppError::Validation("Post has no poster address".to_string()))?;

        let reason = reason.trim().to_string();
        let ban_id = self.db.insert_ban(&poster_hash, &reason, expires_at).await?;
        tracing::info!(post = %post.id, ban = ban_id, %expires_at, "Poster banned");

        Ok(Ban {
            id: ban_id,
            poster_hash,
            reason,
            created_at: now,
            expires_at,
        })
    }

    /// Bans still in force
    pub async fn list_bans(&self) -> Result<Vec<Ban>, AppError> {
        self.db.list_bans(Utc::now()).await
    }

    pub async fn remove_ban(&self, id: i64) -> Result<(), AppError> {
        if !self.db.remove_ban(id).await? {
            return Err(AppError::NotFound);
        }
        tracing::info!(ban = id, "Ban lifted");
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn live_board_post(&self, board: &Actor, id: &str) -> Result<Post, AppError> {
        let post = self.board_post(board, id).await?;
        if post.tombstoned {
            return Err(AppError::NotFound);
        }
        Ok(post)
    }

    async fn board_post(&self, board: &Actor, id: &str) -> Result<Post, AppError> {
        self.db
            .get_post(id)
            .await?
            .filter(|post| post.board_id == board.id)
            .ok_or(AppError::NotFound)
    }

    async fn board_thread(&self, board: &Actor, id: &str) -> Result<Post, AppError> {
        let post = self.board_post(board, id).await?;
        if !post.is_op() {
            return Err(AppError::Validation(format!("{} is not a thread", post.id)));
        }
        Ok(post)
    }

    async fn tombstone(&self, board: &Actor, post: Post) -> Result<TombstoneOutcome, AppError> {
        let mut affected = vec![post.clone()];
        if post.is_op() {
            affected.extend(self.db.list_replies(&post.id).await?);
        }

        let outcome = self
            .db
            .tombstone_cascade(&board.id, &post.id, &[], self.live_thread_window)
            .await?;

        for stored in affected.iter().filter(|p| p.is_local) {
            let key = stored
                .media_href
                .as_deref()
                .and_then(|href| self.storage.key_from_url(href));
            if let Some(key) = key {
                if let Err(error) = self.storage.delete(key).await {
                    tracing::warn!(post = %stored.id, %error, "Attachment not removed");
                }
            }
        }

        tracing::info!(
            post = %post.id,
            tombstoned = outcome.tombstoned.len(),
            unarchived = ?outcome.unarchived,
            "Post deleted"
        );

        if post.is_local {
            let replies: Vec<String> = outcome
                .tombstoned
                .iter()
                .filter(|id| **id != post.id)
                .cloned()
                .collect();
            let delete = builder::delete(board, &post.id, &replies);
            let inboxes = self.db.get_follower_inboxes(&board.id).await?;
            self.delivery.deliver(delete, inboxes, Signer::for_actor(board)?);
        }

        Ok(outcome)
    }
}

/// End of a ban starting at `now`
fn ban_expiry(duration: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
    let days = match duration.trim() {
        "1day" => 1,
        "3days" => 3,
        "1week" => 7,
        "2weeks" => 14,
        "1month" => 30,
        "permanent" => {
            return Utc
                .with_ymd_and_hms(9999, 12, 31, 0, 0, 0)
                .single()
                .ok_or_else(|| AppError::Internal(anyhow::anyhow!("Invalid permanent ban date")));
        }
        other => {
            return Err(AppError::Validation(format!("Unknown ban duration: {}", other)));
        }
    };
    Ok(now + Duration::days(days))
}
