//! Outbox Submission Pipeline
//!
//! Validates a locally authored post, persists it, and hands the Create
//! activity and the notification to the delivery queue. The caller gets
//! its answer as soon as the post is stored; nothing that happens in the
//! background can fail the submission.
//!
//! Validation stops at the first failure. Every failure carries the reason
//! shown to the poster.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::captcha::CaptchaStore;
use super::options::{PostOptions, delete_password_hash};
use super::tripcode::name_and_tripcode;
use crate::config::PostingConfig;
use crate::data::{Actor, Database, Post, new_post_id};
use crate::error::AppError;
use crate::federation::activity::builder;
use crate::federation::{ActorDirectory, DeliveryDispatcher, ReplyResolver, Signer, Task};
use crate::metrics::{POSTS_CREATED_TOTAL, SUBMISSIONS_REJECTED_TOTAL};
use crate::storage::{MediaStorage, sniff_media_type};

pub const MAX_FILENAME_CHARS: usize = 256;
pub const MAX_COMMENT_CHARS: usize = 4500;
pub const MAX_COMMENT_NEWLINES: usize = 50;
pub const MAX_FIELD_CHARS: usize = 100;

const DEFAULT_POSTER_NAME: &str = "Anonymous";
const HIDDEN_POSTER_ID: &str = "HiddenID";

/// An uploaded file
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    /// Type declared by the client, used when sniffing fails
    pub declared_type: Option<String>,
    pub data: Vec<u8>,
}

/// Request-derived facts about the poster; never persisted as-is
#[derive(Debug, Clone, Default)]
pub struct PosterInfo {
    pub address: Option<String>,
    pub country: Option<String>,
}

/// A local post submission, as read from the form
#[derive(Debug, Clone, Default)]
pub struct Submission {
    /// Thread being replied to; empty for a new thread
    pub in_reply_to: String,
    pub name: String,
    pub subject: String,
    pub comment: String,
    pub options: String,
    /// `token:answer`
    pub captcha: String,
    pub sensitive: bool,
    pub attachment: Option<Attachment>,
    pub poster: PosterInfo,
}

/// Stored submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub op_id: String,
    pub post_id: String,
}

impl Submitted {
    /// Response body: the post Id, or `OP|Post` for replies
    pub fn response_body(&self) -> String {
        if self.op_id == self.post_id {
            self.post_id.clone()
        } else {
            format!("{}|{}", self.op_id, self.post_id)
        }
    }
}

pub struct SubmissionPipeline {
    db: Arc<Database>,
    directory: Arc<ActorDirectory>,
    resolver: Arc<ReplyResolver>,
    storage: Arc<MediaStorage>,
    captcha: Arc<CaptchaStore>,
    delivery: DeliveryDispatcher,
    posting: PostingConfig,
}

impl SubmissionPipeline {
    pub fn new(
        db: Arc<Database>,
        directory: Arc<ActorDirectory>,
        resolver: Arc<ReplyResolver>,
        storage: Arc<MediaStorage>,
        captcha: Arc<CaptchaStore>,
        delivery: DeliveryDispatcher,
        posting: PostingConfig,
    ) -> Self {
        Self {
            db,
            directory,
            resolver,
            storage,
            captcha,
            delivery,
            posting,
        }
    }

    /// Validate, persist and publish a post on `board`
    ///
    /// Nothing leaves the node before the captcha is accepted: links in the
    /// comment are only resolved once every local check has passed.
    pub async fn submit(&self, board: &Actor, submission: Submission) -> Result<Submitted, AppError> {
        let poster_hash = submission
            .poster
            .address
            .as_deref()
            .and_then(|address| poster_hash(address, &self.posting.hidden_id_addresses));
        if let Some(hash) = &poster_hash {
            if let Some(ban) = self.db.active_ban(hash, Utc::now()).await? {
                tracing::debug!(ban = ban.id, expires = %ban.expires_at, "Banned poster");
                return Err(rejected("banned", AppError::Refused("You are banned".to_string())));
            }
        }

        let requested_thread = self.requested_thread(&submission.in_reply_to).await?;

        let media_type = match &submission.attachment {
            Some(attachment) => Some(self.check_attachment(attachment)?),
            None => None,
        };

        let blacklist = self.blacklist().await?;
        check_fields(&submission, &blacklist).map_err(|(reason, error)| rejected(reason, error))?;

        if requested_thread.is_none()
            && submission.attachment.is_none()
            && self.posting.require_media_for_threads
        {
            return Err(rejected(
                "media_required",
                AppError::Validation("Media is required for new threads.".to_string()),
            ));
        }

        self.captcha
            .validate(&submission.captcha)
            .await
            .map_err(|error| rejected("captcha", error))?;

        let resolution = self
            .resolver
            .resolve(&submission.comment, requested_thread.as_deref())
            .await;
        let root = match (&requested_thread, &resolution.root) {
            (Some(thread), _) => Some(thread.clone()),
            (None, Some(linked)) => self.open_thread(linked).await?,
            (None, None) => None,
        };

        let options = PostOptions::parse(&submission.options);
        let poster = name_and_tripcode(&submission.name, self.posting.tripcode_secret.as_bytes());
        let mut post = Post::new_note(new_post_id(&board.id), board.id.clone());
        post.name = submission.subject.trim().to_string();
        post.content = submission.comment.clone();
        post.attributed_to = match poster.name.as_str() {
            "" => DEFAULT_POSTER_NAME.to_string(),
            name => name.to_string(),
        };
        post.tripcode = poster.tripcode;
        post.alias = self.poster_alias(board, &options, &submission.poster);
        post.options = options.to_stored().join(";");
        post.sensitive = submission.sensitive;
        post.is_local = true;
        post.in_reply_to = match &root {
            Some(root) if resolution.root.as_deref() == Some(root.as_str()) => resolution.in_reply_to(),
            Some(root) => vec![root.clone()],
            None => Vec::new(),
        };

        if let (Some(attachment), Some(media_type)) = (&submission.attachment, media_type) {
            let stored = self.storage.store(&attachment.data, &media_type).await?;
            post.media_href = Some(stored.href);
            post.media_type = Some(stored.media_type);
            post.media_name = Some(attachment.filename.clone());
            post.media_size = Some(stored.size);
        }

        self.db.insert_post(&post).await?;
        if let Some(password) = &options.delete_password {
            self.db
                .store_post_secret(&post.id, &delete_password_hash(&post.id, password))
                .await?;
        }
        if let Some(hash) = &poster_hash {
            self.db.store_poster_hash(&post.id, hash).await?;
        }
        POSTS_CREATED_TOTAL.inc();

        let op_id = post.op_id().to_string();
        if post.is_op() {
            let archived = self
                .db
                .archive_overflow(&board.id, self.posting.live_thread_window)
                .await?;
            if !archived.is_empty() {
                tracing::info!(board = %board.id, count = archived.len(), "Archived threads");
            }
        } else if !options.is_sage() {
            self.db.bump_thread(&op_id, post.published).await?;
        }

        tracing::info!(post = %post.id, thread = %op_id, board = %board.name, "Post created");
        self.publish(board, &post).await;

        Ok(Submitted {
            op_id,
            post_id: post.id,
        })
    }

    /// Stored and configured blacklist patterns
    async fn blacklist(&self) -> Result<Vec<Regex>, AppError> {
        let stored = self.db.list_blacklist().await?;
        let patterns = stored
            .into_iter()
            .map(|entry| entry.pattern)
            .chain(self.posting.blacklist.iter().cloned())
            .filter_map(|pattern| match Regex::new(&pattern) {
                Ok(regex) => Some(regex),
                Err(error) => {
                    tracing::warn!(%pattern, %error, "Skipping invalid blacklist pattern");
                    None
                }
            })
            .collect();
        Ok(patterns)
    }

    /// Thread named by the form, which must be a live stored post
    async fn requested_thread(&self, in_reply_to: &str) -> Result<Option<String>, AppError> {
        let target = in_reply_to.trim();
        if target.is_empty() {
            return Ok(None);
        }

        let invalid = || {
            rejected(
                "thread",
                AppError::Validation(format!("\"{}\" is not a valid thread on this server", target)),
            )
        };
        let Some(post) = self.db.get_post(target).await? else {
            return Err(invalid());
        };
        if post.tombstoned {
            return Err(invalid());
        }

        let root = match post.thread_id {
            Some(root) => self.db.get_post(&root).await?.ok_or_else(invalid)?,
            None => post,
        };
        if root.locked {
            return Err(rejected("locked", AppError::Refused("thread is locked".to_string())));
        }
        Ok(Some(root.id))
    }

    /// Thread linked from the comment, when it is open for replies
    async fn open_thread(&self, linked: &str) -> Result<Option<String>, AppError> {
        Ok(self
            .db
            .get_post(linked)
            .await?
            .filter(|root| root.is_op() && !root.locked && !root.tombstoned && !root.archived)
            .map(|root| root.id))
    }

    /// Filename, size and type of an upload; returns the effective type
    fn check_attachment(&self, attachment: &Attachment) -> Result<String, AppError> {
        if attachment.filename.chars().count() > MAX_FILENAME_CHARS {
            return Err(rejected(
                "filename",
                AppError::Validation(format!(
                    "Filename too long, maximum length is {} characters",
                    MAX_FILENAME_CHARS
                )),
            ));
        }

        if attachment.data.len() as u64 > self.posting.max_attachment_bytes {
            return Err(rejected(
                "size",
                AppError::Validation(format!(
                    "File too large, maximum file size is {} MB",
                    self.posting.max_attachment_bytes / (1024 * 1024)
                )),
            ));
        }

        let media_type = sniff_media_type(&attachment.data)
            .map(str::to_string)
            .or_else(|| attachment.declared_type.clone())
            .unwrap_or_default();
        if !self
            .posting
            .supported_mime_types
            .iter()
            .any(|supported| supported.eq_ignore_ascii_case(&media_type))
        {
            return Err(rejected("mime", AppError::Refused("file type not supported".to_string())));
        }

        Ok(media_type)
    }

    /// Alias with e-mail, country and anonymized poster id as configured
    fn poster_alias(&self, board: &Actor, options: &PostOptions, poster: &PosterInfo) -> String {
        let mut parts: Vec<String> = options.alias().into_iter().collect();

        if self.posting.country_boards.contains(&board.name) {
            if let Some(country) = poster.country.as_deref().filter(|c| !c.is_empty()) {
                parts.push(format!("cc:{}", country.to_ascii_lowercase()));
            }
        }

        if self.posting.poster_id_boards.contains(&board.name) {
            if let Some(address) = poster.address.as_deref() {
                parts.push(format!(
                    "id:{}",
                    poster_id(address, &self.posting.hidden_id_addresses)
                ));
            }
        }

        parts.join(" ")
    }

    /// Queue the Create fan-out and the notification
    async fn publish(&self, board: &Actor, post: &Post) {
        let inboxes = match self.db.get_follower_inboxes(&board.id).await {
            Ok(inboxes) => inboxes,
            Err(error) => {
                tracing::warn!(board = %board.id, %error, "Cannot load follower inboxes");
                Vec::new()
            }
        };

        // The board hosting a remote thread hears about replies to it
        let to: Vec<String> = post
            .in_reply_to
            .first()
            .filter(|root| !self.directory.is_local_id(root))
            .and_then(|root| root.rsplit_once('/'))
            .map(|(actor, _)| actor.to_string())
            .into_iter()
            .collect();

        match Signer::for_actor(board) {
            Ok(signer) => {
                let create = builder::create(board, builder::note(post), &to);
                self.delivery.deliver_including(create, inboxes, to, signer);
            }
            Err(error) => tracing::warn!(board = %board.id, %error, "Cannot sign Create"),
        }

        self.delivery.submit(Task::Notify { post: post.clone() });
    }
}

fn rejected(reason: &str, error: AppError) -> AppError {
    SUBMISSIONS_REJECTED_TOTAL.with_label_values(&[reason]).inc();
    tracing::debug!(%reason, %error, "Submission refused");
    error
}

/// Text field checks, in order
///
/// Only a reply carrying a file may leave both subject and comment empty.
fn check_fields(submission: &Submission, blacklist: &[Regex]) -> Result<(), (&'static str, AppError)> {
    if blacklist
        .iter()
        .any(|pattern| pattern.is_match(&submission.comment) || pattern.is_match(&submission.subject))
    {
        return Err((
            "blacklist",
            AppError::Validation("Comment contains blacklisted content".to_string()),
        ));
    }

    let file_reply = !submission.in_reply_to.trim().is_empty() && submission.attachment.is_some();
    if !file_reply && submission.comment.trim().is_empty() && submission.subject.trim().is_empty() {
        return Err((
            "empty",
            AppError::Validation("Subject or Comment is required".to_string()),
        ));
    }

    if submission.comment.chars().count() > MAX_COMMENT_CHARS {
        return Err((
            "comment_length",
            AppError::Validation(format!(
                "Comment is longer than {} characters",
                MAX_COMMENT_CHARS
            )),
        ));
    }

    if count_line_breaks(&submission.comment) > MAX_COMMENT_NEWLINES {
        return Err((
            "newlines",
            AppError::Validation("Too many newlines in comment".to_string()),
        ));
    }

    if [&submission.name, &submission.subject, &submission.options]
        .iter()
        .any(|field| field.chars().count() > MAX_FIELD_CHARS)
    {
        return Err((
            "field_length",
            AppError::Validation(format!(
                "Name, Subject, or Options field(s) contain more than {} characters",
                MAX_FIELD_CHARS
            )),
        ));
    }

    Ok(())
}

/// `\r\n`, `\n` and `\r` each count once
fn count_line_breaks(text: &str) -> usize {
    let bytes = text.as_bytes();
    let mut count = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' => {
                count += 1;
                if bytes.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
            }
            b'\n' => count += 1,
            _ => {}
        }
        i += 1;
    }
    count
}

/// One-way hash of the poster's address; `None` for hidden addresses
fn poster_hash(address: &str, hidden: &[String]) -> Option<String> {
    // The forwarded-for header may list proxies after the client
    let address = address.split(',').next().unwrap_or(address).trim();
    if address.is_empty() || hidden.iter().any(|h| h == address) {
        return None;
    }
    Some(URL_SAFE_NO_PAD.encode(Sha256::digest(address.as_bytes())))
}

/// Anonymized poster id shown in the alias
fn poster_id(address: &str, hidden: &[String]) -> String {
    poster_hash(address, hidden).unwrap_or_else(|| HIDDEN_POSTER_ID.to_string())
}
