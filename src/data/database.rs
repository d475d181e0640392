//! SQLite database operations
//!
//! Persistent storage for actors, posts, follow relationships and the
//! small amount of moderation state the node keeps.
//!
//! Every insert-if-absent used for deduplication is a single statement
//! (`INSERT OR IGNORE` / `ON CONFLICT`). Multi-step mutations run inside one
//! `BEGIN IMMEDIATE` transaction so they commit or roll back as a unit.

use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqlitePool;
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashMap;
use std::path::Path;

use super::models::*;
use crate::error::AppError;

/// Database connection pool wrapper
pub struct Database {
    pool: SqlitePool,
}

const POST_COLUMNS: &str = "id, board_id, thread_id, object_type, name, attributed_to, tripcode, content, \
     alias, options, sensitive, sticky, locked, archived, tombstoned, media_href, media_type, \
     media_name, media_size, is_local, published, updated, deleted_at";

async fn begin_immediate(conn: &mut PoolConnection<Sqlite>) -> Result<(), AppError> {
    sqlx::query("BEGIN IMMEDIATE").execute(&mut **conn).await?;
    Ok(())
}

async fn finish<T>(
    conn: &mut PoolConnection<Sqlite>,
    result: Result<T, AppError>,
) -> Result<T, AppError> {
    match result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut **conn).await?;
            Ok(value)
        }
        Err(error) => {
            let _ = sqlx::query("ROLLBACK").execute(&mut **conn).await;
            Err(error)
        }
    }
}

impl Database {
    /// Connect to SQLite database
    ///
    /// Creates the file and parent directory if needed and runs migrations.
    ///
    /// # Arguments
    /// * `path` - Path to SQLite database file
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        // Create connection string
        let connection_string = format!("sqlite:{}?mode=rwc", path.display());

        // Create connection pool
        let pool = SqlitePool::connect(&connection_string).await?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Migration failed: {}", e);
                AppError::Internal(anyhow::anyhow!("Migration failed: {}", e))
            })?;

        tracing::info!("Database connected and migrated successfully");

        Ok(Self { pool })
    }

    // =========================================================================
    // Actors (local only)
    // =========================================================================

    /// Insert a local actor unless one with the same Id or name exists
    pub async fn insert_actor(&self, actor: &Actor) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO actors (
                id, name, preferred_username, summary, inbox, outbox, following, followers,
                public_key_pem, private_key_pem, restricted, auto_subscribe, is_instance, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&actor.id)
        .bind(&actor.name)
        .bind(&actor.preferred_username)
        .bind(&actor.summary)
        .bind(&actor.inbox)
        .bind(&actor.outbox)
        .bind(&actor.following)
        .bind(&actor.followers)
        .bind(&actor.public_key_pem)
        .bind(&actor.private_key_pem)
        .bind(actor.restricted)
        .bind(actor.auto_subscribe)
        .bind(actor.is_instance)
        .bind(actor.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get a local actor by Id
    pub async fn get_actor(&self, id: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(actor)
    }

    /// Get a local board by its short name
    pub async fn get_actor_by_name(&self, name: &str) -> Result<Option<Actor>, AppError> {
        let actor = sqlx::query_as::<_, Actor>(
            "SELECT * FROM actors WHERE name = ? AND is_instance = 0",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(actor)
    }

    /// The instance actor, if created
    pub async fn get_instance_actor(&self) -> Result<Option<Actor>, AppError> {
        let actor =
            sqlx::query_as::<_, Actor>("SELECT * FROM actors WHERE is_instance = 1 LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;

        Ok(actor)
    }

    /// All local boards ordered by name
    pub async fn list_boards(&self) -> Result<Vec<Actor>, AppError> {
        let boards = sqlx::query_as::<_, Actor>(
            "SELECT * FROM actors WHERE is_instance = 0 ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(boards)
    }

    /// Flip a board's AutoSubscribe flag, returning the new value
    pub async fn toggle_auto_subscribe(&self, id: &str) -> Result<Option<bool>, AppError> {
        let value = sqlx::query_scalar::<_, bool>(
            "UPDATE actors SET auto_subscribe = 1 - auto_subscribe WHERE id = ? RETURNING auto_subscribe",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    // =========================================================================
    // Posts
    // =========================================================================

    /// Insert a post unless its Id is already stored
    ///
    /// The InReplyTo list is canonicalized inside the transaction: if the
    /// first target is itself a reply, its thread root takes its place, self
    /// references and duplicates are dropped. Returns `false` when the Id
    /// already existed.
    pub async fn insert_post(&self, post: &Post) -> Result<bool, AppError> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;

        let result: Result<bool, AppError> = async {
            let links = canonical_links(&mut conn, &post.id, &post.in_reply_to).await?;
            let thread_id = links.first().cloned();

            let inserted = sqlx::query(&format!(
                "INSERT OR IGNORE INTO posts ({POST_COLUMNS}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .bind(&post.id)
            .bind(&post.board_id)
            .bind(&thread_id)
            .bind(post.object_type)
            .bind(&post.name)
            .bind(&post.attributed_to)
            .bind(&post.tripcode)
            .bind(&post.content)
            .bind(&post.alias)
            .bind(&post.options)
            .bind(post.sensitive)
            .bind(post.sticky)
            .bind(post.locked)
            .bind(post.archived)
            .bind(post.tombstoned)
            .bind(&post.media_href)
            .bind(&post.media_type)
            .bind(&post.media_name)
            .bind(post.media_size)
            .bind(post.is_local)
            .bind(post.published)
            .bind(post.updated)
            .bind(post.deleted_at)
            .execute(&mut *conn)
            .await?
            .rows_affected()
                > 0;

            if inserted {
                for (position, target) in links.iter().enumerate() {
                    sqlx::query(
                        "INSERT OR IGNORE INTO post_links (post_id, target_id, position) VALUES (?, ?, ?)",
                    )
                    .bind(&post.id)
                    .bind(target)
                    .bind(position as i64)
                    .execute(&mut *conn)
                    .await?;
                }
            }

            Ok(inserted)
        }
        .await;

        finish(&mut conn, result).await
    }

    /// Get a post with its InReplyTo list
    pub async fn get_post(&self, id: &str) -> Result<Option<Post>, AppError> {
        let post = sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match post {
            Some(mut post) => {
                self.attach_links(std::slice::from_mut(&mut post)).await?;
                Ok(Some(post))
            }
            None => Ok(None),
        }
    }

    /// Whether a post with this Id is stored
    pub async fn post_exists(&self, id: &str) -> Result<bool, AppError> {
        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM posts WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;

        Ok(exists > 0)
    }

    /// Whether the post is stored and tombstoned
    pub async fn is_tombstoned(&self, id: &str) -> Result<bool, AppError> {
        let tombstoned =
            sqlx::query_scalar::<_, bool>("SELECT tombstoned FROM posts WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(tombstoned.unwrap_or(false))
    }

    /// Thread root of a stored reply; `None` for OPs and unknown Ids
    pub async fn thread_root_of(&self, id: &str) -> Result<Option<String>, AppError> {
        let root = sqlx::query_scalar::<_, Option<String>>("SELECT thread_id FROM posts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(root.flatten())
    }

    /// Whether `id` is a stored reply inside the thread rooted at `op`
    pub async fn is_reply_in_thread(&self, op: &str, id: &str) -> Result<bool, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM posts WHERE id = ? AND thread_id = ?",
        )
        .bind(id)
        .bind(op)
        .fetch_one(&self.pool)
        .await?;

        Ok(count > 0)
    }

    /// Resolve a short slug reference to a stored post Id, preferring local posts
    pub async fn post_id_by_slug(&self, slug: &str) -> Result<Option<String>, AppError> {
        let id = sqlx::query_scalar::<_, String>(
            "SELECT id FROM posts WHERE id LIKE '%/' || ? ORDER BY is_local DESC, published DESC LIMIT 1",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    /// Live OPs of a board: stickies first, then most recently bumped
    pub async fn list_threads(&self, board_id: &str) -> Result<Vec<Post>, AppError> {
        let mut threads = sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts \
             WHERE board_id = ? AND thread_id IS NULL AND archived = 0 AND tombstoned = 0 \
             ORDER BY sticky DESC, updated DESC"
        ))
        .bind(board_id)
        .fetch_all(&self.pool)
        .await?;

        self.attach_links(&mut threads).await?;
        Ok(threads)
    }

    /// Replies of a thread in posting order
    pub async fn list_replies(&self, op_id: &str) -> Result<Vec<Post>, AppError> {
        let mut replies = sqlx::query_as::<_, Post>(&format!(
            "SELECT {POST_COLUMNS} FROM posts WHERE thread_id = ? ORDER BY published ASC"
        ))
        .bind(op_id)
        .fetch_all(&self.pool)
        .await?;

        self.attach_links(&mut replies).await?;
        Ok(replies)
    }

    /// Move the thread's bump time forward
    pub async fn bump_thread(&self, op_id: &str, at: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE posts SET updated = ? WHERE id = ? AND thread_id IS NULL AND updated < ?")
            .bind(at)
            .bind(op_id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Flip the sticky flag of an OP, returning the new value
    pub async fn toggle_sticky(&self, op_id: &str) -> Result<Option<bool>, AppError> {
        let value = sqlx::query_scalar::<_, bool>(
            "UPDATE posts SET sticky = 1 - sticky WHERE id = ? AND thread_id IS NULL RETURNING sticky",
        )
        .bind(op_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    /// Flip the locked flag of an OP, returning the new value
    pub async fn toggle_locked(&self, op_id: &str) -> Result<Option<bool>, AppError> {
        let value = sqlx::query_scalar::<_, bool>(
            "UPDATE posts SET locked = 1 - locked WHERE id = ? AND thread_id IS NULL RETURNING locked",
        )
        .bind(op_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    /// Tombstone a post and the given replies, then refill the live window
    ///
    /// If `target_id` is a stored OP, its stored replies are tombstoned too.
    /// Content, subject and attachment are cleared; the Id is kept so dangling
    /// references can still be detected. The unarchive step runs in the same
    /// transaction.
    pub async fn tombstone_cascade(
        &self,
        board_id: &str,
        target_id: &str,
        listed_replies: &[String],
        window: usize,
    ) -> Result<TombstoneOutcome, AppError> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;

        let result: Result<TombstoneOutcome, AppError> = async {
            let target_is_op = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM posts WHERE id = ? AND thread_id IS NULL",
            )
            .bind(target_id)
            .fetch_one(&mut *conn)
            .await?
                > 0;

            let mut ids: Vec<String> = listed_replies.to_vec();
            if target_is_op {
                let stored = sqlx::query_scalar::<_, String>(
                    "SELECT id FROM posts WHERE thread_id = ?",
                )
                .bind(target_id)
                .fetch_all(&mut *conn)
                .await?;
                ids.extend(stored);
            }
            ids.push(target_id.to_string());
            dedup_in_order(&mut ids);

            let now = Utc::now();
            let mut outcome = TombstoneOutcome::default();
            for id in ids {
                let affected = sqlx::query(
                    r#"
                    UPDATE posts SET
                        object_type = 'Tombstone', tombstoned = 1, name = '', content = '', tripcode = '',
                        media_href = NULL, media_type = NULL, media_name = NULL, media_size = NULL,
                        deleted_at = ?
                    WHERE id = ? AND tombstoned = 0
                    "#,
                )
                .bind(now)
                .bind(&id)
                .execute(&mut *conn)
                .await?
                .rows_affected();

                if affected > 0 {
                    outcome.tombstoned.push(id);
                }
            }

            outcome.unarchived = unarchive_within(&mut conn, board_id, window).await?;
            Ok(outcome)
        }
        .await;

        finish(&mut conn, result).await
    }

    /// Archive the oldest non-sticky live threads beyond `window`
    ///
    /// Returns the archived thread Ids.
    pub async fn archive_overflow(
        &self,
        board_id: &str,
        window: usize,
    ) -> Result<Vec<String>, AppError> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;

        let result: Result<Vec<String>, AppError> = async {
            let live = count_live_threads(&mut conn, board_id).await?;
            if live <= window {
                return Ok(Vec::new());
            }

            let candidates = sqlx::query_scalar::<_, String>(
                "SELECT id FROM posts \
                 WHERE board_id = ? AND thread_id IS NULL AND archived = 0 AND tombstoned = 0 AND sticky = 0 \
                 ORDER BY updated ASC LIMIT ?",
            )
            .bind(board_id)
            .bind((live - window) as i64)
            .fetch_all(&mut *conn)
            .await?;

            for id in &candidates {
                sqlx::query("UPDATE posts SET archived = 1 WHERE id = ?")
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
            }

            Ok(candidates)
        }
        .await;

        finish(&mut conn, result).await
    }

    /// Return an archived thread to the live set
    pub async fn unarchive_thread(&self, op_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE posts SET archived = 0 WHERE id = ? AND thread_id IS NULL AND archived = 1 AND tombstoned = 0",
        )
        .bind(op_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Set the sensitive flag; `false` when the post is unknown
    pub async fn mark_sensitive(&self, id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE posts SET sensitive = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop a post's attachment, returning the href it had
    pub async fn clear_attachment(&self, id: &str) -> Result<Option<String>, AppError> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;

        let result: Result<Option<String>, AppError> = async {
            let href = sqlx::query_scalar::<_, Option<String>>("SELECT media_href FROM posts WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *conn)
                .await?
                .flatten();

            if href.is_some() {
                sqlx::query(
                    "UPDATE posts SET media_href = NULL, media_type = NULL, media_name = NULL, media_size = NULL \
                     WHERE id = ?",
                )
                .bind(id)
                .execute(&mut *conn)
                .await?;
            }
            Ok(href)
        }
        .await;

        finish(&mut conn, result).await
    }

    /// Number of posts with an attachment among the given Ids' threads
    pub async fn count_thread_images(&self, op_id: &str) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM posts WHERE (id = ? OR thread_id = ?) AND media_href IS NOT NULL",
        )
        .bind(op_id)
        .bind(op_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn attach_links(&self, posts: &mut [Post]) -> Result<(), AppError> {
        if posts.is_empty() {
            return Ok(());
        }

        let mut query_builder = QueryBuilder::<Sqlite>::new(
            "SELECT post_id, target_id FROM post_links WHERE post_id IN (",
        );
        {
            let mut separated = query_builder.separated(", ");
            for post in posts.iter() {
                separated.push_bind(&post.id);
            }
        }
        query_builder.push(") ORDER BY post_id, position");

        let rows = query_builder
            .build_query_as::<(String, String)>()
            .fetch_all(&self.pool)
            .await?;

        let mut by_post: HashMap<String, Vec<String>> = HashMap::new();
        for (post_id, target_id) in rows {
            by_post.entry(post_id).or_default().push(target_id);
        }

        for post in posts.iter_mut() {
            post.in_reply_to = by_post.remove(&post.id).unwrap_or_default();
        }

        Ok(())
    }

    // =========================================================================
    // Follow relationships
    // =========================================================================

    /// Record `actor_id` as an accepted follower of `target_id`
    ///
    /// Keyed by the ordered pair: repeating the call updates the inbox and
    /// state in place. Returns `true` only when a new row was created.
    pub async fn upsert_follower(
        &self,
        actor_id: &str,
        target_id: &str,
        inbox: &str,
        activity_id: Option<&str>,
    ) -> Result<bool, AppError> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;

        let result: Result<bool, AppError> = async {
            let existed = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM follows WHERE actor_id = ? AND target_id = ?",
            )
            .bind(actor_id)
            .bind(target_id)
            .fetch_one(&mut *conn)
            .await?
                > 0;

            sqlx::query(
                r#"
                INSERT INTO follows (actor_id, target_id, state, activity_id, inbox, created_at)
                VALUES (?, ?, 'accepted', ?, ?, ?)
                ON CONFLICT(actor_id, target_id)
                DO UPDATE SET state = 'accepted', inbox = excluded.inbox
                "#,
            )
            .bind(actor_id)
            .bind(target_id)
            .bind(activity_id)
            .bind(inbox)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await?;

            Ok(!existed)
        }
        .await;

        finish(&mut conn, result).await
    }

    /// Record an outbound Follow awaiting Accept
    ///
    /// Returns `false` when any relationship for the pair already exists.
    pub async fn insert_pending_follow(
        &self,
        actor_id: &str,
        target_id: &str,
        target_inbox: &str,
        activity_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO follows (actor_id, target_id, state, activity_id, inbox, created_at)
            VALUES (?, ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(actor_id)
        .bind(target_id)
        .bind(activity_id)
        .bind(target_inbox)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark an existing relationship accepted; `false` if none exists
    pub async fn accept_follow(&self, actor_id: &str, target_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE follows SET state = 'accepted' WHERE actor_id = ? AND target_id = ?",
        )
        .bind(actor_id)
        .bind(target_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop a relationship only while it is still pending
    pub async fn clear_pending_follow(
        &self,
        actor_id: &str,
        target_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM follows WHERE actor_id = ? AND target_id = ? AND state = 'pending'",
        )
        .bind(actor_id)
        .bind(target_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Drop a relationship in any state
    pub async fn remove_follow(&self, actor_id: &str, target_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM follows WHERE actor_id = ? AND target_id = ?")
            .bind(actor_id)
            .bind(target_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Relationship for the ordered pair, if any
    pub async fn get_follow(
        &self,
        actor_id: &str,
        target_id: &str,
    ) -> Result<Option<FollowRelation>, AppError> {
        let relation = sqlx::query_as::<_, FollowRelation>(
            "SELECT * FROM follows WHERE actor_id = ? AND target_id = ?",
        )
        .bind(actor_id)
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(relation)
    }

    /// Accepted follower Ids of a target
    pub async fn list_followers(&self, target_id: &str) -> Result<Vec<String>, AppError> {
        let followers = sqlx::query_scalar::<_, String>(
            "SELECT actor_id FROM follows WHERE target_id = ? AND state = 'accepted' ORDER BY created_at",
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(followers)
    }

    /// Accepted follow targets of an actor
    pub async fn list_following(&self, actor_id: &str) -> Result<Vec<String>, AppError> {
        let following = sqlx::query_scalar::<_, String>(
            "SELECT target_id FROM follows WHERE actor_id = ? AND state = 'accepted' ORDER BY created_at",
        )
        .bind(actor_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(following)
    }

    /// Get follower inbox URIs for activity delivery
    pub async fn get_follower_inboxes(&self, target_id: &str) -> Result<Vec<String>, AppError> {
        let inboxes = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT inbox FROM follows WHERE target_id = ? AND state = 'accepted'",
        )
        .bind(target_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(inboxes)
    }

    // =========================================================================
    // Inbound activity log
    // =========================================================================

    /// Record an inbound activity Id; `false` if it was already applied
    pub async fn record_inbound_activity(
        &self,
        id: &str,
        kind: &str,
        actor_id: &str,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO inbound_activities (id, kind, actor_id, received_at) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(kind)
        .bind(actor_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Forget an inbound activity Id so a failed application can be retried
    pub async fn forget_inbound_activity(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM inbound_activities WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // =========================================================================
    // Captchas
    // =========================================================================

    pub async fn insert_captcha(&self, token: &str, code: &str) -> Result<(), AppError> {
        sqlx::query("INSERT OR REPLACE INTO captchas (token, code, created_at) VALUES (?, ?, ?)")
            .bind(token)
            .bind(code)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Remove a captcha and insert its replacement atomically
    ///
    /// Returns the stored code, or `None` when the token is unknown (in which
    /// case nothing is replaced).
    pub async fn consume_captcha(
        &self,
        token: &str,
        replacement: (&str, &str),
    ) -> Result<Option<String>, AppError> {
        let mut conn = self.pool.acquire().await?;
        begin_immediate(&mut conn).await?;

        let result: Result<Option<String>, AppError> = async {
            let code = sqlx::query_scalar::<_, String>("SELECT code FROM captchas WHERE token = ?")
                .bind(token)
                .fetch_optional(&mut *conn)
                .await?;

            if code.is_some() {
                sqlx::query("DELETE FROM captchas WHERE token = ?")
                    .bind(token)
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("INSERT INTO captchas (token, code, created_at) VALUES (?, ?, ?)")
                    .bind(replacement.0)
                    .bind(replacement.1)
                    .bind(Utc::now())
                    .execute(&mut *conn)
                    .await?;
            }

            Ok(code)
        }
        .await;

        finish(&mut conn, result).await
    }

    pub async fn count_captchas(&self) -> Result<i64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM captchas")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    // =========================================================================
    // Blacklist
    // =========================================================================

    /// Add a pattern; `None` when it already exists
    pub async fn add_blacklist_pattern(&self, pattern: &str) -> Result<Option<i64>, AppError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT OR IGNORE INTO blacklist (pattern, created_at) VALUES (?, ?) RETURNING id",
        )
        .bind(pattern)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn remove_blacklist_pattern(&self, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM blacklist WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_blacklist(&self) -> Result<Vec<BlacklistEntry>, AppError> {
        let entries =
            sqlx::query_as::<_, BlacklistEntry>("SELECT * FROM blacklist ORDER BY id")
                .fetch_all(&self.pool)
                .await?;

        Ok(entries)
    }

    // =========================================================================
    // Delete passwords
    // =========================================================================

    pub async fn store_post_secret(&self, post_id: &str, secret_hash: &str) -> Result<(), AppError> {
        sqlx::query("INSERT OR REPLACE INTO post_secrets (post_id, secret_hash) VALUES (?, ?)")
            .bind(post_id)
            .bind(secret_hash)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get_post_secret(&self, post_id: &str) -> Result<Option<String>, AppError> {
        let hash =
            sqlx::query_scalar::<_, String>("SELECT secret_hash FROM post_secrets WHERE post_id = ?")
                .bind(post_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(hash)
    }

    // =========================================================================
    // Posters and bans
    // =========================================================================

    pub async fn store_poster_hash(&self, post_id: &str, poster_hash: &str) -> Result<(), AppError> {
        sqlx::query("INSERT OR REPLACE INTO post_posters (post_id, poster_hash) VALUES (?, ?)")
            .bind(post_id)
            .bind(poster_hash)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get_poster_hash(&self, post_id: &str) -> Result<Option<String>, AppError> {
        let hash =
            sqlx::query_scalar::<_, String>("SELECT poster_hash FROM post_posters WHERE post_id = ?")
                .bind(post_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(hash)
    }

    pub async fn insert_ban(
        &self,
        poster_hash: &str,
        reason: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, AppError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO bans (poster_hash, reason, created_at, expires_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(poster_hash)
        .bind(reason)
        .bind(Utc::now())
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Longest ban in force for a poster at `now`
    pub async fn active_ban(&self, poster_hash: &str, now: DateTime<Utc>) -> Result<Option<Ban>, AppError> {
        let ban = sqlx::query_as::<_, Ban>(
            "SELECT * FROM bans WHERE poster_hash = ? AND expires_at > ? ORDER BY expires_at DESC LIMIT 1",
        )
        .bind(poster_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(ban)
    }

    pub async fn list_bans(&self, now: DateTime<Utc>) -> Result<Vec<Ban>, AppError> {
        let bans = sqlx::query_as::<_, Ban>("SELECT * FROM bans WHERE expires_at > ? ORDER BY id")
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        Ok(bans)
    }

    pub async fn remove_ban(&self, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM bans WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Reports
    // =========================================================================

    pub async fn insert_report(&self, post_id: &str, board_id: &str, reason: &str) -> Result<i64, AppError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO reports (post_id, board_id, reason, created_at) VALUES (?, ?, ?, ?) RETURNING id",
        )
        .bind(post_id)
        .bind(board_id)
        .bind(reason)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn list_reports(&self, board_id: &str) -> Result<Vec<Report>, AppError> {
        let reports = sqlx::query_as::<_, Report>("SELECT * FROM reports WHERE board_id = ? ORDER BY id")
            .bind(board_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(reports)
    }

    /// Close a report on a board
    pub async fn delete_report(&self, board_id: &str, id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM reports WHERE id = ? AND board_id = ?")
            .bind(id)
            .bind(board_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

// =============================================================================
// Transaction helpers
// =============================================================================

/// Canonical InReplyTo: thread root first, no self reference, no duplicates
async fn canonical_links(
    conn: &mut PoolConnection<Sqlite>,
    post_id: &str,
    in_reply_to: &[String],
) -> Result<Vec<String>, AppError> {
    let mut links: Vec<String> = in_reply_to
        .iter()
        .filter(|target| target.as_str() != post_id && !target.is_empty())
        .cloned()
        .collect();

    if let Some(first) = links.first().cloned() {
        let root = sqlx::query_scalar::<_, Option<String>>("SELECT thread_id FROM posts WHERE id = ?")
            .bind(&first)
            .fetch_optional(&mut **conn)
            .await?
            .flatten();

        if let Some(root) = root {
            if root != post_id {
                links.insert(0, root);
            }
        }
    }

    dedup_in_order(&mut links);
    Ok(links)
}

async fn count_live_threads(
    conn: &mut PoolConnection<Sqlite>,
    board_id: &str,
) -> Result<usize, AppError> {
    let live = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM posts WHERE board_id = ? AND thread_id IS NULL AND archived = 0 AND tombstoned = 0",
    )
    .bind(board_id)
    .fetch_one(&mut **conn)
    .await?;

    Ok(live.max(0) as usize)
}

/// Unarchive the most recently bumped archived thread if the window has room
async fn unarchive_within(
    conn: &mut PoolConnection<Sqlite>,
    board_id: &str,
    window: usize,
) -> Result<Option<String>, AppError> {
    if count_live_threads(conn, board_id).await? >= window {
        return Ok(None);
    }

    let candidate = sqlx::query_scalar::<_, String>(
        "SELECT id FROM posts \
         WHERE board_id = ? AND thread_id IS NULL AND archived = 1 AND tombstoned = 0 \
         ORDER BY updated DESC LIMIT 1",
    )
    .bind(board_id)
    .fetch_optional(&mut **conn)
    .await?;

    if let Some(id) = &candidate {
        sqlx::query("UPDATE posts SET archived = 0 WHERE id = ?")
            .bind(id)
            .execute(&mut **conn)
            .await?;
    }

    Ok(candidate)
}

fn dedup_in_order(ids: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
}
