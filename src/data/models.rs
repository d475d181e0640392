//! Data models
//!
//! Rust structs representing database entities.
//! Actors and posts are keyed by their federation URI; auxiliary
//! identifiers use ULID and timestamps use chrono.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

// =============================================================================
// ID Types
// =============================================================================

/// Entity ID wrapper (ULID format, 26 characters)
///
/// Example: "01ARZ3NDEKTSV4RRFFQ69G5FAV"
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Generate a new ULID
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of the random slug at the end of a post Id
pub const POST_SLUG_LEN: usize = 8;

/// Generate a post Id under a board: `{board_id}/{SLUG}`
pub fn new_post_id(board_id: &str) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    let slug: String = (0..POST_SLUG_LEN)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("{}/{}", board_id.trim_end_matches('/'), slug)
}

/// Last path segment of an Id
pub fn id_slug(id: &str) -> &str {
    id.trim_end_matches('/').rsplit('/').next().unwrap_or(id)
}

/// Top-level paths served by the node itself
const RESERVED_BOARD_NAMES: &[&str] = &[
    "admin", "followers", "following", "health", "inbox", "metrics", "outbox", "public",
];

/// Board names are short path segments
pub fn is_valid_board_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED_BOARD_NAMES.contains(&name)
}

// =============================================================================
// Actor
// =============================================================================

/// A federated identity: the instance actor, a local board, or a cached
/// remote actor.
///
/// Local actors carry their private key; remote descriptors never do.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Actor {
    pub id: String,
    pub name: String,
    pub preferred_username: String,
    pub summary: String,
    pub inbox: String,
    pub outbox: String,
    pub following: String,
    pub followers: String,
    pub public_key_pem: Option<String>,
    #[serde(skip)]
    pub private_key_pem: Option<String>,
    pub restricted: bool,
    pub auto_subscribe: bool,
    pub is_instance: bool,
    pub created_at: DateTime<Utc>,
}

impl Actor {
    /// Key Id advertised in the actor document and used in signatures
    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.id)
    }

    /// Whether this actor is hosted here (has signing material)
    pub fn is_local(&self) -> bool {
        self.private_key_pem.is_some()
    }
}

// =============================================================================
// Post
// =============================================================================

/// Object type stored for a post
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum PostType {
    Note,
    Tombstone,
}

/// A post (OP or reply)
///
/// `in_reply_to` is loaded from `post_links`; index 0 is the thread root.
/// An empty list marks the post as an OP.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Post {
    pub id: String,
    pub board_id: String,
    pub thread_id: Option<String>,
    pub object_type: PostType,
    /// Subject line
    pub name: String,
    /// Poster name
    pub attributed_to: String,
    /// `!code` or `!!code` derived from the poster's secret
    pub tripcode: String,
    pub content: String,
    pub alias: String,
    /// `;`-joined option flags
    pub options: String,
    pub sensitive: bool,
    pub sticky: bool,
    pub locked: bool,
    pub archived: bool,
    pub tombstoned: bool,
    pub media_href: Option<String>,
    pub media_type: Option<String>,
    pub media_name: Option<String>,
    pub media_size: Option<i64>,
    pub is_local: bool,
    pub published: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    #[sqlx(skip)]
    pub in_reply_to: Vec<String>,
}

impl Post {
    /// New empty note on a board
    pub fn new_note(id: String, board_id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            board_id,
            thread_id: None,
            object_type: PostType::Note,
            name: String::new(),
            attributed_to: String::new(),
            tripcode: String::new(),
            content: String::new(),
            alias: String::new(),
            options: String::new(),
            sensitive: false,
            sticky: false,
            locked: false,
            archived: false,
            tombstoned: false,
            media_href: None,
            media_type: None,
            media_name: None,
            media_size: None,
            is_local: false,
            published: now,
            updated: now,
            deleted_at: None,
            in_reply_to: Vec::new(),
        }
    }

    pub fn is_op(&self) -> bool {
        self.in_reply_to.is_empty()
    }

    /// Thread root: the post itself for an OP
    pub fn op_id(&self) -> &str {
        self.in_reply_to.first().map(String::as_str).unwrap_or(&self.id)
    }

    pub fn has_media(&self) -> bool {
        self.media_href.is_some()
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options.split(';').any(|o| o == option)
    }
}

// =============================================================================
// Follow relationship
// =============================================================================

/// Handshake state of a follow relationship
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FollowState {
    Pending,
    Accepted,
}

/// `actor_id` follows `target_id`; `inbox` belongs to `actor_id`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FollowRelation {
    pub actor_id: String,
    pub target_id: String,
    pub state: FollowState,
    pub activity_id: Option<String>,
    pub inbox: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Moderation
// =============================================================================

/// Blacklist pattern row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BlacklistEntry {
    pub id: i64,
    pub pattern: String,
    pub created_at: DateTime<Utc>,
}

/// Poster ban keyed by the hashed address
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Ban {
    pub id: i64,
    #[serde(skip)]
    pub poster_hash: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Open report against a post
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Report {
    pub id: i64,
    pub post_id: String,
    pub board_id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Result of a tombstone cascade
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TombstoneOutcome {
    /// Ids that were live and are now tombstoned
    pub tombstoned: Vec<String>,
    /// Thread returned from the archive to refill the window
    pub unarchived: Option<String>,
}
