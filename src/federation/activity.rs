//! Activity wire types
//!
//! Inbound JSON-LD is parsed into [`Activity`] with a closed [`ActivityKind`];
//! unknown kinds are rejected at parse time. Outbound documents are built by
//! the functions in [`builder`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::data::{Actor, EntityId, Post, PostType};
use crate::error::AppError;

pub const ACTIVITY_STREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";
pub const ACTIVITY_CONTENT_TYPE: &str = "application/activity+json";
pub const LD_CONTENT_TYPE: &str =
    "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";

/// Whether an Accept or Content-Type header asks for activity JSON
pub fn is_activity_media_type(value: &str) -> bool {
    value.contains("application/activity+json")
        || (value.contains("application/ld+json") && value.contains("activitystreams"))
}

// =============================================================================
// Activity kind
// =============================================================================

/// Activity kinds this node understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Create,
    Delete,
    Follow,
    Accept,
    Reject,
    Update,
    /// Board creation request
    New,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Delete => "Delete",
            Self::Follow => "Follow",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::Update => "Update",
            Self::New => "New",
        }
    }
}

impl FromStr for ActivityKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Create" => Ok(Self::Create),
            "Delete" => Ok(Self::Delete),
            "Follow" => Ok(Self::Follow),
            "Accept" => Ok(Self::Accept),
            "Reject" => Ok(Self::Reject),
            "Update" => Ok(Self::Update),
            "New" => Ok(Self::New),
            other => Err(AppError::Validation(format!(
                "Unknown activity type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// A parsed activity
#[derive(Debug, Clone)]
pub struct Activity {
    pub id: Option<String>,
    pub kind: ActivityKind,
    pub actor: String,
    pub object: ActivityObject,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub published: Option<DateTime<Utc>>,
    /// Document as received, echoed back in Accept/Reject
    pub raw: Value,
}

impl Activity {
    /// Parse an activity document
    ///
    /// Requires `type` (one of [`ActivityKind`]), `actor` and `object`.
    pub fn from_value(value: &Value) -> Result<Self, AppError> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Validation("Missing activity type".to_string()))?
            .parse::<ActivityKind>()?;

        let actor = value
            .get("actor")
            .and_then(|actor| collect_ids(actor).into_iter().next())
            .ok_or_else(|| AppError::Validation("Missing actor".to_string()))?;

        let object = value
            .get("object")
            .map(ActivityObject::from_value)
            .ok_or_else(|| AppError::Validation("Missing object".to_string()))?;

        Ok(Self {
            id: value.get("id").and_then(Value::as_str).map(str::to_string),
            kind,
            actor,
            object,
            to: value.get("to").map(collect_ids).unwrap_or_default(),
            cc: value.get("cc").map(collect_ids).unwrap_or_default(),
            published: value
                .get("published")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|d| d.with_timezone(&Utc)),
            raw: value.clone(),
        })
    }

    /// To and Cc with duplicates removed, To first
    pub fn recipients(&self) -> Vec<String> {
        let mut all = Vec::with_capacity(self.to.len() + self.cc.len());
        for id in self.to.iter().chain(self.cc.iter()) {
            if !all.contains(id) {
                all.push(id.clone());
            }
        }
        all
    }
}

/// Object of an activity, by shape
#[derive(Debug, Clone)]
pub enum ActivityObject {
    /// Bare Id
    Reference(String),
    Post(Box<PostObject>),
    Actor(Box<ActorObject>),
    Activity(Box<Activity>),
    Other(Value),
}

impl ActivityObject {
    pub fn from_value(value: &Value) -> Self {
        if let Some(id) = value.as_str() {
            return Self::Reference(id.to_string());
        }

        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind.parse::<ActivityKind>().is_ok() {
            return match Activity::from_value(value) {
                Ok(nested) => Self::Activity(Box::new(nested)),
                Err(_) => Self::Other(value.clone()),
            };
        }

        match kind {
            "Note" | "Tombstone" | "Page" | "Article" => {
                serde_json::from_value::<PostObject>(value.clone())
                    .map(|post| Self::Post(Box::new(post)))
                    .unwrap_or_else(|_| Self::Other(value.clone()))
            }
            "Group" | "Service" | "Person" | "Application" | "Organization" => {
                serde_json::from_value::<ActorObject>(value.clone())
                    .map(|actor| Self::Actor(Box::new(actor)))
                    .unwrap_or_else(|_| Self::Other(value.clone()))
            }
            _ => Self::Other(value.clone()),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Reference(id) => Some(id),
            Self::Post(post) => Some(&post.id),
            Self::Actor(actor) => Some(&actor.id),
            Self::Activity(activity) => activity.id.as_deref(),
            Self::Other(value) => value.get("id").and_then(Value::as_str),
        }
    }

    pub fn as_activity(&self) -> Option<&Activity> {
        match self {
            Self::Activity(activity) => Some(activity),
            _ => None,
        }
    }
}

/// Ids from a string, an `{id}` object, or an array of either
pub fn collect_ids(value: &Value) -> Vec<String> {
    match value {
        Value::String(id) => vec![id.clone()],
        Value::Object(map) => map
            .get("id")
            .and_then(Value::as_str)
            .map(|id| vec![id.to_string()])
            .unwrap_or_default(),
        Value::Array(items) => items.iter().flat_map(collect_ids).collect(),
        _ => Vec::new(),
    }
}

fn id_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().map(collect_ids).unwrap_or_default())
}

fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        Some(OneOrMany::One(item)) => vec![item],
        Some(OneOrMany::Many(items)) => items,
        None => Vec::new(),
    })
}

// =============================================================================
// Objects
// =============================================================================

/// A post as it travels between nodes
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostObject {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    /// Board the post belongs to
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub attributed_to: String,
    #[serde(default)]
    pub tripcode: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub option: Vec<String>,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, deserialize_with = "id_list")]
    pub in_reply_to: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub attachment: Vec<AttachmentObject>,
    #[serde(default)]
    pub replies: Option<Value>,
    #[serde(default)]
    pub published: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentObject {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
}

impl PostObject {
    /// Ids listed in the `replies` collection
    pub fn reply_ids(&self) -> Vec<String> {
        let Some(replies) = &self.replies else {
            return Vec::new();
        };
        replies
            .get("orderedItems")
            .or_else(|| replies.get("items"))
            .map(collect_ids)
            .unwrap_or_default()
    }

    /// Convert a remote object into a storable post for `board_id`
    ///
    /// Markup from remote peers is sanitized.
    pub fn to_post(&self, board_id: &str) -> Post {
        let mut post = Post::new_note(self.id.clone(), board_id.to_string());
        let now = Utc::now();

        post.name = ammonia::clean(&self.name);
        post.content = ammonia::clean(&self.content);
        post.attributed_to = ammonia::clean(&self.attributed_to);
        post.tripcode = ammonia::clean(&self.tripcode);
        post.alias = self.alias.clone();
        post.options = self.option.join(";");
        post.sensitive = self.sensitive;
        post.in_reply_to = self.in_reply_to.clone();
        post.published = self.published.unwrap_or(now);
        post.updated = self.updated.unwrap_or(post.published);
        post.is_local = false;

        if self.kind == "Tombstone" {
            post.object_type = PostType::Tombstone;
            post.tombstoned = true;
        }
        if let Some(attachment) = self.attachment.first() {
            post.media_href = attachment.href.clone();
            post.media_type = attachment.media_type.clone();
            post.media_name = attachment.name.clone();
            post.media_size = attachment.size;
        }

        post
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyObject {
    pub id: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub public_key_pem: String,
}

/// A remote actor document
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorObject {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    pub inbox: String,
    #[serde(default)]
    pub outbox: Option<String>,
    #[serde(default)]
    pub following: Option<String>,
    #[serde(default)]
    pub followers: Option<String>,
    #[serde(default)]
    pub restricted: bool,
    #[serde(default)]
    pub public_key: Option<PublicKeyObject>,
}

impl ActorObject {
    /// Descriptor for a remote actor; never carries signing material
    pub fn into_actor(self) -> Actor {
        let fallback_name = crate::data::id_slug(&self.id).to_string();
        let preferred_username = self
            .preferred_username
            .clone()
            .unwrap_or_else(|| fallback_name.clone());

        Actor {
            name: self.name.unwrap_or_else(|| preferred_username.clone()),
            preferred_username,
            summary: self.summary.unwrap_or_default(),
            outbox: self.outbox.unwrap_or_else(|| format!("{}/outbox", self.id)),
            following: self
                .following
                .unwrap_or_else(|| format!("{}/following", self.id)),
            followers: self
                .followers
                .unwrap_or_else(|| format!("{}/followers", self.id)),
            public_key_pem: self.public_key.map(|key| key.public_key_pem),
            private_key_pem: None,
            restricted: self.restricted,
            auto_subscribe: false,
            is_instance: self.kind == "Service" || self.kind == "Application",
            created_at: Utc::now(),
            inbox: self.inbox,
            id: self.id,
        }
    }
}

// =============================================================================
// Outbound documents
// =============================================================================

pub mod builder {
    use super::*;
    use serde_json::json;

    fn activity_id(actor_id: &str) -> String {
        format!("{}/activities/{}", actor_id, EntityId::new().0)
    }

    /// Follow `target_id` on behalf of `actor`
    pub fn follow(actor: &Actor, target_id: &str) -> Value {
        json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": activity_id(&actor.id),
            "type": "Follow",
            "actor": actor.id,
            "object": target_id,
            "to": [target_id],
        })
    }

    /// Accept an inbound Follow, embedding it as received
    pub fn accept(actor: &Actor, follow: &Value, follower_id: &str) -> Value {
        json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": activity_id(&actor.id),
            "type": "Accept",
            "actor": actor.id,
            "object": follow,
            "to": [follower_id],
        })
    }

    /// Reject an activity; `actor_id` need not be a local actor
    pub fn reject(actor_id: &str, object: &Value, to: &str) -> Value {
        json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": activity_id(actor_id),
            "type": "Reject",
            "actor": actor_id,
            "object": object,
            "to": [to],
        })
    }

    /// Wrap a note in a Create addressed to the board's followers
    pub fn create(actor: &Actor, note: Value, to: &[String]) -> Value {
        json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": activity_id(&actor.id),
            "type": "Create",
            "actor": actor.id,
            "object": note,
            "to": to,
            "cc": [actor.followers],
            "published": Utc::now().to_rfc3339(),
        })
    }

    /// Delete a post; `replies` lists the Ids tombstoned with it
    pub fn delete(actor: &Actor, post_id: &str, replies: &[String]) -> Value {
        json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "id": activity_id(&actor.id),
            "type": "Delete",
            "actor": actor.id,
            "object": {
                "type": "Tombstone",
                "id": post_id,
                "replies": {
                    "type": "OrderedCollection",
                    "totalItems": replies.len(),
                    "orderedItems": replies.iter().map(|id| json!({"id": id})).collect::<Vec<_>>(),
                },
            },
            "to": [actor.followers],
        })
    }

    /// Wire form of a stored post
    pub fn note(post: &Post) -> Value {
        let kind = match post.object_type {
            PostType::Note => "Note",
            PostType::Tombstone => "Tombstone",
        };
        let options: Vec<&str> = post.options.split(';').filter(|o| !o.is_empty()).collect();

        let mut note = json!({
            "type": kind,
            "id": post.id,
            "actor": post.board_id,
            "name": post.name,
            "content": post.content,
            "attributedTo": post.attributed_to,
            "tripcode": post.tripcode,
            "alias": post.alias,
            "option": options,
            "sensitive": post.sensitive,
            "sticky": post.sticky,
            "locked": post.locked,
            "published": post.published.to_rfc3339(),
            "updated": post.updated.to_rfc3339(),
            "inReplyTo": post.in_reply_to.iter().map(|id| json!({"id": id})).collect::<Vec<_>>(),
        });

        if let (Some(href), Some(map)) = (&post.media_href, note.as_object_mut()) {
            map.insert(
                "attachment".to_string(),
                json!([{
                    "type": "Document",
                    "mediaType": post.media_type,
                    "href": href,
                    "name": post.media_name,
                    "size": post.media_size,
                }]),
            );
        }

        note
    }

    /// Note with its replies embedded as an ordered collection
    pub fn thread(op: &Post, replies: &[Post]) -> Value {
        let mut document = note(op);
        if let Some(map) = document.as_object_mut() {
            map.insert(
                "replies".to_string(),
                json!({
                    "type": "OrderedCollection",
                    "totalItems": replies.len(),
                    "totalImgs": replies.iter().filter(|r| r.has_media()).count(),
                    "orderedItems": replies.iter().map(note).collect::<Vec<_>>(),
                }),
            );
        }
        document
    }

    /// Actor document for a local board or the instance actor
    pub fn actor_document(actor: &Actor) -> Value {
        json!({
            "@context": [ACTIVITY_STREAMS_CONTEXT, SECURITY_CONTEXT],
            "type": if actor.is_instance { "Service" } else { "Group" },
            "id": actor.id,
            "name": actor.name,
            "preferredUsername": actor.preferred_username,
            "summary": actor.summary,
            "inbox": actor.inbox,
            "outbox": actor.outbox,
            "following": actor.following,
            "followers": actor.followers,
            "restricted": actor.restricted,
            "publicKey": {
                "id": actor.key_id(),
                "owner": actor.id,
                "publicKeyPem": actor.public_key_pem,
            },
        })
    }

    /// Unordered collection of Ids
    pub fn id_collection(id: &str, items: &[String]) -> Value {
        json!({
            "@context": ACTIVITY_STREAMS_CONTEXT,
            "type": "Collection",
            "id": id,
            "totalItems": items.len(),
            "items": items.iter().map(|item| json!({"id": item})).collect::<Vec<_>>(),
        })
    }
}
