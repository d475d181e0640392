//! Federation engine
//!
//! Handles:
//! - Wire documents and the closed set of activity kinds
//! - HTTP Signatures and the outbound host guard
//! - Actor resolution and WebFinger discovery
//! - Reply reference parsing and thread resolution
//! - The follow handshake
//! - Inbound dispatch and outbound delivery

pub mod activity;
mod delivery;
mod directory;
mod follow;
mod inbox;
pub mod reply;
pub mod signature;
mod verifier;

pub use activity::{Activity, ActivityKind, ActivityObject, PostObject};
pub use delivery::{DeliveryDispatcher, InboxClient, InboxLookup, Signer, Task};
pub use directory::{ActorDirectory, WebFingerLink, WebFingerResponse, webfinger_document};
pub use follow::{FollowCoordinator, FollowOutcome, ToggleOutcome};
pub use inbox::{InboxDispatcher, InboxOutcome};
pub use reply::{LinkClass, RemoteObjects, ReplyResolver, Resolution};
pub use signature::{checked_remote_url, key_id_matches_actor, sign_request, verify_signature};
pub use verifier::{SignatureVerifier, SignedRequest};
