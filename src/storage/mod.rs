//! Attachment storage module
//!
//! Handles:
//! - Writing uploaded attachments to the media directory
//! - Detecting attachment types from file contents

mod media;

pub use media::{MediaStorage, PUBLIC_PREFIX, StoredMedia, sniff_media_type};
