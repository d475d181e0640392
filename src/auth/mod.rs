//! Moderator authentication
//!
//! Moderation endpoints accept a single bearer token from configuration.

mod middleware;

pub use middleware::Moderator;
