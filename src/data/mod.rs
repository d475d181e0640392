//! Data layer module
//!
//! Handles all data persistence and caching:
//! - SQLite database operations
//! - Board cache (volatile, refreshed after board/follow mutations)

mod cache;
mod database;
mod models;

pub use cache::BoardCache;
pub use database::Database;
pub use models::*;

#[cfg(test)]
mod database_test;
