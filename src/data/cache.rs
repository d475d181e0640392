//! Board cache
//!
//! Read-mostly snapshot of the local boards and the instance actor's
//! following list. Components hold an `Arc<BoardCache>` and call
//! [`BoardCache::refresh`] after a Follow or New-board mutation.

use std::sync::Arc;
use tokio::sync::RwLock;

use super::{Actor, Database};
use crate::error::AppError;

#[derive(Debug, Clone, Default)]
struct Snapshot {
    boards: Vec<Actor>,
    instance_following: Vec<String>,
}

pub struct BoardCache {
    db: Arc<Database>,
    snapshot: RwLock<Snapshot>,
}

impl BoardCache {
    /// Create an empty cache; call `refresh` before first use
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    /// Reload boards and the instance following list from storage
    pub async fn refresh(&self) -> Result<(), AppError> {
        let boards = self.db.list_boards().await?;
        let instance_following = match self.db.get_instance_actor().await? {
            Some(instance) => self.db.list_following(&instance.id).await?,
            None => Vec::new(),
        };

        let mut snapshot = self.snapshot.write().await;
        tracing::debug!(boards = boards.len(), "Board cache refreshed");
        *snapshot = Snapshot {
            boards,
            instance_following,
        };

        Ok(())
    }

    pub async fn boards(&self) -> Vec<Actor> {
        self.snapshot.read().await.boards.clone()
    }

    /// Look up a local board by short name
    pub async fn get(&self, name: &str) -> Option<Actor> {
        use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL};

        let found = self
            .snapshot
            .read()
            .await
            .boards
            .iter()
            .find(|b| b.name == name)
            .cloned();

        if found.is_some() {
            CACHE_HITS_TOTAL.with_label_values(&["boards"]).inc();
        } else {
            CACHE_MISSES_TOTAL.with_label_values(&["boards"]).inc();
        }
        found
    }

    /// Look up a local board by actor Id
    pub async fn get_by_id(&self, id: &str) -> Option<Actor> {
        self.snapshot
            .read()
            .await
            .boards
            .iter()
            .find(|b| b.id == id)
            .cloned()
    }

    /// Remote actors the instance actor follows
    pub async fn instance_following(&self) -> Vec<String> {
        self.snapshot.read().await.instance_following.clone()
    }
}
