//! Local actor service
//!
//! Creates the instance actor and boards. Every local actor gets its own
//! RSA keypair at creation; existing actors are never re-keyed.

use std::sync::Arc;

use crate::data::{Actor, BoardCache, Database, is_valid_board_name};
use crate::error::AppError;

/// Fields of a board to create
#[derive(Debug, Clone)]
pub struct NewBoard {
    pub name: String,
    pub title: String,
    pub summary: String,
    pub restricted: bool,
}

pub struct ActorService {
    db: Arc<Database>,
    boards: Arc<BoardCache>,
    base_url: String,
    key_bits: usize,
}

impl ActorService {
    pub fn new(db: Arc<Database>, boards: Arc<BoardCache>, base_url: String, key_bits: usize) -> Self {
        Self {
            db,
            boards,
            base_url: base_url.trim_end_matches('/').to_string(),
            key_bits,
        }
    }

    /// Create the instance actor (Id = base URL) when missing
    pub async fn ensure_instance_actor(&self, title: &str, summary: &str) -> Result<Actor, AppError> {
        if let Some(instance) = self.db.get_instance_actor().await? {
            tracing::info!(actor = %instance.id, "Instance actor exists");
            return Ok(instance);
        }

        // Empty name never collides with a board name
        let actor = self
            .build_actor(self.base_url.clone(), "", title, summary, false, true)
            .await?;
        self.db.insert_actor(&actor).await?;
        tracing::info!(actor = %actor.id, "Instance actor created");
        Ok(actor)
    }

    /// Create a board unless one with that name exists
    ///
    /// Returns `None` when the board already existed.
    pub async fn create_board(&self, board: &NewBoard) -> Result<Option<Actor>, AppError> {
        let name = board.name.trim();
        if !is_valid_board_name(name) {
            return Err(AppError::Validation(format!("Invalid board name: {}", name)));
        }
        // Fast-path guard before expensive key generation.
        if self.db.get_actor_by_name(name).await?.is_some() {
            return Ok(None);
        }

        let title = if board.title.trim().is_empty() { name } else { board.title.trim() };
        let actor = self
            .build_actor(
                format!("{}/{}", self.base_url, name),
                name,
                title,
                &board.summary,
                board.restricted,
                false,
            )
            .await?;

        if !self.db.insert_actor(&actor).await? {
            return Ok(None);
        }
        self.boards.refresh().await?;
        tracing::info!(board = %actor.id, "Board created");
        Ok(Some(actor))
    }

    async fn build_actor(
        &self,
        id: String,
        name: &str,
        preferred_username: &str,
        summary: &str,
        restricted: bool,
        is_instance: bool,
    ) -> Result<Actor, AppError> {
        let (private_key_pem, public_key_pem) = generate_keypair(self.key_bits).await?;

        Ok(Actor {
            inbox: format!("{}/inbox", id),
            outbox: format!("{}/outbox", id),
            following: format!("{}/following", id),
            followers: format!("{}/followers", id),
            id,
            name: name.to_string(),
            preferred_username: preferred_username.to_string(),
            summary: summary.to_string(),
            public_key_pem: Some(public_key_pem),
            private_key_pem: Some(private_key_pem),
            restricted,
            auto_subscribe: false,
            is_instance,
            created_at: chrono::Utc::now(),
        })
    }
}

/// PKCS#8 private and SPKI public PEM of a fresh RSA key
pub async fn generate_keypair(bits: usize) -> Result<(String, String), AppError> {
    tokio::task::spawn_blocking(move || -> Result<(String, String), anyhow::Error> {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        use rsa::{RsaPrivateKey, RsaPublicKey};

        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)?;
        let public_key = RsaPublicKey::from(&private_key);
        let private_key_pem = private_key.to_pkcs8_pem(LineEnding::LF)?.to_string();
        let public_key_pem = public_key.to_public_key_pem(LineEnding::LF)?;
        Ok((private_key_pem, public_key_pem))
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))?
    .map_err(AppError::Internal)
}
