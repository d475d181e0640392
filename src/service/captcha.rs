//! Single-use captcha store
//!
//! A submission carries `token:answer`. Checking a token always consumes it
//! and puts a fresh captcha in its place, whether the answer was right or
//! not, so the pool keeps its size and no code can be replayed.

use rand::Rng;
use std::sync::Arc;

use crate::data::{Database, EntityId};
use crate::error::AppError;

const CODE_LEN: usize = 6;
const CODE_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";

/// A generated captcha; rendering the code as an image happens elsewhere
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captcha {
    pub token: String,
    pub code: String,
}

impl Captcha {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let code = (0..CODE_LEN)
            .map(|_| CODE_CHARSET[rng.gen_range(0..CODE_CHARSET.len())] as char)
            .collect();
        Self {
            token: EntityId::new().0,
            code,
        }
    }
}

pub struct CaptchaStore {
    db: Arc<Database>,
    pool_size: usize,
}

impl CaptchaStore {
    pub fn new(db: Arc<Database>, pool_size: usize) -> Self {
        Self { db, pool_size }
    }

    /// Top the pool up to its configured size
    pub async fn ensure_pool(&self) -> Result<usize, AppError> {
        let existing = self.db.count_captchas().await?.max(0) as usize;
        let missing = self.pool_size.saturating_sub(existing);

        for _ in 0..missing {
            self.issue().await?;
        }
        if missing > 0 {
            tracing::info!(created = missing, "Captcha pool refilled");
        }
        Ok(missing)
    }

    /// Create and store a new captcha
    pub async fn issue(&self) -> Result<Captcha, AppError> {
        let captcha = Captcha::generate();
        self.db.insert_captcha(&captcha.token, &captcha.code).await?;
        Ok(captcha)
    }

    /// Check a `token:answer` pair, consuming the token
    pub async fn validate(&self, raw: &str) -> Result<(), AppError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AppError::Refused("No captcha provided".to_string()));
        }

        let Some((token, answer)) = raw.split_once(':') else {
            return Err(incorrect());
        };
        let (token, answer) = (token.trim(), answer.trim());
        if token.is_empty() || answer.is_empty() {
            return Err(incorrect());
        }

        let replacement = Captcha::generate();
        let code = self
            .db
            .consume_captcha(token, (&replacement.token, &replacement.code))
            .await?;

        match code {
            Some(code) if code == answer.to_ascii_uppercase() => Ok(()),
            Some(_) => {
                tracing::debug!(%token, "Wrong captcha answer");
                Err(incorrect())
            }
            None => Err(incorrect()),
        }
    }
}

fn incorrect() -> AppError {
    AppError::Refused("Incorrect captcha".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store(pool_size: usize) -> (CaptchaStore, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("c.db")).await.unwrap());
        (CaptchaStore::new(db.clone(), pool_size), db, temp_dir)
    }

    #[tokio::test]
    async fn code_is_single_use() {
        let (store, db, _temp_dir) = store(1).await;
        db.insert_captcha("tok1", "ABCD").await.unwrap();

        store.validate("tok1:abcd").await.unwrap();
        let second = store.validate("tok1:ABCD").await;
        assert!(matches!(second, Err(AppError::Refused(msg)) if msg == "Incorrect captcha"));
        // Consumed and replaced
        assert_eq!(db.count_captchas().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn wrong_answer_burns_the_token() {
        let (store, db, _temp_dir) = store(1).await;
        db.insert_captcha("tok1", "ABCD").await.unwrap();

        assert!(store.validate("tok1:WXYZ").await.is_err());
        assert!(store.validate("tok1:ABCD").await.is_err());
    }

    #[tokio::test]
    async fn missing_or_malformed_captcha() {
        let (store, _db, _temp_dir) = store(1).await;
        assert!(matches!(
            store.validate("  ").await,
            Err(AppError::Refused(msg)) if msg == "No captcha provided"
        ));
        assert!(matches!(
            store.validate("tok1").await,
            Err(AppError::Refused(msg)) if msg == "Incorrect captcha"
        ));
        assert!(matches!(
            store.validate("tok1:").await,
            Err(AppError::Refused(msg)) if msg == "Incorrect captcha"
        ));
    }

    #[tokio::test]
    async fn pool_is_topped_up() {
        let (store, db, _temp_dir) = store(3).await;
        assert_eq!(store.ensure_pool().await.unwrap(), 3);
        assert_eq!(store.ensure_pool().await.unwrap(), 0);
        assert_eq!(db.count_captchas().await.unwrap(), 3);
    }
}
