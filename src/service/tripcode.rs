//! Name tripcodes
//!
//! `name#secret` shows as `name !code`, `name##secret` as `name !!code`.
//! Plain codes are a public digest of the secret and match across nodes;
//! secure codes are keyed with this node's tripcode secret.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const CODE_LEN: usize = 10;

/// Poster name split from its tripcode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedPoster {
    pub name: String,
    /// Empty when no secret was given
    pub tripcode: String,
}

/// Split `name#secret` / `name##secret` and derive the tripcode
pub fn name_and_tripcode(raw: &str, key: &[u8]) -> NamedPoster {
    let Some((name, secret)) = raw.split_once('#') else {
        return NamedPoster {
            name: raw.trim().to_string(),
            tripcode: String::new(),
        };
    };

    let name = name.trim().to_string();
    let tripcode = match secret.strip_prefix('#') {
        Some(secret) if !secret.is_empty() => format!("!!{}", secure_code(secret, key)),
        Some(_) => String::new(),
        None if !secret.is_empty() => format!("!{}", plain_code(secret)),
        None => String::new(),
    };
    NamedPoster { name, tripcode }
}

fn plain_code(secret: &str) -> String {
    truncate(URL_SAFE_NO_PAD.encode(Sha256::digest(secret.as_bytes())))
}

fn secure_code(secret: &str, key: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return plain_code(secret);
    };
    mac.update(secret.as_bytes());
    truncate(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

fn truncate(mut code: String) -> String {
    code.truncate(CODE_LEN);
    code
}
