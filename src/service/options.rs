//! Post option string
//!
//! The options field is `;`-separated. Recognized entries are kept,
//! anything else is dropped silently.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Option flag stored on posts carrying a delete password
pub const DELETE_FLAG: &str = "delete";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wallet {
    pub kind: String,
    pub address: String,
}

/// Parsed options of a submission
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostOptions {
    /// `noko`, `sage`, `nokosage` in submission order
    pub flags: Vec<String>,
    pub email: Option<String>,
    pub wallets: Vec<Wallet>,
    /// Raw password; only its HMAC is ever stored
    pub delete_password: Option<String>,
}

impl PostOptions {
    pub fn parse(raw: &str) -> Self {
        let mut options = Self::default();

        for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            match entry {
                "noko" | "sage" | "nokosage" => {
                    if !options.flags.iter().any(|f| f == entry) {
                        options.flags.push(entry.to_string());
                    }
                }
                _ if entry.starts_with("wallet:") => {
                    let mut parts = entry.splitn(3, ':').skip(1);
                    if let (Some(kind), Some(address)) = (parts.next(), parts.next()) {
                        if !kind.is_empty() && !address.is_empty() {
                            options.wallets.push(Wallet {
                                kind: kind.to_string(),
                                address: address.to_string(),
                            });
                        }
                    }
                }
                _ if entry.starts_with("delete:") => {
                    let password = &entry["delete:".len()..];
                    if !password.is_empty() {
                        options.delete_password = Some(password.to_string());
                    }
                }
                _ if looks_like_email(entry) => options.email = Some(entry.to_string()),
                _ => tracing::debug!(option = %entry, "Ignoring unknown option"),
            }
        }

        options
    }

    pub fn is_sage(&self) -> bool {
        self.flags.iter().any(|f| f == "sage" || f == "nokosage")
    }

    pub fn is_noko(&self) -> bool {
        self.flags.iter().any(|f| f == "noko" || f == "nokosage")
    }

    /// Poster alias implied by the options
    pub fn alias(&self) -> Option<String> {
        self.email.as_ref().map(|email| format!("email:{}", email))
    }

    /// Flags as stored on the post; never contains the password
    pub fn to_stored(&self) -> Vec<String> {
        let mut stored = self.flags.clone();
        if let Some(email) = &self.email {
            stored.push(format!("email:{}", email));
        }
        for wallet in &self.wallets {
            stored.push(format!("wallet:{}:{}", wallet.kind, wallet.address));
        }
        if self.delete_password.is_some() {
            stored.push(DELETE_FLAG.to_string());
        }
        stored
    }
}

/// `local@domain.tld` with no whitespace
fn looks_like_email(entry: &str) -> bool {
    if entry.chars().any(char::is_whitespace) {
        return false;
    }
    match entry.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain
                    .split_once('.')
                    .is_some_and(|(host, tld)| !host.is_empty() && !tld.is_empty())
        }
        None => false,
    }
}

/// HMAC-SHA256 of a delete password, keyed by the post Id
pub fn delete_password_hash(post_id: &str, password: &str) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(post_id.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(password.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Constant-time check of a delete password against its stored HMAC
pub fn verify_delete_password(post_id: &str, password: &str, stored: &str) -> bool {
    let Ok(expected) = URL_SAFE_NO_PAD.decode(stored) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(post_id.as_bytes()) else {
        return false;
    };
    mac.update(password.as_bytes());
    mac.verify_slice(&expected).is_ok()
}
