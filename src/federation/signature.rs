//! HTTP Signatures
//!
//! Signing string is built over `(request-target) host date` plus `digest`
//! when the request carries a body, following the draft-cavage scheme used
//! across the fediverse.
//!
//! Also holds the outbound host guard: remote actor and object URLs must be
//! HTTP(S) and must not point at loopback or private networks unless the
//! node is explicitly configured to allow that.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs1v15::{Signature as Pkcs1v15Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::net::IpAddr;
use thiserror::Error;

use crate::error::AppError;

/// Maximum accepted clock skew for the Date header
const MAX_DATE_SKEW_SECS: i64 = 300;

/// Headers every inbound signature must cover
const REQUIRED_SIGNED_HEADERS: [&str; 3] = ["(request-target)", "host", "date"];

/// Why a signature did not verify
///
/// Kept separate from `AppError` so callers can log the precise cause while
/// the HTTP surface only ever reports "not verified".
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),
    #[error("malformed signature header: {0}")]
    Malformed(String),
    #[error("unsupported algorithm {0}")]
    Algorithm(String),
    #[error("signed headers must include {0}")]
    Unsigned(&'static str),
    #[error("date outside the accepted window")]
    DateSkew,
    #[error("digest does not match body")]
    DigestMismatch,
    #[error("unusable key: {0}")]
    Key(String),
    #[error("signature does not match")]
    Mismatch,
}

impl From<SignatureError> for AppError {
    fn from(_: SignatureError) -> Self {
        AppError::InvalidSignature
    }
}

// =============================================================================
// Signing
// =============================================================================

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    pub signature: String,
    pub date: String,
    pub digest: Option<String>,
}

/// Sign an outgoing request
///
/// # Arguments
/// * `method` - HTTP method (e.g., "POST")
/// * `url` - Full URL being requested
/// * `body` - Request body, digested when present
/// * `private_key_pem` - PKCS#8 PEM private key of the sending actor
/// * `key_id` - `{actor}#main-key`
pub fn sign_request(
    method: &str,
    url: &str,
    body: Option<&[u8]>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;
    let host = host_header_value(&parsed)
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;

    let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
    let digest = body.map(generate_digest);

    let mut fields = vec![
        ("(request-target)", request_target(method, &path_and_query(&parsed))),
        ("host", host),
        ("date", date.clone()),
    ];
    if let Some(digest) = &digest {
        fields.push(("digest", digest.clone()));
    }

    let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid private key: {}", e)))?;
    let signing_key = SigningKey::<Sha256>::new_unprefixed(private_key);
    let signed = signing_key.sign_with_rng(
        &mut rand::thread_rng(),
        signing_string(&fields).as_bytes(),
    );

    let header_names: Vec<&str> = fields.iter().map(|(name, _)| *name).collect();
    let signature = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
        key_id,
        header_names.join(" "),
        BASE64.encode(signed.to_bytes())
    );

    Ok(SignatureHeaders {
        signature,
        date,
        digest,
    })
}

// =============================================================================
// Verification
// =============================================================================

/// Verify an inbound request signature against a PEM public key
///
/// `path` is the request path plus query as received.
pub fn verify_signature(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    public_key_pem: &str,
) -> Result<(), SignatureError> {
    let parsed = parse_signature_header(header_str(headers, "signature")?)?;

    if parsed.algorithm != "rsa-sha256" && parsed.algorithm != "hs2019" {
        return Err(SignatureError::Algorithm(parsed.algorithm));
    }
    for required in REQUIRED_SIGNED_HEADERS {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(SignatureError::Unsigned(required));
        }
    }
    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(SignatureError::Unsigned("digest"));
    }

    let date = DateTime::parse_from_rfc2822(header_str(headers, "date")?)
        .map_err(|_| SignatureError::Malformed("date".to_string()))?;
    if (Utc::now().timestamp() - date.timestamp()).abs() > MAX_DATE_SKEW_SECS {
        return Err(SignatureError::DateSkew);
    }

    if let Some(body) = body {
        if header_str(headers, "digest")? != generate_digest(body) {
            return Err(SignatureError::DigestMismatch);
        }
    }

    let mut fields = Vec::with_capacity(parsed.headers.len());
    for name in &parsed.headers {
        let value = match name.as_str() {
            "(request-target)" => request_target(method, path),
            "host" => header_str(headers, "host")?.to_string(),
            "date" => header_str(headers, "date")?.to_string(),
            "digest" => header_str(headers, "digest")?.to_string(),
            "content-type" => header_str(headers, "content-type")?.to_string(),
            other => {
                return Err(SignatureError::Malformed(format!(
                    "unsupported signed header {}",
                    other
                )));
            }
        };
        fields.push((name.as_str(), value));
    }

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| SignatureError::Key(e.to_string()))?;
    let signature_bytes = BASE64
        .decode(&parsed.signature)
        .map_err(|_| SignatureError::Malformed("signature encoding".to_string()))?;
    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|_| SignatureError::Malformed("signature length".to_string()))?;

    VerifyingKey::<Sha256>::new_unprefixed(public_key)
        .verify(signing_string(&fields).as_bytes(), &signature)
        .map_err(|_| SignatureError::Mismatch)
}

/// keyId of the request's Signature header
pub fn extract_signature_key_id(headers: &http::HeaderMap) -> Result<String, SignatureError> {
    Ok(parse_signature_header(header_str(headers, "signature")?)?.key_id)
}

/// Whether a keyId belongs to the given actor document
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    strip_fragment(key_id) == strip_fragment(actor_id)
}

/// Parsed Signature header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSignature {
    pub key_id: String,
    pub algorithm: String,
    /// Signed header names, lowercased, in signing order
    pub headers: Vec<String>,
    pub signature: String,
}

/// Parse `keyId="..",algorithm="..",headers="..",signature=".."`
///
/// `algorithm` defaults to `hs2019` and `headers` to `date` when absent.
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, SignatureError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let Some((name, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match name.trim() {
            "keyId" => key_id = Some(value),
            "algorithm" => algorithm = Some(value),
            "headers" => {
                headers = Some(
                    value
                        .split_whitespace()
                        .map(str::to_ascii_lowercase)
                        .collect::<Vec<_>>(),
                )
            }
            "signature" => signature = Some(value),
            _ => {}
        }
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| SignatureError::Malformed("keyId".to_string()))?,
        algorithm: algorithm.unwrap_or_else(|| "hs2019".to_string()),
        headers: headers.unwrap_or_else(|| vec!["date".to_string()]),
        signature: signature.ok_or_else(|| SignatureError::Malformed("signature".to_string()))?,
    })
}

/// `SHA-256=base64(sha256(body))`
pub fn generate_digest(body: &[u8]) -> String {
    format!("SHA-256={}", BASE64.encode(Sha256::digest(body)))
}

fn signing_string(fields: &[(&str, String)]) -> String {
    fields
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value))
        .collect::<Vec<_>>()
        .join("\n")
}

fn request_target(method: &str, path: &str) -> String {
    format!("{} {}", method.to_lowercase(), path)
}

fn header_str<'a>(
    headers: &'a http::HeaderMap,
    name: &'static str,
) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .ok_or(SignatureError::MissingHeader(name))?
        .to_str()
        .map_err(|_| SignatureError::Malformed(name.to_string()))
}

fn path_and_query(url: &url::Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Host header as an HTTP client sends it (port only when non-default)
fn host_header_value(url: &url::Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn strip_fragment(id: &str) -> &str {
    id.split('#').next().unwrap_or(id)
}

// =============================================================================
// Outbound host guard
// =============================================================================

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_private_host(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }
    host.trim_matches(|c| c == '[' || c == ']')
        .parse::<IpAddr>()
        .map(is_private_ip)
        .unwrap_or(false)
}

/// Parse a remote actor/object URL and reject non-HTTP(S) or private targets
pub fn checked_remote_url(raw: &str, allow_private: bool) -> Result<url::Url, AppError> {
    let url = url::Url::parse(strip_fragment(raw))
        .map_err(|e| AppError::Validation(format!("Invalid remote URL: {}", e)))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::Validation(format!(
            "Unsupported URL scheme: {}",
            url.scheme()
        )));
    }
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in remote URL".to_string()))?;

    if !allow_private && is_private_host(host) {
        return Err(AppError::Forbidden);
    }
    Ok(url)
}

/// Resolve the URL's host and reject it if any address is private
///
/// Catches public-looking names that resolve into internal networks.
pub async fn ensure_resolves_public(url: &url::Url, allow_private: bool) -> Result<(), AppError> {
    if allow_private {
        return Ok(());
    }
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in remote URL".to_string()))?;
    let port = url.port_or_known_default().unwrap_or(443);

    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve {}: {}", host, e)))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::Federation(format!("No DNS records for {}", host)));
    }
    if addrs.iter().any(|addr| is_private_ip(addr.ip())) {
        return Err(AppError::Forbidden);
    }
    Ok(())
}
