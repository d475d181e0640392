//! Signature Verifier
//!
//! Decides whether an inbound request was signed by the claimed actor.
//! Fails closed: every error on the way (unknown actor, fetch failure,
//! malformed header, bad signature) yields `false`.

use std::sync::Arc;

use super::directory::ActorDirectory;
use super::signature::{
    SignatureError, extract_signature_key_id, key_id_matches_actor, verify_signature,
};
use crate::data::Actor;
use crate::error::AppError;

/// The parts of an HTTP request covered by the signature
#[derive(Debug, Clone, Copy)]
pub struct SignedRequest<'a> {
    pub method: &'a str,
    /// Path plus query as received
    pub path: &'a str,
    pub headers: &'a http::HeaderMap,
    pub body: &'a [u8],
}

pub struct SignatureVerifier {
    directory: Arc<ActorDirectory>,
}

impl SignatureVerifier {
    pub fn new(directory: Arc<ActorDirectory>) -> Self {
        Self { directory }
    }

    /// `true` only when the request carries a valid signature by `claimed_actor`
    ///
    /// May populate the Actor Directory cache as a side effect.
    pub async fn verify(&self, request: &SignedRequest<'_>, claimed_actor: &str) -> bool {
        match self.try_verify(request, claimed_actor).await {
            Ok(()) => true,
            Err(error) => {
                tracing::warn!(actor = %claimed_actor, %error, "Signature not verified");
                false
            }
        }
    }

    async fn try_verify(
        &self,
        request: &SignedRequest<'_>,
        claimed_actor: &str,
    ) -> Result<(), AppError> {
        let key_id = extract_signature_key_id(request.headers).map_err(log_cause)?;
        if !key_id_matches_actor(&key_id, claimed_actor) {
            tracing::debug!(%key_id, actor = %claimed_actor, "keyId belongs to another actor");
            return Err(AppError::InvalidSignature);
        }

        let was_cached = self.directory.cached(claimed_actor).await.is_some();
        let actor = self.directory.resolve(claimed_actor).await?;

        match check(&actor, request) {
            Ok(()) => Ok(()),
            // A cached key may be stale: fetch the actor again, once
            Err(cause) if was_cached => {
                tracing::debug!(actor = %claimed_actor, %cause, "Retrying with refreshed actor");
                let fresh = self.directory.refresh(claimed_actor).await?;
                check(&fresh, request).map_err(log_cause)
            }
            Err(cause) => Err(log_cause(cause)),
        }
    }
}

fn check(actor: &Actor, request: &SignedRequest<'_>) -> Result<(), SignatureError> {
    let public_key_pem = actor
        .public_key_pem
        .as_deref()
        .ok_or_else(|| SignatureError::Key("actor advertises no public key".to_string()))?;

    let body = (!request.body.is_empty()).then_some(request.body);
    verify_signature(
        request.method,
        request.path,
        request.headers,
        body,
        public_key_pem,
    )
}

fn log_cause(cause: SignatureError) -> AppError {
    tracing::debug!(%cause, "Signature check failed");
    cause.into()
}
