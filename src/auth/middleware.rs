//! Bearer token extractor
//!
//! Protects the moderation routes.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};

use crate::AppState;
use crate::error::AppError;

/// Byte-wise comparison whose duration does not depend on where inputs differ
fn token_matches(presented: &str, expected: &str) -> bool {
    let (presented, expected) = (presented.as_bytes(), expected.as_bytes());
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Extractor for an authenticated moderator
///
/// # Usage
/// ```ignore
/// async fn handler(_moderator: Moderator) -> impl IntoResponse {
///     "only moderators get here"
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Moderator;

#[async_trait]
impl<S> FromRequestParts<S> for Moderator
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    /// Accepts `Authorization: Bearer <admin.token>`
    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, &state)
                .await
                .map_err(|_| AppError::Unauthorized)?;

        if !token_matches(bearer.token(), &state.config.admin.token) {
            tracing::warn!("Rejected moderation request with a wrong token");
            return Err(AppError::Unauthorized);
        }
        Ok(Moderator)
    }
}
