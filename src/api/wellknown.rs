//! Well-known endpoints
//!
//! - /.well-known/webfinger

use axum::{
    Router,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::webfinger_document;
use crate::metrics::{HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL};

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
pub fn wellknown_router() -> Router<AppState> {
    Router::new().route("/.well-known/webfinger", get(webfinger))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for local boards.
///
/// Query: ?resource=acct:board@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/.well-known/webfinger"])
        .start_timer();

    let acct = query
        .resource
        .strip_prefix("acct:")
        .ok_or_else(|| AppError::Validation("Resource must start with 'acct:'".to_string()))?;
    let (name, domain) = acct
        .split_once('@')
        .ok_or_else(|| AppError::Validation("Invalid acct format".to_string()))?;

    if !domain.eq_ignore_ascii_case(&state.config.server.domain) {
        return Err(AppError::NotFound);
    }

    let board = state.boards.get(name).await.ok_or(AppError::NotFound)?;
    let jrd = webfinger_document(&board, &state.config.server.domain);
    let body = serde_json::to_string(&jrd)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to encode JRD: {}", e)))?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/.well-known/webfinger", "200"])
        .inc();
    Ok(([(header::CONTENT_TYPE, "application/jrd+json")], body).into_response())
}
