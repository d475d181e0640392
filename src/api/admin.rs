//! Moderation endpoints
//!
//! Per-board moderation under `/admin/:board`. All routes require the
//! moderator bearer token.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::activitypub::full_post_id;
use crate::AppState;
use crate::auth::Moderator;
use crate::data::{Actor, Ban, BlacklistEntry, Report};
use crate::error::AppError;
use crate::metrics::HTTP_REQUESTS_TOTAL;

/// Create admin router
///
/// Routes:
/// - POST /:board/delete?id= - Tombstone a post (an OP takes its replies)
/// - POST /:board/sticky?id= - Toggle sticky on a thread
/// - POST /:board/lock?id= - Toggle lock on a thread
/// - POST /:board/autosubscribe - Toggle follow-back of new followers
/// - POST /:board/archive/pop?id= - Return an archived thread
/// - POST /:board/sensitive?id= - Mark a post's media sensitive
/// - POST /:board/attachment/delete?id= - Remove a post's attachment only
/// - GET|POST /:board/blacklist, DELETE /:board/blacklist/:id
/// - GET /:board/reports, POST /:board/reports/:id/close
/// - POST /:board/ban, GET /:board/bans, DELETE /:board/bans/:id
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/:board/delete", post(delete_post))
        .route("/:board/sticky", post(toggle_sticky))
        .route("/:board/lock", post(toggle_lock))
        .route("/:board/sensitive", post(mark_sensitive))
        .route("/:board/attachment/delete", post(delete_attachment))
        .route("/:board/autosubscribe", post(toggle_auto_subscribe))
        .route("/:board/archive/pop", post(pop_archive))
        .route("/:board/blacklist", get(list_blacklist).post(add_blacklist))
        .route("/:board/blacklist/:id", delete(remove_blacklist))
        .route("/:board/reports", get(list_reports))
        .route("/:board/reports/:id/close", post(close_report))
        .route("/:board/ban", post(ban_poster))
        .route("/:board/bans", get(list_bans))
        .route("/:board/bans/:id", delete(remove_ban))
}

#[derive(Debug, Deserialize)]
struct PostQuery {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BlacklistRequest {
    pattern: String,
}

#[derive(Debug, Deserialize)]
struct BanRequest {
    id: String,
    #[serde(default)]
    reason: String,
    /// `1day`, `3days`, `1week`, `2weeks`, `1month` or `permanent`
    expires: String,
}

async fn local_board(state: &AppState, name: &str) -> Result<Actor, AppError> {
    state.boards.get(name).await.ok_or(AppError::NotFound)
}

fn count(endpoint: &str) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", endpoint, "200"])
        .inc();
}

// =============================================================================
// Posts
// =============================================================================

/// POST /admin/:board/delete?id=
async fn delete_post(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path(board): Path<String>,
    Query(query): Query<PostQuery>,
) -> Result<Json<Value>, AppError> {
    let board = local_board(&state, &board).await?;
    let outcome = state
        .moderation
        .delete_post(&board, &full_post_id(&board, &query.id))
        .await?;
    count("/admin/:board/delete");
    Ok(Json(json!({
        "deleted": outcome.tombstoned,
        "unarchived": outcome.unarchived,
    })))
}

/// POST /admin/:board/sticky?id=
async fn toggle_sticky(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path(board): Path<String>,
    Query(query): Query<PostQuery>,
) -> Result<Json<Value>, AppError> {
    let board = local_board(&state, &board).await?;
    let sticky = state
        .moderation
        .toggle_sticky(&board, &full_post_id(&board, &query.id))
        .await?;
    count("/admin/:board/sticky");
    Ok(Json(json!({ "sticky": sticky })))
}

/// POST /admin/:board/lock?id=
async fn toggle_lock(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path(board): Path<String>,
    Query(query): Query<PostQuery>,
) -> Result<Json<Value>, AppError> {
    let board = local_board(&state, &board).await?;
    let locked = state
        .moderation
        .toggle_lock(&board, &full_post_id(&board, &query.id))
        .await?;
    count("/admin/:board/lock");
    Ok(Json(json!({ "locked": locked })))
}

/// POST /admin/:board/sensitive?id=
async fn mark_sensitive(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path(board): Path<String>,
    Query(query): Query<PostQuery>,
) -> Result<Json<Value>, AppError> {
    let board = local_board(&state, &board).await?;
    state
        .moderation
        .mark_sensitive(&board, &full_post_id(&board, &query.id))
        .await?;
    count("/admin/:board/sensitive");
    Ok(Json(json!({ "sensitive": true })))
}

/// POST /admin/:board/attachment/delete?id=
async fn delete_attachment(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path(board): Path<String>,
    Query(query): Query<PostQuery>,
) -> Result<StatusCode, AppError> {
    let board = local_board(&state, &board).await?;
    state
        .moderation
        .delete_attachment(&board, &full_post_id(&board, &query.id))
        .await?;
    count("/admin/:board/attachment/delete");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /admin/:board/archive/pop?id=
async fn pop_archive(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path(board): Path<String>,
    Query(query): Query<PostQuery>,
) -> Result<StatusCode, AppError> {
    let board = local_board(&state, &board).await?;
    state
        .moderation
        .pop_archive(&board, &full_post_id(&board, &query.id))
        .await?;
    count("/admin/:board/archive/pop");
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Board settings
// =============================================================================

/// POST /admin/:board/autosubscribe
async fn toggle_auto_subscribe(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path(board): Path<String>,
) -> Result<Json<Value>, AppError> {
    let board = local_board(&state, &board).await?;
    let enabled = state.moderation.toggle_auto_subscribe(&board).await?;
    count("/admin/:board/autosubscribe");
    Ok(Json(json!({ "autoSubscribe": enabled })))
}

// =============================================================================
// Blacklist
// =============================================================================

/// GET /admin/:board/blacklist
async fn list_blacklist(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path(_board): Path<String>,
) -> Result<Json<Vec<BlacklistEntry>>, AppError> {
    Ok(Json(state.moderation.list_blacklist().await?))
}

/// POST /admin/:board/blacklist
async fn add_blacklist(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path(_board): Path<String>,
    Json(request): Json<BlacklistRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let id = state.moderation.add_blacklist(&request.pattern).await?;
    count("/admin/:board/blacklist");
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

/// DELETE /admin/:board/blacklist/:id
async fn remove_blacklist(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path((_board, id)): Path<(String, i64)>,
) -> Result<StatusCode, AppError> {
    state.moderation.remove_blacklist(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Reports
// =============================================================================

/// GET /admin/:board/reports
async fn list_reports(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path(board): Path<String>,
) -> Result<Json<Vec<Report>>, AppError> {
    let board = local_board(&state, &board).await?;
    Ok(Json(state.moderation.list_reports(&board).await?))
}

/// POST /admin/:board/reports/:id/close
async fn close_report(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path((board, id)): Path<(String, i64)>,
) -> Result<StatusCode, AppError> {
    let board = local_board(&state, &board).await?;
    state.moderation.close_report(&board, id).await?;
    count("/admin/:board/reports/:id/close");
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Bans
// =============================================================================

/// POST /admin/:board/ban
async fn ban_poster(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path(board): Path<String>,
    Json(request): Json<BanRequest>,
) -> Result<(StatusCode, Json<Ban>), AppError> {
    let board = local_board(&state, &board).await?;
    let ban = state
        .moderation
        .ban_poster(
            &board,
            &full_post_id(&board, &request.id),
            &request.reason,
            &request.expires,
        )
        .await?;
    count("/admin/:board/ban");
    Ok((StatusCode::CREATED, Json(ban)))
}

/// GET /admin/:board/bans
async fn list_bans(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path(_board): Path<String>,
) -> Result<Json<Vec<Ban>>, AppError> {
    Ok(Json(state.moderation.list_bans().await?))
}

/// DELETE /admin/:board/bans/:id
async fn remove_ban(
    State(state): State<AppState>,
    _moderator: Moderator,
    Path((_board, id)): Path<(String, i64)>,
) -> Result<StatusCode, AppError> {
    state.moderation.remove_ban(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
