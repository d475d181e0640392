//! ActivityPub endpoints
//!
//! Actor documents, inboxes, outboxes, collections and post objects for the
//! instance actor and every local board.

use axum::{
    Form, Json, Router,
    body::Bytes,
    extract::{FromRequest, Multipart, Path, Request, State},
    http::{HeaderMap, StatusCode, Uri, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;

use crate::AppState;
use crate::data::{Actor, Post};
use crate::error::AppError;
use crate::federation::activity::{
    ACTIVITY_CONTENT_TYPE, ACTIVITY_STREAMS_CONTEXT, builder, is_activity_media_type,
};
use crate::federation::{Activity, ActivityKind, InboxOutcome, SignedRequest, ToggleOutcome};
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL,
    HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_TOTAL,
};
use crate::service::{Attachment, NewBoard, PosterInfo, Submission};

/// Create ActivityPub router
///
/// Routes:
/// - GET / (instance actor), GET /:board (board actor)
/// - POST /inbox, POST /:board/inbox
/// - GET|POST /outbox, GET|POST /:board/outbox
/// - GET /followers, /following and their board counterparts
/// - POST /:board/delete (poster self-delete)
/// - POST /:board/report (report a post)
/// - GET /:board/:slug (post object)
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/", get(instance_actor))
        .route("/inbox", post(instance_inbox))
        .route("/outbox", get(instance_outbox).post(instance_outbox_post))
        .route("/followers", get(instance_followers))
        .route("/following", get(instance_following))
        .route("/:board", get(board_actor))
        .route("/:board/inbox", post(board_inbox))
        .route("/:board/outbox", get(outbox).post(outbox_post))
        .route("/:board/followers", get(followers))
        .route("/:board/following", get(following))
        .route("/:board/delete", post(self_delete))
        .route("/:board/report", post(report_post))
        .route("/:board/:slug", get(post_object))
}

/// JSON body served as `application/activity+json`
fn activity_json(document: &Value) -> Response {
    (
        [(header::CONTENT_TYPE, ACTIVITY_CONTENT_TYPE)],
        document.to_string(),
    )
        .into_response()
}

fn wants_activity(headers: &HeaderMap, name: header::HeaderName) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .is_some_and(is_activity_media_type)
}

async fn local_board(state: &AppState, name: &str) -> Result<Actor, AppError> {
    state.boards.get(name).await.ok_or(AppError::NotFound)
}

async fn instance(state: &AppState) -> Result<Actor, AppError> {
    state.db.get_instance_actor().await?.ok_or(AppError::NotFound)
}

// =============================================================================
// Actors
// =============================================================================

/// GET /
async fn instance_actor(State(state): State<AppState>) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/"])
        .start_timer();

    let actor = instance(&state).await?;
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/", "200"])
        .inc();
    Ok(activity_json(&builder::actor_document(&actor)))
}

/// GET /:board
async fn board_actor(
    State(state): State<AppState>,
    Path(board): Path<String>,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/:board"])
        .start_timer();

    let actor = local_board(&state, &board).await?;
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/:board", "200"])
        .inc();
    Ok(activity_json(&builder::actor_document(&actor)))
}

// =============================================================================
// Inbox
// =============================================================================

/// POST /inbox
async fn instance_inbox(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let owner = instance(&state).await?;
    receive(&state, &owner, &uri, &headers, &body).await
}

/// POST /:board/inbox
///
/// # Steps
/// 1. Verify HTTP Signature against the claimed actor
/// 2. Record the activity Id (replays are acknowledged, not applied)
/// 3. Dispatch by activity kind
async fn board_inbox(
    State(state): State<AppState>,
    Path(board): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let owner = local_board(&state, &board).await?;
    receive(&state, &owner, &uri, &headers, &body).await
}

async fn receive(
    state: &AppState,
    owner: &Actor,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, AppError> {
    let _timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["inbound"])
        .start_timer();

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let request = SignedRequest {
        method: "POST",
        path,
        headers,
        body,
    };

    match state.inbox.receive(owner, &request).await {
        Ok(InboxOutcome::Rejected(reject)) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "rejected"])
                .inc();
            let mut response = activity_json(&reject);
            *response.status_mut() = StatusCode::FORBIDDEN;
            Ok(response)
        }
        Ok(outcome) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "success"])
                .inc();
            tracing::debug!(inbox = %owner.id, ?outcome, "Inbox request handled");
            Ok(StatusCode::OK.into_response())
        }
        Err(error) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["inbound", "error"])
                .inc();
            Err(error)
        }
    }
}

// =============================================================================
// Outbox
// =============================================================================

/// GET /outbox
async fn instance_outbox(State(state): State<AppState>) -> Result<Response, AppError> {
    let actor = instance(&state).await?;
    outbox_collection(&state, &actor).await
}

/// GET /:board/outbox
///
/// Live threads, stickies first, each with its replies embedded.
async fn outbox(
    State(state): State<AppState>,
    Path(board): Path<String>,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/:board/outbox"])
        .start_timer();

    let actor = local_board(&state, &board).await?;
    let response = outbox_collection(&state, &actor).await?;
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/:board/outbox", "200"])
        .inc();
    Ok(response)
}

async fn outbox_collection(state: &AppState, actor: &Actor) -> Result<Response, AppError> {
    let threads = state.db.list_threads(&actor.id).await?;

    let mut items = Vec::with_capacity(threads.len());
    let mut total_imgs = 0;
    for op in &threads {
        let replies = state.db.list_replies(&op.id).await?;
        total_imgs += usize::from(op.has_media()) + replies.iter().filter(|r| r.has_media()).count();
        items.push(builder::thread(op, &replies));
    }

    Ok(activity_json(&json!({
        "@context": ACTIVITY_STREAMS_CONTEXT,
        "type": "OrderedCollection",
        "id": actor.outbox,
        "totalItems": items.len(),
        "totalImgs": total_imgs,
        "orderedItems": items,
    })))
}

/// POST /outbox
///
/// Board creation and instance follows, signed by a local actor.
async fn instance_outbox_post(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let actor = instance(&state).await?;
    outbox_activity(&state, &actor, &uri, &headers, &body).await
}

/// POST /:board/outbox
///
/// Activity JSON is handled as a local command; anything else is a post
/// submission (multipart or url-encoded form).
async fn outbox_post(
    State(state): State<AppState>,
    Path(board): Path<String>,
    request: Request,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/:board/outbox"])
        .start_timer();

    let actor = local_board(&state, &board).await?;
    let headers = request.headers().clone();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if is_activity_media_type(&content_type) {
        let uri = request.uri().clone();
        let body = Bytes::from_request(request, &state)
            .await
            .map_err(|e| AppError::Validation(format!("Invalid body: {}", e)))?;
        return outbox_activity(&state, &actor, &uri, &headers, &body).await;
    }

    let poster = poster_info(&state, &headers);
    let submission = if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| AppError::Validation(format!("Invalid form: {}", e)))?;
        read_multipart(multipart, poster).await?
    } else {
        let Form(fields) = Form::<HashMap<String, String>>::from_request(request, &state)
            .await
            .map_err(|e| AppError::Validation(format!("Invalid form: {}", e)))?;
        let mut submission = Submission {
            poster,
            ..Default::default()
        };
        for (name, value) in fields {
            set_field(&mut submission, &name, value);
        }
        submission
    };

    let submitted = state.submissions.submit(&actor, submission).await?;
    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/:board/outbox", "200"])
        .inc();
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        submitted.response_body(),
    )
        .into_response())
}

/// Signed command from a local actor
async fn outbox_activity(
    state: &AppState,
    owner: &Actor,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, AppError> {
    let refused = || AppError::Refused("could not process activity".to_string());

    let document: Value = serde_json::from_slice(body).map_err(|_| refused())?;
    let activity = Activity::from_value(&document).map_err(|_| refused())?;

    if activity.actor != owner.id && !state.directory.is_local_id(&activity.actor) {
        return Err(AppError::Forbidden);
    }
    let request = SignedRequest {
        method: "POST",
        path: uri.path_and_query().map(|pq| pq.as_str()).unwrap_or_else(|| uri.path()),
        headers,
        body,
    };
    if !state.verifier.verify(&request, &activity.actor).await {
        return Err(AppError::InvalidSignature);
    }
    let sender = state
        .directory
        .get_local(&activity.actor)
        .await?
        .ok_or(AppError::Forbidden)?;
    // Boards act only through their own outbox; the instance may act anywhere
    if sender.id != owner.id && !sender.is_instance {
        return Err(AppError::Forbidden);
    }

    match activity.kind {
        ActivityKind::Follow => {
            let target = activity.object.id().ok_or_else(refused)?;
            let outcome = state.follows.toggle_follow(owner, target).await?;
            let status = match outcome {
                ToggleOutcome::Requested => "requested",
                ToggleOutcome::Unfollowed => "unfollowed",
            };
            Ok(Json(json!({ "status": status })).into_response())
        }
        ActivityKind::New => {
            let object = activity.raw.get("object").ok_or_else(refused)?;
            let field = |name: &str| {
                object
                    .get(name)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let board = NewBoard {
                name: field("alias"),
                title: field("name"),
                summary: field("summary"),
                restricted: object
                    .get("sensitive")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            };
            match state.actors.create_board(&board).await? {
                Some(created) => Ok((
                    StatusCode::CREATED,
                    activity_json(&builder::actor_document(&created)),
                )
                    .into_response()),
                None => Err(AppError::Validation(format!("Board {} already exists", board.name))),
            }
        }
        _ => Err(refused()),
    }
}

fn poster_info(state: &AppState, headers: &HeaderMap) -> PosterInfo {
    let read = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    PosterInfo {
        address: read(&state.config.posting.address_header),
        country: state.config.posting.country_header.as_deref().and_then(read),
    }
}

async fn read_multipart(mut multipart: Multipart, poster: PosterInfo) -> Result<Submission, AppError> {
    let invalid = |e: axum::extract::multipart::MultipartError| {
        AppError::Validation(format!("Invalid form: {}", e))
    };
    let mut submission = Submission {
        poster,
        ..Default::default()
    };

    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let filename = field.file_name().unwrap_or_default().to_string();
            let declared_type = field.content_type().map(str::to_string);
            let data = field.bytes().await.map_err(invalid)?;
            if !filename.is_empty() || !data.is_empty() {
                submission.attachment = Some(Attachment {
                    filename,
                    declared_type,
                    data: data.to_vec(),
                });
            }
        } else {
            let value = field.text().await.map_err(invalid)?;
            set_field(&mut submission, &name, value);
        }
    }

    Ok(submission)
}

fn set_field(submission: &mut Submission, name: &str, value: String) {
    match name {
        "inReplyTo" => submission.in_reply_to = value,
        "name" => submission.name = value,
        "subject" => submission.subject = value,
        "comment" => submission.comment = value,
        "options" => submission.options = value,
        "captcha" => submission.captcha = value,
        "sensitive" => submission.sensitive = matches!(value.as_str(), "true" | "on" | "1"),
        other => tracing::debug!(field = %other, "Ignoring unknown form field"),
    }
}

// =============================================================================
// Self-delete
// =============================================================================

#[derive(Debug, Deserialize)]
struct SelfDeleteForm {
    id: String,
    pwd: String,
}

/// POST /:board/delete
async fn self_delete(
    State(state): State<AppState>,
    Path(board): Path<String>,
    Form(form): Form<SelfDeleteForm>,
) -> Result<Json<Value>, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["POST", "/:board/delete"])
        .start_timer();

    let actor = local_board(&state, &board).await?;
    let id = full_post_id(&actor, &form.id);
    let outcome = state.moderation.self_delete(&actor, &id, &form.pwd).await?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/:board/delete", "200"])
        .inc();
    Ok(Json(json!({ "deleted": outcome.tombstoned })))
}

#[derive(Debug, Deserialize)]
struct ReportForm {
    id: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    captcha: String,
}

/// POST /:board/report
async fn report_post(
    State(state): State<AppState>,
    Path(board): Path<String>,
    Form(form): Form<ReportForm>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let actor = local_board(&state, &board).await?;
    let id = full_post_id(&actor, &form.id);
    let report = state
        .moderation
        .report_post(&actor, &id, &form.reason, &form.captcha)
        .await?;

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["POST", "/:board/report", "201"])
        .inc();
    Ok((StatusCode::CREATED, Json(json!({ "id": report }))))
}

/// Accept either a full Id or a bare slug
pub(crate) fn full_post_id(board: &Actor, id: &str) -> String {
    let id = id.trim();
    if id.contains("://") {
        id.to_string()
    } else {
        format!("{}/{}", board.id, id)
    }
}

// =============================================================================
// Collections
// =============================================================================

/// GET /followers
async fn instance_followers(State(state): State<AppState>) -> Result<Response, AppError> {
    let actor = instance(&state).await?;
    let items = state.db.list_followers(&actor.id).await?;
    Ok(activity_json(&builder::id_collection(&actor.followers, &items)))
}

/// GET /following
///
/// Served from the board cache.
async fn instance_following(State(state): State<AppState>) -> Result<Response, AppError> {
    let actor = instance(&state).await?;
    let items = state.boards.instance_following().await;
    Ok(activity_json(&builder::id_collection(&actor.following, &items)))
}

/// GET /:board/followers
async fn followers(
    State(state): State<AppState>,
    Path(board): Path<String>,
) -> Result<Response, AppError> {
    let actor = local_board(&state, &board).await?;
    let items = state.db.list_followers(&actor.id).await?;
    Ok(activity_json(&builder::id_collection(&actor.followers, &items)))
}

/// GET /:board/following
async fn following(
    State(state): State<AppState>,
    Path(board): Path<String>,
) -> Result<Response, AppError> {
    let actor = local_board(&state, &board).await?;
    let items = state.db.list_following(&actor.id).await?;
    Ok(activity_json(&builder::id_collection(&actor.following, &items)))
}

// =============================================================================
// Posts
// =============================================================================

/// GET /:board/:slug
///
/// Activity JSON when asked for (OPs embed their replies), otherwise a
/// plain HTML rendering of the thread with reply references linked.
async fn post_object(
    State(state): State<AppState>,
    Path((board, slug)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/:board/:slug"])
        .start_timer();

    let actor = local_board(&state, &board).await?;
    let post = state
        .db
        .get_post(&full_post_id(&actor, &slug))
        .await?
        .filter(|post| post.board_id == actor.id)
        .ok_or(AppError::NotFound)?;

    let response = if wants_activity(&headers, header::ACCEPT) {
        let mut document = if post.is_op() {
            let replies = state.db.list_replies(&post.id).await?;
            builder::thread(&post, &replies)
        } else {
            builder::note(&post)
        };
        if let Some(map) = document.as_object_mut() {
            map.insert("@context".to_string(), json!(ACTIVITY_STREAMS_CONTEXT));
        }
        activity_json(&document)
    } else {
        let op = match state.db.get_post(post.op_id()).await? {
            Some(op) => op,
            None => post.clone(),
        };
        let replies = state.db.list_replies(&op.id).await?;
        Html(render_thread(&state, &actor, &op, &replies).await).into_response()
    };

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/:board/:slug", "200"])
        .inc();
    Ok(response)
}

async fn render_thread(state: &AppState, board: &Actor, op: &Post, replies: &[Post]) -> String {
    let mut html = String::from("<!DOCTYPE html><html><body>");
    for post in std::iter::once(op).chain(replies.iter()) {
        let short = state.resolver.short_id(&post.id);
        html.push_str(&format!("<article id=\"{}\">", short));
        if !post.name.is_empty() {
            html.push_str(&format!("<h2>{}</h2>", html_escape::encode_text(&post.name)));
        }
        html.push_str(&format!(
            "<header>{} <span class=\"tripcode\">{}</span> No.{}</header>",
            html_escape::encode_text(&post.attributed_to),
            html_escape::encode_text(&post.tripcode),
            short
        ));
        if let Some(href) = &post.media_href {
            html.push_str(&format!(
                "<a class=\"file\" href=\"{}\">{}</a>",
                html_escape::encode_double_quoted_attribute(href),
                html_escape::encode_text(post.media_name.as_deref().unwrap_or("file"))
            ));
        }
        let body = state.resolver.render(&post.content, &op.id, &board.name).await;
        html.push_str(&format!("<blockquote>{}</blockquote></article>", body));
    }
    html.push_str("</body></html>");
    html
}
