//! Common test utilities for E2E tests
//!
//! `TestServer` runs the real router on a loopback port. `Peer` is a
//! minimal remote node: it serves one actor and arbitrary objects, records
//! whatever is delivered to its inbox, and signs the activities it sends.

#![allow(dead_code)]

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use fedboard::data::Actor;
use fedboard::federation::sign_request;
use fedboard::{AppState, config};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

pub const ADMIN_TOKEN: &str = "test-admin-token-0123456789";
pub const ACTIVITY_JSON: &str = "application/activity+json";

/// A PNG header is enough for type sniffing
pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";

/// Test server instance
pub struct TestServer {
    pub addr: String,
    pub state: AppState,
    pub _temp_dir: TempDir,
    pub client: reqwest::Client,
}

impl TestServer {
    /// Create a new test server with board `g`
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server, adjusting the configuration first
    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();

        // Bind first: the port is part of every local Id
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = config::AppConfig {
            server: config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: addr.port(),
                domain: addr.to_string(),
                protocol: "http".to_string(),
            },
            database: config::DatabaseConfig {
                path: temp_dir.path().join("test.db"),
            },
            instance: config::InstanceConfig {
                title: "Test fedboard".to_string(),
                summary: "Test instance".to_string(),
                boards: vec![config::BoardConfig {
                    name: "g".to_string(),
                    title: "Technology".to_string(),
                    summary: String::new(),
                    restricted: false,
                }],
                key_bits: 1024,
            },
            posting: config::PostingConfig {
                max_attachment_bytes: 1024 * 1024,
                supported_mime_types: vec!["image/png".to_string(), "image/jpeg".to_string()],
                blacklist: Vec::new(),
                live_thread_window: 10,
                require_media_for_threads: true,
                media_dir: temp_dir.path().join("public"),
                address_header: "x-forwarded-for".to_string(),
                country_header: None,
                poster_id_boards: Vec::new(),
                country_boards: Vec::new(),
                hidden_id_addresses: Vec::new(),
                captcha_pool: 2,
                tripcode_secret: "test-tripcode-secret".to_string(),
            },
            federation: config::FederationConfig {
                delivery_workers: 2,
                delivery_queue: 64,
                delivery_timeout_secs: 5,
                request_timeout_secs: 5,
                allow_private_addresses: true,
            },
            admin: config::AdminConfig {
                token: ADMIN_TOKEN.to_string(),
            },
            logging: config::LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        };
        adjust(&mut config);

        let state = AppState::new(config).await.unwrap();
        let app = fedboard::build_router(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr: format!("http://{}", addr),
            state,
            _temp_dir: temp_dir,
            client,
        }
    }

    /// Get URL for a path on this server
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.addr, path)
    }

    /// Local board with its signing key
    pub async fn board(&self, name: &str) -> Actor {
        self.state
            .db
            .get_actor_by_name(name)
            .await
            .unwrap()
            .expect("board exists")
    }

    /// A fresh captcha answer in `token:code` form
    pub async fn captcha(&self) -> String {
        let captcha = self.state.captcha.issue().await.unwrap();
        format!("{}:{}", captcha.token, captcha.code)
    }

    /// Multipart submission to a board outbox
    pub async fn submit(&self, board: &str, fields: &[(&str, &str)], file: Option<&[u8]>) -> reqwest::Response {
        self.submit_from(board, fields, file, None).await
    }

    /// Submission as sent through a proxy reporting `address`
    pub async fn submit_from(
        &self,
        board: &str,
        fields: &[(&str, &str)],
        file: Option<&[u8]>,
        address: Option<&str>,
    ) -> reqwest::Response {
        let mut form = reqwest::multipart::Form::new();
        for (name, value) in fields {
            form = form.text(name.to_string(), value.to_string());
        }
        if let Some(data) = file {
            let part = reqwest::multipart::Part::bytes(data.to_vec())
                .file_name("image.png")
                .mime_str("image/png")
                .unwrap();
            form = form.part("file", part);
        }

        let mut request = self.client.post(self.url(&format!("/{}/outbox", board)));
        if let Some(address) = address {
            request = request.header("x-forwarded-for", address);
        }
        request.multipart(form).send().await.unwrap()
    }

    /// New thread with an attachment; returns the post Id
    pub async fn new_thread(&self, board: &str, comment: &str) -> String {
        let captcha = self.captcha().await;
        let response = self
            .submit(board, &[("comment", comment), ("captcha", captcha.as_str())], Some(PNG))
            .await;
        assert_eq!(response.status(), 200);
        response.text().await.unwrap()
    }

    /// Reply to a thread; returns the reply Id
    pub async fn reply(&self, board: &str, thread: &str, comment: &str) -> String {
        let captcha = self.captcha().await;
        let response = self
            .submit(
                board,
                &[("inReplyTo", thread), ("comment", comment), ("captcha", captcha.as_str())],
                None,
            )
            .await;
        assert_eq!(response.status(), 200);
        let body = response.text().await.unwrap();
        body.split_once('|').map(|(_, id)| id.to_string()).unwrap_or(body)
    }

    /// POST an activity signed by a local actor
    pub async fn post_signed(&self, path: &str, actor: &Actor, activity: &Value) -> reqwest::Response {
        signed_post(
            &self.client,
            &self.url(path),
            activity,
            actor.private_key_pem.as_deref().unwrap(),
            &actor.key_id(),
        )
        .await
    }
}

/// Sign and POST an activity
pub async fn signed_post(
    client: &reqwest::Client,
    url: &str,
    activity: &Value,
    private_key_pem: &str,
    key_id: &str,
) -> reqwest::Response {
    let body = serde_json::to_vec(activity).unwrap();
    let signed = sign_request("POST", url, Some(&body), private_key_pem, key_id).unwrap();

    let mut request = client
        .post(url)
        .header("Content-Type", ACTIVITY_JSON)
        .header("Date", signed.date)
        .header("Signature", signed.signature);
    if let Some(digest) = signed.digest {
        request = request.header("Digest", digest);
    }
    request.body(body).send().await.unwrap()
}

// =============================================================================
// Remote peer
// =============================================================================

#[derive(Clone, Default)]
struct PeerState {
    actor: Arc<Mutex<Value>>,
    objects: Arc<Mutex<HashMap<String, Value>>>,
    received: Arc<Mutex<Vec<Value>>>,
    fail_inbox: Arc<AtomicBool>,
    base: String,
}

/// A remote node with a single actor at `{base}/t`
pub struct Peer {
    pub base: String,
    pub actor_id: String,
    pub inbox: String,
    pub private_key_pem: String,
    state: PeerState,
    client: reqwest::Client,
}

impl Peer {
    pub async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let actor_id = format!("{}/t", base);
        let inbox = format!("{}/inbox", actor_id);

        let (private_key_pem, public_key_pem) = fedboard::service::generate_keypair(1024).await.unwrap();
        let actor = json!({
            "@context": ["https://www.w3.org/ns/activitystreams", "https://w3id.org/security/v1"],
            "type": "Group",
            "id": actor_id,
            "name": "t",
            "preferredUsername": "t",
            "inbox": inbox,
            "outbox": format!("{}/outbox", actor_id),
            "followers": format!("{}/followers", actor_id),
            "following": format!("{}/following", actor_id),
            "publicKey": {
                "id": format!("{}#main-key", actor_id),
                "owner": actor_id,
                "publicKeyPem": public_key_pem,
            },
        });

        let state = PeerState {
            actor: Arc::new(Mutex::new(actor)),
            base: base.clone(),
            ..Default::default()
        };
        let app = Router::new()
            .route("/t", get(peer_actor))
            .route("/t/inbox", post(peer_inbox))
            .route("/:board/:slug", get(peer_object))
            .with_state(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base,
            actor_id,
            inbox,
            private_key_pem,
            state,
            client: reqwest::Client::new(),
        }
    }

    pub fn key_id(&self) -> String {
        format!("{}#main-key", self.actor_id)
    }

    /// Id of a post hosted on the peer
    pub fn post_id(&self, slug: &str) -> String {
        format!("{}/b/{}", self.base, slug)
    }

    /// Serve `document` at its `id`
    pub fn host(&self, document: Value) {
        let id = document["id"].as_str().unwrap().to_string();
        self.state.objects.lock().unwrap().insert(id, document);
    }

    /// Make the inbox answer 500 from now on
    pub fn fail_inbox(&self) {
        self.state.fail_inbox.store(true, Ordering::SeqCst);
    }

    /// Sign and POST an activity as the peer actor
    pub async fn send(&self, url: &str, activity: &Value) -> reqwest::Response {
        signed_post(&self.client, url, activity, &self.private_key_pem, &self.key_id()).await
    }

    pub fn received(&self) -> Vec<Value> {
        self.state.received.lock().unwrap().clone()
    }

    /// Wait until an activity of `kind` arrives
    pub async fn expect_received(&self, kind: &str) -> Value {
        for _ in 0..100 {
            if let Some(found) = self.received().into_iter().find(|a| a["type"] == kind) {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no {} delivered to peer; got {:?}", kind, self.received());
    }

    /// Note document as the peer would serve it
    pub fn note(&self, slug: &str, content: &str, in_reply_to: &[String]) -> Value {
        json!({
            "type": "Note",
            "id": self.post_id(slug),
            "actor": self.actor_id,
            "attributedTo": "Anonymous",
            "content": content,
            "inReplyTo": in_reply_to.iter().map(|id| json!({"id": id})).collect::<Vec<_>>(),
            "published": chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Activity envelope from the peer actor
    pub fn activity<S: AsRef<str>>(&self, kind: &str, object: Value, to: &[S]) -> Value {
        let to: Vec<&str> = to.iter().map(AsRef::as_ref).collect();
        json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "id": format!("{}/activities/{}", self.actor_id, ulid::Ulid::new()),
            "type": kind,
            "actor": self.actor_id,
            "object": object,
            "to": to,
        })
    }
}

async fn peer_actor(State(state): State<PeerState>) -> Response {
    let actor = state.actor.lock().unwrap().clone();
    ([(header::CONTENT_TYPE, ACTIVITY_JSON)], actor.to_string()).into_response()
}

async fn peer_inbox(State(state): State<PeerState>, body: Bytes) -> StatusCode {
    if state.fail_inbox.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    if let Ok(activity) = serde_json::from_slice::<Value>(&body) {
        state.received.lock().unwrap().push(activity);
    }
    StatusCode::ACCEPTED
}

async fn peer_object(
    State(state): State<PeerState>,
    Path((board, slug)): Path<(String, String)>,
) -> Response {
    let id = format!("{}/{}/{}", state.base, board, slug);
    match state.objects.lock().unwrap().get(&id) {
        Some(document) => {
            ([(header::CONTENT_TYPE, ACTIVITY_JSON)], document.to_string()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
