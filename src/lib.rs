//! fedboard - A federated imageboard node speaking ActivityPub
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints (actors, inbox, outbox)            │
//! │  - WebFinger, moderation, metrics                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Service & Federation Layer                      │
//! │  - Submission pipeline, moderation, captchas                │
//! │  - Signature verification, inbox dispatch, follow handshake │
//! │  - Reply resolution, delivery queue                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx)                                            │
//! │  - Board cache                                              │
//! │  - Local attachment storage                                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers
//! - `service`: Submission, moderation, captchas, local actors
//! - `federation`: ActivityPub federation engine
//! - `data`: Database and board cache
//! - `storage`: Attachment storage
//! - `auth`: Moderator token
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod auth;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod service;
pub mod storage;

use std::sync::Arc;

/// Application state shared across all handlers
///
/// Cloned for each request; every component sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Local boards and the instance following list
    pub boards: Arc<data::BoardCache>,

    /// Local and remote actor lookup
    pub directory: Arc<federation::ActorDirectory>,

    /// HTTP signature checks for local commands
    pub verifier: Arc<federation::SignatureVerifier>,

    pub resolver: Arc<federation::ReplyResolver>,
    pub follows: Arc<federation::FollowCoordinator>,
    pub inbox: Arc<federation::InboxDispatcher>,
    pub submissions: Arc<service::SubmissionPipeline>,
    pub moderation: Arc<service::ModerationService>,
    pub actors: Arc<service::ActorService>,
    pub captcha: Arc<service::CaptchaStore>,

    /// Attachment storage (local disk)
    pub storage: Arc<storage::MediaStorage>,

    /// Outbound delivery queue
    pub delivery: federation::DeliveryDispatcher,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Connect to SQLite database
    /// 2. Build the federation HTTP client
    /// 3. Open attachment storage, then the directory and delivery queue
    /// 4. Ensure the instance actor and configured boards exist
    /// 5. Fill the captcha pool and load the board cache
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");
        let base_url = config.server.base_url();

        // 1. Connect to SQLite database
        let db = Arc::new(data::Database::connect(&config.database.path).await?);
        tracing::info!(path = %config.database.path.display(), "Database connected");

        // 2. HTTP client
        let http_client = Arc::new(
            reqwest::Client::builder()
                .user_agent(concat!("fedboard/", env!("CARGO_PKG_VERSION")))
                .timeout(std::time::Duration::from_secs(
                    config.federation.request_timeout_secs,
                ))
                .build()
                .map_err(|e| error::AppError::Internal(e.into()))?,
        );

        // 3. Attachment storage
        let storage = Arc::new(storage::MediaStorage::new(&config.posting.media_dir, base_url.clone()).await?);
        tracing::info!(root = %storage.root().display(), "Media storage initialized");

        // 4. Federation components
        let boards = Arc::new(data::BoardCache::new(db.clone()));
        let directory = Arc::new(federation::ActorDirectory::new(
            db.clone(),
            http_client.clone(),
            base_url.clone(),
            config.federation.allow_private_addresses,
        ));
        let delivery = federation::DeliveryDispatcher::start(
            http_client.clone(),
            directory.clone(),
            &config.federation,
        );
        let verifier = Arc::new(federation::SignatureVerifier::new(directory.clone()));
        let resolver = Arc::new(federation::ReplyResolver::new(
            db.clone(),
            directory.clone(),
            config.server.protocol.clone(),
            config.server.domain.clone(),
        ));
        let follows = Arc::new(federation::FollowCoordinator::new(
            db.clone(),
            directory.clone(),
            delivery.clone(),
            boards.clone(),
        ));
        let inbox = Arc::new(federation::InboxDispatcher::new(
            db.clone(),
            directory.clone(),
            follows.clone(),
            delivery.clone(),
            directory.clone(),
            config.posting.live_thread_window,
        ));

        // 5. Services
        let captcha = Arc::new(service::CaptchaStore::new(db.clone(), config.posting.captcha_pool));
        let submissions = Arc::new(service::SubmissionPipeline::new(
            db.clone(),
            directory.clone(),
            resolver.clone(),
            storage.clone(),
            captcha.clone(),
            delivery.clone(),
            config.posting.clone(),
        ));
        let moderation = Arc::new(service::ModerationService::new(
            db.clone(),
            boards.clone(),
            storage.clone(),
            captcha.clone(),
            delivery.clone(),
            config.posting.live_thread_window,
        ));
        let actors = Arc::new(service::ActorService::new(
            db.clone(),
            boards.clone(),
            base_url,
            config.instance.key_bits,
        ));

        // 6. Local actors
        actors
            .ensure_instance_actor(&config.instance.title, &config.instance.summary)
            .await?;
        for board in &config.instance.boards {
            let created = actors
                .create_board(&service::NewBoard {
                    name: board.name.clone(),
                    title: board.title.clone(),
                    summary: board.summary.clone(),
                    restricted: board.restricted,
                })
                .await?;
            if created.is_none() {
                tracing::debug!(board = %board.name, "Configured board exists");
            }
        }

        // 7. Captchas and caches
        captcha.ensure_pool().await?;
        boards.refresh().await?;
        tracing::info!(boards = boards.boards().await.len(), "Board cache loaded");

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            db,
            boards,
            directory,
            verifier,
            resolver,
            follows,
            inbox,
            submissions,
            moderation,
            actors,
            captcha,
            storage,
            delivery,
            http_client,
        })
    }
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use axum::extract::DefaultBodyLimit;
    use tower_http::{
        compression::CompressionLayer, limit::RequestBodyLimitLayer, services::ServeDir,
        trace::TraceLayer,
    };

    let cors_layer = build_cors_layer(&state.config.server);
    // Oversized attachments must reach the pipeline to get its reason
    let body_limit = (state.config.posting.max_attachment_bytes as usize)
        .saturating_mul(2)
        .saturating_add(1024 * 1024);
    let media = ServeDir::new(state.storage.root());

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::wellknown_router())
        .nest("/admin", api::admin_router())
        .nest_service(storage::PUBLIC_PREFIX, media)
        .merge(api::activitypub_router())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
        .merge(api::metrics_router())
}

fn build_cors_layer(server: &config::ServerConfig) -> tower_http::cors::CorsLayer {
    use axum::http::HeaderValue;
    use tower_http::cors::{Any, CorsLayer};

    if !server.protocol.eq_ignore_ascii_case("https") {
        return CorsLayer::permissive();
    }

    let allowed_origin = server.base_url();
    match HeaderValue::from_str(&allowed_origin) {
        Ok(origin) => CorsLayer::new()
            .allow_origin([origin])
            .allow_methods(Any)
            .allow_headers(Any),
        Err(error) => {
            tracing::error!(
                %error,
                origin = %allowed_origin,
                "Failed to parse CORS origin from server base URL; denying cross-origin requests"
            );
            CorsLayer::new().allow_methods(Any).allow_headers(Any)
        }
    }
}

async fn health_check() -> &'static str {
    "OK"
}
