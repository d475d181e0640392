//! fedboard binary entry point

use fedboard::{AppState, config};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the tracing subscriber
///
/// `RUST_LOG` wins over the configured level.
fn init_logging(logging: &config::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("fedboard={},tower_http=debug", logging.level))
    });
    let registry = tracing_subscriber::registry().with(filter);

    match logging.format.as_str() {
        "json" => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        "compact" => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Register metrics
/// 4. Initialize AppState (creates local actors, starts the delivery queue)
/// 5. Serve the router
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::AppConfig::load()?;
    init_logging(&config.logging);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        boards = config.instance.boards.len(),
        "Starting fedboard"
    );

    fedboard::metrics::init_metrics();

    let state = AppState::new(config.clone()).await?;
    let app = fedboard::build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, public_url = %config.server.base_url(), "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}
