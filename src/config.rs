//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub instance: InstanceConfig,
    pub posting: PostingConfig,
    pub federation: FederationConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "board.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://board.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// Transport prefix used to canonicalize post Ids ("https://")
    pub fn transport_prefix(&self) -> String {
        format!("{}://", self.protocol)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Instance metadata and startup boards
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub title: String,
    pub summary: String,
    /// Boards created at startup when missing
    #[serde(default)]
    pub boards: Vec<BoardConfig>,
    /// RSA modulus size for newly created actors
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
}

/// A board declared in configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BoardConfig {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub restricted: bool,
}

fn default_key_bits() -> usize {
    2048
}

/// Post submission policy
#[derive(Debug, Clone, Deserialize)]
pub struct PostingConfig {
    /// Maximum attachment size in bytes
    pub max_attachment_bytes: u64,
    /// Accepted attachment MIME types
    pub supported_mime_types: Vec<String>,
    /// Regular expressions refused in subjects and comments, on top of
    /// the patterns stored through moderation
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Maximum live (non-archived) threads per board
    pub live_thread_window: usize,
    /// New threads must carry an attachment
    pub require_media_for_threads: bool,
    /// Directory where attachments are written
    pub media_dir: PathBuf,
    /// Header carrying the poster's network address
    pub address_header: String,
    /// Header carrying the poster's country code
    pub country_header: Option<String>,
    /// Boards whose posts carry an anonymized poster id
    #[serde(default)]
    pub poster_id_boards: Vec<String>,
    /// Boards whose posts carry a country code
    #[serde(default)]
    pub country_boards: Vec<String>,
    /// Addresses that always map to the hidden poster id
    #[serde(default)]
    pub hidden_id_addresses: Vec<String>,
    /// Number of outstanding captchas kept available
    pub captcha_pool: usize,
    /// Key for secure (`##`) tripcodes; the admin token when empty
    #[serde(default)]
    pub tripcode_secret: String,
}

/// Federation transport settings
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Concurrent outbound deliveries
    pub delivery_workers: usize,
    /// Capacity of the outbound task queue
    pub delivery_queue: usize,
    /// Per-inbox delivery timeout in seconds
    pub delivery_timeout_secs: u64,
    /// Timeout for fetches made while resolving actors and posts
    pub request_timeout_secs: u64,
    /// Permit loopback/private peers (local testing only)
    #[serde(default)]
    pub allow_private_addresses: bool,
}

/// Moderation credentials
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Bearer token accepted by the moderation endpoints
    pub token: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (FEDBOARD__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/fedboard.db")?
            .set_default("instance.title", "fedboard")?
            .set_default("instance.summary", "")?
            .set_default("instance.key_bits", 2048)?
            .set_default("posting.max_attachment_bytes", 7 * 1024 * 1024)?
            .set_default(
                "posting.supported_mime_types",
                vec![
                    "image/gif",
                    "image/jpeg",
                    "image/png",
                    "image/webp",
                    "video/mp4",
                    "video/webm",
                    "audio/mpeg",
                    "audio/ogg",
                    "application/pdf",
                ],
            )?
            .set_default("posting.live_thread_window", 150)?
            .set_default("posting.require_media_for_threads", true)?
            .set_default("posting.media_dir", "data/public")?
            .set_default("posting.address_header", "x-forwarded-for")?
            .set_default("posting.hidden_id_addresses", vec!["172.16.0.1"])?
            .set_default("posting.captcha_pool", 5)?
            .set_default("federation.delivery_workers", 10)?
            .set_default("federation.delivery_queue", 1024)?
            .set_default("federation.delivery_timeout_secs", 10)?
            .set_default("federation.request_timeout_secs", 30)?
            .set_default("federation.allow_private_addresses", false)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (FEDBOARD__*)
            .add_source(
                Environment::with_prefix("FEDBOARD")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("posting.supported_mime_types")
                    .with_list_parse_key("posting.blacklist")
                    .with_list_parse_key("posting.poster_id_boards")
                    .with_list_parse_key("posting.country_boards")
                    .with_list_parse_key("posting.hidden_id_addresses")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let mut app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        if app_config.posting.tripcode_secret.is_empty() {
            app_config.posting.tripcode_secret = app_config.admin.token.clone();
        }
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        const MIN_ADMIN_TOKEN_BYTES: usize = 16;

        if self.server.domain.trim().is_empty() {
            return Err(crate::error::AppError::Config(
                "server.domain must not be empty".to_string(),
            ));
        }

        if !self.server.protocol.eq_ignore_ascii_case("https")
            && !is_local_server_domain(&self.server.domain)
        {
            return Err(crate::error::AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        if self.admin.token.as_bytes().len() < MIN_ADMIN_TOKEN_BYTES {
            return Err(crate::error::AppError::Config(format!(
                "admin.token must be at least {} bytes",
                MIN_ADMIN_TOKEN_BYTES
            )));
        }

        if self.federation.delivery_workers == 0 {
            return Err(crate::error::AppError::Config(
                "federation.delivery_workers must be greater than 0".to_string(),
            ));
        }

        if self.posting.live_thread_window == 0 {
            return Err(crate::error::AppError::Config(
                "posting.live_thread_window must be greater than 0".to_string(),
            ));
        }

        if self
            .instance
            .boards
            .iter()
            .any(|board| !crate::data::is_valid_board_name(&board.name))
        {
            return Err(crate::error::AppError::Config(
                "instance.boards names must be alphanumeric".to_string(),
            ));
        }

        if let Some(error) = self
            .posting
            .blacklist
            .iter()
            .find_map(|pattern| regex::Regex::new(pattern).err())
        {
            return Err(crate::error::AppError::Config(format!(
                "posting.blacklist contains an invalid pattern: {}",
                error
            )));
        }

        if self.federation.allow_private_addresses {
            tracing::warn!("Private peer addresses are allowed; do not use in production");
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
