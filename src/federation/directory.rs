//! Actor Directory
//!
//! Resolves actor Ids to descriptors. Local actors are read from the
//! database; remote actors are fetched once and kept in memory for the
//! process lifetime. A failed signature check triggers [`ActorDirectory::refresh`],
//! which is the only way a remote entry is replaced.
//!
//! Also serves WebFinger, both as the local JRD document and as the
//! discovery path for `name@host` handles.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use super::activity::{ACTIVITY_CONTENT_TYPE, ActorObject};
use super::delivery::InboxLookup;
use super::reply::RemoteObjects;
use super::signature::{checked_remote_url, ensure_resolves_public};
use crate::data::{Actor, Database};
use crate::error::AppError;
use crate::metrics::{
    CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL, FEDERATION_REQUEST_DURATION_SECONDS,
    FEDERATION_REQUESTS_TOTAL,
};

pub struct ActorDirectory {
    db: Arc<Database>,
    http_client: Arc<reqwest::Client>,
    /// Remote actor Id -> descriptor
    cache: RwLock<HashMap<String, Arc<Actor>>>,
    /// `{protocol}://{domain}`; Ids under it are local
    base_url: String,
    allow_private: bool,
}

impl ActorDirectory {
    pub fn new(
        db: Arc<Database>,
        http_client: Arc<reqwest::Client>,
        base_url: String,
        allow_private: bool,
    ) -> Self {
        Self {
            db,
            http_client,
            cache: RwLock::new(HashMap::new()),
            base_url,
            allow_private,
        }
    }

    /// Whether the Id is hosted by this node
    pub fn is_local_id(&self, id: &str) -> bool {
        id == self.base_url
            || id
                .strip_prefix(&self.base_url)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Local actor straight from storage; never touches the network
    pub async fn get_local(&self, id: &str) -> Result<Option<Actor>, AppError> {
        self.db.get_actor(id).await
    }

    /// Resolve an actor Id to its descriptor
    ///
    /// Local Ids are answered from storage only. Remote Ids are served from
    /// the cache when present, otherwise fetched and cached.
    pub async fn resolve(&self, id: &str) -> Result<Arc<Actor>, AppError> {
        let id = id.split('#').next().unwrap_or(id);

        if self.is_local_id(id) {
            return self
                .get_local(id)
                .await?
                .map(Arc::new)
                .ok_or(AppError::NotFound);
        }

        if let Some(actor) = self.cached(id).await {
            CACHE_HITS_TOTAL.with_label_values(&["actors"]).inc();
            return Ok(actor);
        }
        CACHE_MISSES_TOTAL.with_label_values(&["actors"]).inc();

        self.fetch_and_cache(id).await
    }

    /// Drop any cached copy and fetch the actor again
    pub async fn refresh(&self, id: &str) -> Result<Arc<Actor>, AppError> {
        self.invalidate(id).await;
        self.fetch_and_cache(id).await
    }

    /// Cached remote descriptor, without discovery
    pub async fn cached(&self, id: &str) -> Option<Arc<Actor>> {
        self.cache.read().await.get(id).cloned()
    }

    pub async fn invalidate(&self, id: &str) {
        if self.cache.write().await.remove(id).is_some() {
            tracing::debug!(actor = %id, "Invalidated cached actor");
        }
    }

    /// Resolve an Id or a `name@host` handle
    pub async fn resolve_handle(&self, handle: &str) -> Result<Arc<Actor>, AppError> {
        if handle.starts_with("http://") || handle.starts_with("https://") {
            return self.resolve(handle).await;
        }
        let actor_id = self.webfinger(handle).await?;
        self.resolve(&actor_id).await
    }

    /// Discover an actor Id through WebFinger
    pub async fn webfinger(&self, handle: &str) -> Result<String, AppError> {
        let handle = handle.trim_start_matches('@').trim_start_matches("acct:");
        let (name, host) = handle
            .split_once('@')
            .ok_or_else(|| AppError::Validation(format!("Invalid handle: {}", handle)))?;
        let scheme = self.base_url.split("://").next().unwrap_or("https");

        let url = format!(
            "{}://{}/.well-known/webfinger?resource=acct:{}@{}",
            scheme,
            host,
            urlencoding::encode(name),
            host
        );
        let document = fetch_document(&self.http_client, &url, self.allow_private, "application/jrd+json")
            .await?
            .ok_or(AppError::NotFound)?;
        let jrd: WebFingerResponse = serde_json::from_value(document)
            .map_err(|e| AppError::Federation(format!("Invalid WebFinger response: {}", e)))?;

        jrd.links
            .into_iter()
            .find(|link| {
                link.rel == "self"
                    && link
                        .link_type
                        .as_deref()
                        .is_some_and(super::activity::is_activity_media_type)
            })
            .and_then(|link| link.href)
            .ok_or_else(|| AppError::Federation(format!("No actor link for {}", handle)))
    }

    async fn fetch_and_cache(&self, id: &str) -> Result<Arc<Actor>, AppError> {
        let document =
            fetch_document(&self.http_client, id, self.allow_private, ACTIVITY_CONTENT_TYPE)
                .await?
                .ok_or(AppError::NotFound)?;
        let object: ActorObject = serde_json::from_value(document)
            .map_err(|e| AppError::Federation(format!("Invalid actor document: {}", e)))?;

        if object.id != id {
            return Err(AppError::Federation(format!(
                "Actor document id {} does not match {}",
                object.id, id
            )));
        }

        let actor = Arc::new(object.into_actor());
        self.cache
            .write()
            .await
            .insert(id.to_string(), actor.clone());
        tracing::debug!(actor = %id, "Cached remote actor");

        Ok(actor)
    }
}

impl RemoteObjects for ActorDirectory {
    fn fetch_object(&self, id: &str) -> BoxFuture<'static, Result<Option<Value>, AppError>> {
        let client = self.http_client.clone();
        let allow_private = self.allow_private;
        let id = id.to_string();
        async move { fetch_document(&client, &id, allow_private, ACTIVITY_CONTENT_TYPE).await }
            .boxed()
    }
}

impl InboxLookup for ActorDirectory {
    fn inbox_of<'a>(&'a self, actor_id: &'a str) -> BoxFuture<'a, Result<String, AppError>> {
        async move {
            let actor = self.resolve(actor_id).await?;
            Ok::<_, AppError>(actor.inbox.clone())
        }
        .boxed()
    }
}

/// GET a JSON document from a peer; `None` on 404/410
async fn fetch_document(
    client: &reqwest::Client,
    url: &str,
    allow_private: bool,
    accept: &str,
) -> Result<Option<Value>, AppError> {
    let parsed = checked_remote_url(url, allow_private)?;
    ensure_resolves_public(&parsed, allow_private).await?;

    let timer = FEDERATION_REQUEST_DURATION_SECONDS
        .with_label_values(&["outbound_fetch"])
        .start_timer();
    let started = Instant::now();
    let response = client
        .get(parsed.as_str())
        .header("Accept", accept)
        .send()
        .await;
    timer.observe_duration();

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            FEDERATION_REQUESTS_TOTAL
                .with_label_values(&["outbound_fetch", "error"])
                .inc();
            return Err(AppError::Federation(format!("Failed to fetch {}: {}", url, e)));
        }
    };

    let status = response.status();
    FEDERATION_REQUESTS_TOTAL
        .with_label_values(&["outbound_fetch", status.as_str()])
        .inc();
    tracing::debug!(%url, %status, elapsed_ms = started.elapsed().as_millis() as u64, "Fetched remote document");

    if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(AppError::Federation(format!(
            "Failed to fetch {}: HTTP {}",
            url, status
        )));
    }

    let document = response
        .json::<Value>()
        .await
        .map_err(|e| AppError::Federation(format!("Failed to parse {}: {}", url, e)))?;
    Ok(Some(document))
}

// =============================================================================
// WebFinger documents
// =============================================================================

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    #[serde(default)]
    pub links: Vec<WebFingerLink>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// JRD for a local board
pub fn webfinger_document(board: &Actor, domain: &str) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", board.name, domain),
        aliases: Some(vec![board.id.clone()]),
        links: vec![WebFingerLink {
            rel: "self".to_string(),
            link_type: Some(ACTIVITY_CONTENT_TYPE.to_string()),
            href: Some(board.id.clone()),
        }],
    }
}
