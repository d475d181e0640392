//! Delivery Dispatcher
//!
//! Outbound activities are queued on a bounded channel and drained by one
//! background task that runs at most `delivery_workers` signed POSTs at a
//! time. Submitting never blocks or fails the caller: a full or closed queue
//! is logged and the task is dropped. Each inbox is attempted once; failures
//! are logged and counted, never retried.
//!
//! Recipients named by actor Id are looked up on the worker, so a slow or
//! unreachable peer never holds up the request that queued the activity.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::activity::ACTIVITY_CONTENT_TYPE;
use super::signature::{checked_remote_url, ensure_resolves_public, sign_request};
use crate::config::FederationConfig;
use crate::data::{Actor, Post};
use crate::error::AppError;
use crate::metrics::{ACTIVITIES_SENT, DELIVERIES_TOTAL, DELIVERY_QUEUE_DEPTH};

/// Key material an outbound request is signed with
#[derive(Debug, Clone)]
pub struct Signer {
    pub actor_id: String,
    pub key_id: String,
    pub private_key_pem: String,
}

impl Signer {
    /// Signer for a local actor
    pub fn for_actor(actor: &Actor) -> Result<Self, AppError> {
        let private_key_pem = actor.private_key_pem.clone().ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("{} has no signing key", actor.id))
        })?;
        Ok(Self {
            actor_id: actor.id.clone(),
            key_id: actor.key_id(),
            private_key_pem,
        })
    }
}

/// Inbox lookup for recipients known only by actor Id
pub trait InboxLookup: Send + Sync {
    fn inbox_of<'a>(&'a self, actor_id: &'a str) -> BoxFuture<'a, Result<String, AppError>>;
}

/// Background work accepted by the dispatcher
#[derive(Debug)]
pub enum Task {
    /// Fan an activity out to every inbox independently
    Deliver {
        activity: Value,
        inboxes: Vec<String>,
        /// Recipients whose inbox is looked up before delivery
        actors: Vec<String>,
        signer: Signer,
    },
    /// Side effects of a new local post
    Notify { post: Post },
}

/// Signed POST to a single inbox
#[derive(Clone)]
pub struct InboxClient {
    http_client: Arc<reqwest::Client>,
    timeout: Duration,
    allow_private: bool,
}

impl InboxClient {
    pub fn new(http_client: Arc<reqwest::Client>, timeout: Duration, allow_private: bool) -> Self {
        Self {
            http_client,
            timeout,
            allow_private,
        }
    }

    /// Deliver activity to a single inbox
    pub async fn deliver_to_inbox(
        &self,
        inbox_uri: &str,
        activity: &Value,
        signer: &Signer,
    ) -> Result<(), AppError> {
        let target = checked_remote_url(inbox_uri, self.allow_private)?;
        ensure_resolves_public(&target, self.allow_private).await?;

        let body = serde_json::to_vec(activity)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to serialize activity: {}", e)))?;
        let signed = sign_request(
            "POST",
            inbox_uri,
            Some(&body),
            &signer.private_key_pem,
            &signer.key_id,
        )?;

        let mut request = self
            .http_client
            .post(inbox_uri)
            .timeout(self.timeout)
            .header("Content-Type", ACTIVITY_CONTENT_TYPE)
            .header("Date", signed.date)
            .header("Signature", signed.signature);
        if let Some(digest) = signed.digest {
            request = request.header("Digest", digest);
        }

        let response = request.body(body).send().await.map_err(|e| {
            AppError::Federation(format!("Failed to deliver to {}: {}", inbox_uri, e))
        })?;

        if !response.status().is_success() {
            return Err(AppError::Federation(format!(
                "Inbox {} rejected activity: HTTP {}",
                inbox_uri,
                response.status()
            )));
        }

        tracing::debug!(inbox = %inbox_uri, "Delivered activity");
        Ok(())
    }
}

/// Handle for submitting background tasks
#[derive(Clone)]
pub struct DeliveryDispatcher {
    sender: mpsc::Sender<Task>,
    client: InboxClient,
}

impl DeliveryDispatcher {
    /// Create the queue and spawn its worker
    pub fn start(
        http_client: Arc<reqwest::Client>,
        lookup: Arc<dyn InboxLookup>,
        config: &FederationConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.delivery_queue.max(1));
        let client = InboxClient::new(
            http_client,
            Duration::from_secs(config.delivery_timeout_secs),
            config.allow_private_addresses,
        );
        let permits = Arc::new(Semaphore::new(config.delivery_workers.max(1)));

        tokio::spawn(run_queue(receiver, client.clone(), lookup, permits));
        tracing::info!(
            workers = config.delivery_workers,
            capacity = config.delivery_queue,
            "Delivery dispatcher started"
        );

        Self { sender, client }
    }

    /// Queue a task; returns whether it was accepted
    pub fn submit(&self, task: Task) -> bool {
        if let Task::Deliver { activity, .. } = &task {
            let kind = activity.get("type").and_then(Value::as_str).unwrap_or("unknown");
            ACTIVITIES_SENT.with_label_values(&[kind]).inc();
        }

        match self.sender.try_send(task) {
            Ok(()) => {
                DELIVERY_QUEUE_DEPTH.inc();
                true
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Delivery queue full, dropping task");
                DELIVERIES_TOTAL.with_label_values(&["dropped"]).inc();
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("Delivery queue closed, dropping task");
                DELIVERIES_TOTAL.with_label_values(&["dropped"]).inc();
                false
            }
        }
    }

    /// Queue a fan-out of `activity` to `inboxes`
    pub fn deliver(&self, activity: Value, inboxes: Vec<String>, signer: Signer) -> bool {
        self.deliver_including(activity, inboxes, Vec::new(), signer)
    }

    /// Queue a fan-out to `inboxes` plus the inboxes of `actors`
    pub fn deliver_including(
        &self,
        activity: Value,
        inboxes: Vec<String>,
        actors: Vec<String>,
        signer: Signer,
    ) -> bool {
        if inboxes.is_empty() && actors.is_empty() {
            return true;
        }
        self.submit(Task::Deliver {
            activity,
            inboxes,
            actors,
            signer,
        })
    }

    /// Deliver to one inbox on the caller's task
    ///
    /// Used for handshake replies where the caller wants the outcome.
    pub async fn deliver_now(
        &self,
        inbox_uri: &str,
        activity: &Value,
        signer: &Signer,
    ) -> Result<(), AppError> {
        let kind = activity.get("type").and_then(Value::as_str).unwrap_or("unknown");
        ACTIVITIES_SENT.with_label_values(&[kind]).inc();
        record(self.client.deliver_to_inbox(inbox_uri, activity, signer).await, inbox_uri)
    }

    #[cfg(test)]
    pub(crate) fn closed() -> Self {
        let (sender, _) = mpsc::channel(1);
        Self {
            sender,
            client: InboxClient::new(Arc::new(reqwest::Client::new()), Duration::from_secs(1), true),
        }
    }
}

fn record(outcome: Result<(), AppError>, inbox_uri: &str) -> Result<(), AppError> {
    match &outcome {
        Ok(()) => DELIVERIES_TOTAL.with_label_values(&["delivered"]).inc(),
        Err(error) => {
            DELIVERIES_TOTAL.with_label_values(&["failed"]).inc();
            tracing::warn!(inbox = %inbox_uri, %error, "Delivery failed");
        }
    }
    outcome
}

/// Deduplicate identical inbox URIs, keeping first-seen order
fn unique_inbox_targets(inbox_uris: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    inbox_uris
        .into_iter()
        .filter(|inbox| seen.insert(inbox.clone()))
        .collect()
}

async fn run_queue(
    mut receiver: mpsc::Receiver<Task>,
    client: InboxClient,
    lookup: Arc<dyn InboxLookup>,
    permits: Arc<Semaphore>,
) {
    while let Some(task) = receiver.recv().await {
        DELIVERY_QUEUE_DEPTH.dec();

        match task {
            Task::Deliver {
                activity,
                inboxes,
                actors,
                signer,
            } => {
                let fan_out = FanOut {
                    client: client.clone(),
                    lookup: lookup.clone(),
                    permits: permits.clone(),
                };
                if actors.is_empty() {
                    fan_out.run(activity, inboxes, actors, signer).await;
                } else {
                    tokio::spawn(fan_out.run(activity, inboxes, actors, signer));
                }
            }
            Task::Notify { post } => {
                // Mail delivery is handled outside this node; only the event is logged
                let email = post
                    .options
                    .split(';')
                    .find_map(|option| option.strip_prefix("email:"));
                tracing::info!(
                    post = %post.id,
                    board = %post.board_id,
                    notify = email.is_some(),
                    "New post"
                );
            }
        }
    }

    tracing::debug!("Delivery queue closed");
}

/// One Deliver task: look up named actors, then POST to every inbox
struct FanOut {
    client: InboxClient,
    lookup: Arc<dyn InboxLookup>,
    permits: Arc<Semaphore>,
}

impl FanOut {
    async fn run(self, activity: Value, mut inboxes: Vec<String>, actors: Vec<String>, signer: Signer) {
        for actor in &actors {
            match self.lookup.inbox_of(actor).await {
                Ok(inbox) => inboxes.push(inbox),
                Err(error) => {
                    DELIVERIES_TOTAL.with_label_values(&["failed"]).inc();
                    tracing::warn!(%actor, %error, "Recipient unreachable");
                }
            }
        }

        let activity = Arc::new(activity);
        let signer = Arc::new(signer);
        let targets = unique_inbox_targets(inboxes);
        tracing::debug!(targets = targets.len(), actor = %signer.actor_id, "Fanning out activity");

        for inbox in targets {
            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                return;
            };
            let client = self.client.clone();
            let activity = activity.clone();
            let signer = signer.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let outcome = client.deliver_to_inbox(&inbox, &activity, &signer).await;
                let _ = record(outcome, &inbox);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::signature::tests::generate_test_keypair;
    use axum::{Router, extract::State, routing::post};
    use serde_json::json;
    use tokio::sync::Mutex;

    type Received = Arc<Mutex<Vec<Value>>>;

    async fn capture(State(received): State<Received>, body: String) -> axum::http::StatusCode {
        received
            .lock()
            .await
            .push(serde_json::from_str(&body).unwrap_or(Value::Null));
        axum::http::StatusCode::OK
    }

    async fn spawn_inbox() -> (String, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/inbox", post(capture))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{}/inbox", addr), received)
    }

    fn test_config() -> FederationConfig {
        FederationConfig {
            delivery_workers: 2,
            delivery_queue: 8,
            delivery_timeout_secs: 2,
            request_timeout_secs: 2,
            allow_private_addresses: true,
        }
    }

    /// Every actor's inbox is the one given
    struct FixedInbox(String);

    impl InboxLookup for FixedInbox {
        fn inbox_of<'a>(&'a self, _actor_id: &'a str) -> BoxFuture<'a, Result<String, AppError>> {
            Box::pin(async move { Ok::<_, AppError>(self.0.clone()) })
        }
    }

    fn start(inbox: &str) -> DeliveryDispatcher {
        DeliveryDispatcher::start(
            Arc::new(reqwest::Client::new()),
            Arc::new(FixedInbox(inbox.to_string())),
            &test_config(),
        )
    }

    async fn wait_for(received: &Received, count: usize) {
        for _ in 0..50 {
            if received.lock().await.len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn signer() -> Signer {
        let (private_key_pem, _) = generate_test_keypair();
        Signer {
            actor_id: "https://a.example/g".to_string(),
            key_id: "https://a.example/g#main-key".to_string(),
            private_key_pem,
        }
    }

    #[test]
    fn inbox_targets_are_deduplicated() {
        let targets = unique_inbox_targets(vec![
            "https://b.example/t/inbox".to_string(),
            "https://c.example/u/inbox".to_string(),
            "https://b.example/t/inbox".to_string(),
        ]);
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0], "https://b.example/t/inbox");
    }

    #[tokio::test]
    async fn one_failing_inbox_does_not_block_others() {
        let (inbox, received) = spawn_inbox().await;
        let dispatcher = start(&inbox);

        let activity = json!({"type": "Create", "id": "https://a.example/g/activities/1"});
        // Port 9 on loopback refuses connections
        let accepted = dispatcher.deliver(
            activity,
            vec!["http://127.0.0.1:9/inbox".to_string(), inbox.clone(), inbox],
            signer(),
        );
        assert!(accepted);

        wait_for(&received, 1).await;
        let received = received.lock().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["type"], "Create");
    }

    #[tokio::test]
    async fn closed_queue_is_not_fatal() {
        let dispatcher = DeliveryDispatcher::closed();
        let accepted = dispatcher.deliver(
            json!({"type": "Create"}),
            vec!["http://127.0.0.1:9/inbox".to_string()],
            signer(),
        );
        assert!(!accepted);
        assert!(!dispatcher.submit(Task::Notify {
            post: Post::new_note("x".to_string(), "b".to_string())
        }));
    }

    #[tokio::test]
    async fn deliver_now_reports_rejection() {
        let dispatcher = start("http://127.0.0.1:9/inbox");
        let result = dispatcher
            .deliver_now("http://127.0.0.1:9/inbox", &json!({"type": "Accept"}), &signer())
            .await;
        assert!(matches!(result, Err(AppError::Federation(_))));
    }

    #[tokio::test]
    async fn named_recipients_are_looked_up_on_the_worker() {
        let (inbox, received) = spawn_inbox().await;
        let dispatcher = start(&inbox);

        let accepted = dispatcher.deliver_including(
            json!({"type": "Create", "id": "https://a.example/g/activities/2"}),
            Vec::new(),
            vec!["https://b.example/t".to_string()],
            signer(),
        );
        assert!(accepted);

        wait_for(&received, 1).await;
        assert_eq!(received.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn inbox_host_must_resolve_publicly() {
        let client = InboxClient::new(Arc::new(reqwest::Client::new()), Duration::from_secs(1), false);
        let activity = json!({"type": "Create"});

        // Literal private hosts are refused before any lookup
        let result = client
            .deliver_to_inbox("http://10.0.0.1/inbox", &activity, &signer())
            .await;
        assert!(matches!(result, Err(AppError::Forbidden)));

        // Names go through DNS before anything is sent
        let result = client
            .deliver_to_inbox("http://peer.invalid/inbox", &activity, &signer())
            .await;
        match result {
            Err(AppError::Federation(message)) => assert!(message.contains("Failed to resolve"), "{message}"),
            other => panic!("expected a resolution failure, got {:?}", other),
        }
    }
}
