//! Inbox Dispatcher
//!
//! Inbound state machine. Nothing touches storage before the Signature
//! Verifier has accepted the request; a failed check produces a Reject
//! document for the sender and no mutation. Verified activities are
//! recorded by Id, so a replay is acknowledged without being applied again.

use serde_json::Value;
use std::sync::Arc;

use super::activity::{Activity, ActivityKind, ActivityObject, PostObject, builder};
use super::delivery::{DeliveryDispatcher, Signer};
use super::directory::ActorDirectory;
use super::follow::FollowCoordinator;
use super::reply::{RemoteObjects, authority_of};
use super::verifier::{SignatureVerifier, SignedRequest};
use crate::data::{Actor, Database};
use crate::error::AppError;
use crate::metrics::ACTIVITIES_RECEIVED;

/// How an inbound activity ended
#[derive(Debug, Clone, PartialEq)]
pub enum InboxOutcome {
    /// Verified and applied
    Accepted,
    /// Activity Id seen before; acknowledged, not re-applied
    Duplicate,
    /// Verified but nothing to do
    Ignored,
    /// Signature not verified; the Reject to hand back to the sender
    Rejected(Value),
}

pub struct InboxDispatcher {
    db: Arc<Database>,
    directory: Arc<ActorDirectory>,
    verifier: SignatureVerifier,
    follows: Arc<FollowCoordinator>,
    delivery: DeliveryDispatcher,
    /// Origin lookups for objects relayed by a third party
    remote: Arc<dyn RemoteObjects>,
    live_thread_window: usize,
}

impl InboxDispatcher {
    pub fn new(
        db: Arc<Database>,
        directory: Arc<ActorDirectory>,
        follows: Arc<FollowCoordinator>,
        delivery: DeliveryDispatcher,
        remote: Arc<dyn RemoteObjects>,
        live_thread_window: usize,
    ) -> Self {
        Self {
            verifier: SignatureVerifier::new(directory.clone()),
            db,
            directory,
            follows,
            delivery,
            remote,
            live_thread_window,
        }
    }

    /// Handle a POST to `owner`'s inbox
    pub async fn receive(
        &self,
        owner: &Actor,
        request: &SignedRequest<'_>,
    ) -> Result<InboxOutcome, AppError> {
        let document: Value = serde_json::from_slice(request.body)
            .map_err(|e| AppError::Validation(format!("Invalid activity document: {}", e)))?;
        let activity = Activity::from_value(&document)?;

        if !self.verifier.verify(request, &activity.actor).await {
            ACTIVITIES_RECEIVED.with_label_values(&["rejected"]).inc();
            return Ok(InboxOutcome::Rejected(builder::reject(
                &owner.id,
                &activity.raw,
                &activity.actor,
            )));
        }

        if let Some(id) = &activity.id {
            if !self
                .db
                .record_inbound_activity(id, activity.kind.as_str(), &activity.actor)
                .await?
            {
                tracing::debug!(activity = %id, "Replayed activity ignored");
                return Ok(InboxOutcome::Duplicate);
            }
        }

        ACTIVITIES_RECEIVED
            .with_label_values(&[activity.kind.as_str()])
            .inc();
        tracing::info!(
            kind = %activity.kind,
            actor = %activity.actor,
            inbox = %owner.id,
            "Received activity"
        );

        let outcome = self.dispatch(owner, &activity).await;
        if outcome.is_err() {
            if let Some(id) = &activity.id {
                // Let the sender's next attempt be applied
                self.db.forget_inbound_activity(id).await?;
            }
        }
        outcome
    }

    async fn dispatch(&self, owner: &Actor, activity: &Activity) -> Result<InboxOutcome, AppError> {
        match activity.kind {
            ActivityKind::Create => self.handle_create(owner, activity).await,
            ActivityKind::Delete => self.handle_delete(owner, activity).await,
            ActivityKind::Follow => {
                self.follows.handle_follow(activity).await?;
                Ok(InboxOutcome::Accepted)
            }
            ActivityKind::Accept => {
                self.follows.handle_accept(activity).await?;
                Ok(InboxOutcome::Accepted)
            }
            ActivityKind::Reject => {
                self.follows.handle_reject(activity).await?;
                Ok(InboxOutcome::Accepted)
            }
            ActivityKind::Update | ActivityKind::New => Ok(InboxOutcome::Ignored),
        }
    }

    // =========================================================================
    // Create
    // =========================================================================

    async fn handle_create(&self, owner: &Actor, activity: &Activity) -> Result<InboxOutcome, AppError> {
        let ActivityObject::Post(note) = &activity.object else {
            tracing::debug!(actor = %activity.actor, "Create without a post object");
            return Ok(InboxOutcome::Ignored);
        };

        let Some(note) = self.trusted_note(activity, note).await? else {
            return Ok(InboxOutcome::Ignored);
        };

        let boards = self.local_recipients(owner, activity).await?;
        if boards.is_empty() {
            return Ok(InboxOutcome::Ignored);
        }

        for board in &boards {
            self.process_create(board, &note, activity).await?;
        }
        Ok(InboxOutcome::Accepted)
    }

    /// Persist the post for one local board
    ///
    /// Boards named in `to` relay the object to their followers; boards only
    /// in `cc` keep a copy without relaying it.
    async fn process_create(
        &self,
        board: &Actor,
        note: &PostObject,
        activity: &Activity,
    ) -> Result<(), AppError> {
        let post = note.to_post(&board.id);

        if let Some(target) = post.in_reply_to.first() {
            let root = self
                .db
                .thread_root_of(target)
                .await?
                .unwrap_or_else(|| target.clone());
            let Some(thread) = self.db.get_post(&root).await? else {
                tracing::debug!(post = %post.id, thread = %root, "Reply to unknown thread dropped");
                return Ok(());
            };
            if thread.locked || thread.tombstoned {
                tracing::debug!(post = %post.id, thread = %root, "Reply to closed thread dropped");
                return Ok(());
            }

            if self.db.insert_post(&post).await? && !post.has_option("sage") {
                self.db.bump_thread(&root, post.updated).await?;
            }
        } else if self.db.insert_post(&post).await? {
            let archived = self
                .db
                .archive_overflow(&board.id, self.live_thread_window)
                .await?;
            if !archived.is_empty() {
                tracing::info!(board = %board.id, count = archived.len(), "Archived threads");
            }
        }

        if activity.to.iter().any(|id| *id == board.id) {
            self.relay(board, activity).await;
        }
        Ok(())
    }

    /// Fan the object out again to the board's own followers
    async fn relay(&self, board: &Actor, activity: &Activity) {
        let inboxes = match self.db.get_follower_inboxes(&board.id).await {
            Ok(inboxes) => inboxes,
            Err(error) => {
                tracing::warn!(board = %board.id, %error, "Cannot load followers for relay");
                return;
            }
        };

        let origin_inbox = self
            .directory
            .cached(&activity.actor)
            .await
            .map(|actor| actor.inbox.clone());
        let inboxes: Vec<String> = inboxes
            .into_iter()
            .filter(|inbox| Some(inbox) != origin_inbox.as_ref() && *inbox != board.inbox)
            .collect();
        if inboxes.is_empty() {
            return;
        }

        let signer = match Signer::for_actor(board) {
            Ok(signer) => signer,
            Err(error) => {
                tracing::warn!(board = %board.id, %error, "Cannot sign relay");
                return;
            }
        };
        let object = activity.raw.get("object").cloned().unwrap_or(Value::Null);
        let relayed = builder::create(board, object, &[]);
        self.delivery.deliver(relayed, inboxes, signer);
    }

    /// The note as its origin vouches for it
    ///
    /// Notes created by the sending actor's own node are taken as sent.
    /// Anything else was relayed and is fetched again from its origin.
    async fn trusted_note(
        &self,
        activity: &Activity,
        note: &PostObject,
    ) -> Result<Option<PostObject>, AppError> {
        if same_authority(&note.id, &activity.actor) {
            return Ok(Some(note.clone()));
        }

        let fetched = match self.remote.fetch_object(&note.id).await {
            Ok(Some(document)) => document,
            Ok(None) => {
                tracing::warn!(object = %note.id, actor = %activity.actor, "Relayed object not found at origin");
                return Ok(None);
            }
            Err(error) => {
                tracing::warn!(object = %note.id, actor = %activity.actor, %error, "Relayed object unverifiable");
                return Ok(None);
            }
        };

        match serde_json::from_value::<PostObject>(fetched) {
            Ok(origin) if origin.id == note.id && origin.kind != "Tombstone" => Ok(Some(origin)),
            _ => {
                tracing::warn!(object = %note.id, "Origin returned a different object");
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    async fn handle_delete(&self, owner: &Actor, activity: &Activity) -> Result<InboxOutcome, AppError> {
        let Some(target) = activity.object.id() else {
            return Ok(InboxOutcome::Ignored);
        };
        if !same_authority(target, &activity.actor) {
            tracing::warn!(object = %target, actor = %activity.actor, "Delete for foreign object dropped");
            return Ok(InboxOutcome::Ignored);
        }

        let boards = self.local_recipients(owner, activity).await?;
        let Some(addressed) = boards.first() else {
            return Ok(InboxOutcome::Ignored);
        };

        let listed: Vec<String> = match &activity.object {
            ActivityObject::Post(object) => object
                .reply_ids()
                .into_iter()
                .filter(|id| same_authority(id, &activity.actor))
                .collect(),
            _ => Vec::new(),
        };

        let board_id = match self.db.get_post(target).await? {
            Some(post) => post.board_id,
            None => addressed.id.clone(),
        };
        let outcome = self
            .db
            .tombstone_cascade(&board_id, target, &listed, self.live_thread_window)
            .await?;

        tracing::info!(
            object = %target,
            tombstoned = outcome.tombstoned.len(),
            unarchived = ?outcome.unarchived,
            "Applied remote delete"
        );
        Ok(InboxOutcome::Accepted)
    }

    /// Local boards addressed by the activity: the inbox owner plus To and Cc
    async fn local_recipients(&self, owner: &Actor, activity: &Activity) -> Result<Vec<Actor>, AppError> {
        let mut boards: Vec<Actor> = Vec::new();
        if !owner.is_instance {
            boards.push(owner.clone());
        }

        for id in activity.recipients() {
            if !self.directory.is_local_id(&id) || boards.iter().any(|b| b.id == id) {
                continue;
            }
            if let Some(actor) = self.directory.get_local(&id).await? {
                if !actor.is_instance {
                    boards.push(actor);
                }
            }
        }
        Ok(boards)
    }
}

fn same_authority(a: &str, b: &str) -> bool {
    match (authority_of(a), authority_of(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BoardCache, Post, PostType};
    use crate::federation::reply::MockRemoteObjects;
    use crate::federation::signature::tests::{generate_test_keypair, signed_headers};
    use chrono::Utc;
    use futures::FutureExt;
    use serde_json::json;
    use tempfile::TempDir;

    const BASE: &str = "https://a.example";

    struct Fixture {
        dispatcher: InboxDispatcher,
        db: Arc<Database>,
        board: Actor,
        sender: Actor,
        _temp_dir: TempDir,
    }

    fn actor(name: &str) -> Actor {
        let (private_key_pem, public_key_pem) = generate_test_keypair();
        let id = format!("{BASE}/{name}");
        Actor {
            id: id.clone(),
            name: name.to_string(),
            preferred_username: name.to_string(),
            summary: String::new(),
            inbox: format!("{id}/inbox"),
            outbox: format!("{id}/outbox"),
            following: format!("{id}/following"),
            followers: format!("{id}/followers"),
            public_key_pem: Some(public_key_pem),
            private_key_pem: Some(private_key_pem),
            restricted: false,
            auto_subscribe: false,
            is_instance: false,
            created_at: Utc::now(),
        }
    }

    async fn fixture(remote: MockRemoteObjects) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("i.db")).await.unwrap());
        let board = actor("g");
        let sender = actor("t");
        db.insert_actor(&board).await.unwrap();
        db.insert_actor(&sender).await.unwrap();

        let directory = Arc::new(ActorDirectory::new(
            db.clone(),
            Arc::new(reqwest::Client::new()),
            BASE.to_string(),
            false,
        ));
        let delivery = DeliveryDispatcher::closed();
        let follows = Arc::new(FollowCoordinator::new(
            db.clone(),
            directory.clone(),
            delivery.clone(),
            Arc::new(BoardCache::new(db.clone())),
        ));
        let dispatcher = InboxDispatcher::new(
            db.clone(),
            directory,
            follows,
            delivery,
            Arc::new(remote),
            3,
        );

        Fixture {
            dispatcher,
            db,
            board,
            sender,
            _temp_dir: temp_dir,
        }
    }

    async fn deliver(f: &Fixture, document: &Value, key_pem: &str) -> InboxOutcome {
        let body = serde_json::to_vec(document).unwrap();
        let (headers, path) = signed_headers(&f.board.inbox, &body, key_pem, &f.sender.key_id());
        let request = SignedRequest {
            method: "POST",
            path: &path,
            headers: &headers,
            body: &body,
        };
        f.dispatcher.receive(&f.board, &request).await.unwrap()
    }

    fn create(f: &Fixture, id: &str, note: Value) -> Value {
        json!({
            "id": format!("{}/activities/{}", f.sender.id, id),
            "type": "Create",
            "actor": f.sender.id,
            "to": [f.board.id],
            "object": note,
        })
    }

    fn note(f: &Fixture, slug: &str, in_reply_to: &[&str]) -> Value {
        json!({
            "type": "Note",
            "id": format!("{}/{}", f.sender.id, slug),
            "content": "hello",
            "inReplyTo": in_reply_to,
        })
    }

    #[tokio::test]
    async fn bad_signature_is_rejected_without_mutation() {
        let f = fixture(MockRemoteObjects::new()).await;
        let (stranger, _) = generate_test_keypair();

        let outcome = deliver(&f, &create(&f, "1", note(&f, "AAAA", &[])), &stranger).await;
        match outcome {
            InboxOutcome::Rejected(reject) => {
                assert_eq!(reject["type"], "Reject");
                assert_eq!(reject["object"]["type"], "Create");
            }
            other => panic!("expected Reject, got {:?}", other),
        }
        assert!(!f.db.post_exists("https://a.example/t/AAAA").await.unwrap());
        // The activity Id was not recorded either
        assert!(f
            .db
            .record_inbound_activity("https://a.example/t/activities/1", "Create", &f.sender.id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn create_stores_post_once() {
        let f = fixture(MockRemoteObjects::new()).await;
        let key = f.sender.private_key_pem.clone().unwrap();
        let document = create(&f, "1", note(&f, "AAAA", &[]));

        assert_eq!(deliver(&f, &document, &key).await, InboxOutcome::Accepted);
        assert_eq!(deliver(&f, &document, &key).await, InboxOutcome::Duplicate);

        let stored = f.db.get_post("https://a.example/t/AAAA").await.unwrap().unwrap();
        assert!(stored.is_op());
        assert_eq!(stored.board_id, f.board.id);
        assert!(!stored.is_local);
    }

    #[tokio::test]
    async fn reply_to_unknown_thread_is_dropped() {
        let f = fixture(MockRemoteObjects::new()).await;
        let key = f.sender.private_key_pem.clone().unwrap();
        let document = create(&f, "1", note(&f, "BBBB", &["https://a.example/t/NOPE"]));

        deliver(&f, &document, &key).await;
        assert!(!f.db.post_exists("https://a.example/t/BBBB").await.unwrap());
    }

    #[tokio::test]
    async fn relayed_note_is_checked_at_origin() {
        let mut remote = MockRemoteObjects::new();
        remote
            .expect_fetch_object()
            .withf(|id| id == "https://c.example/x/CCCC")
            .times(1)
            .returning(|_| async { Ok(None) }.boxed());
        let f = fixture(remote).await;
        let key = f.sender.private_key_pem.clone().unwrap();

        let document = create(
            &f,
            "1",
            json!({"type": "Note", "id": "https://c.example/x/CCCC", "content": "forged"}),
        );
        assert_eq!(deliver(&f, &document, &key).await, InboxOutcome::Ignored);
        assert!(!f.db.post_exists("https://c.example/x/CCCC").await.unwrap());
    }

    #[tokio::test]
    async fn delete_of_op_cascades_to_replies() {
        let f = fixture(MockRemoteObjects::new()).await;
        let key = f.sender.private_key_pem.clone().unwrap();
        let op = "https://a.example/t/OPOP";

        deliver(&f, &create(&f, "1", note(&f, "OPOP", &[])), &key).await;
        deliver(&f, &create(&f, "2", note(&f, "RRR1", &[op])), &key).await;
        deliver(&f, &create(&f, "3", note(&f, "RRR2", &[op])), &key).await;

        let delete = json!({
            "id": "https://a.example/t/activities/4",
            "type": "Delete",
            "actor": f.sender.id,
            "to": [f.board.id],
            "object": {"type": "Tombstone", "id": op},
        });
        assert_eq!(deliver(&f, &delete, &key).await, InboxOutcome::Accepted);

        for id in [op, "https://a.example/t/RRR1", "https://a.example/t/RRR2"] {
            let post = f.db.get_post(id).await.unwrap().unwrap();
            assert_eq!(post.object_type, PostType::Tombstone, "{id}");
            assert!(post.content.is_empty());
        }
    }

    #[tokio::test]
    async fn delete_of_foreign_object_is_dropped() {
        let f = fixture(MockRemoteObjects::new()).await;
        let key = f.sender.private_key_pem.clone().unwrap();

        let mut local = Post::new_note("https://c.example/x/KEEP".to_string(), f.board.id.clone());
        local.content = "stay".to_string();
        f.db.insert_post(&local).await.unwrap();

        let delete = json!({
            "id": "https://a.example/t/activities/9",
            "type": "Delete",
            "actor": f.sender.id,
            "object": "https://c.example/x/KEEP",
        });
        assert_eq!(deliver(&f, &delete, &key).await, InboxOutcome::Ignored);
        assert!(!f.db.is_tombstoned("https://c.example/x/KEEP").await.unwrap());
    }

    #[tokio::test]
    async fn update_is_acknowledged_and_ignored() {
        let f = fixture(MockRemoteObjects::new()).await;
        let key = f.sender.private_key_pem.clone().unwrap();
        let update = json!({
            "id": "https://a.example/t/activities/5",
            "type": "Update",
            "actor": f.sender.id,
            "object": f.sender.id,
        });
        assert_eq!(deliver(&f, &update, &key).await, InboxOutcome::Ignored);
    }

    #[tokio::test]
    async fn unknown_kind_fails() {
        let f = fixture(MockRemoteObjects::new()).await;
        let body = br#"{"type":"Like","actor":"https://a.example/t","object":"x"}"#;
        let headers = http::HeaderMap::new();
        let request = SignedRequest {
            method: "POST",
            path: "/g/inbox",
            headers: &headers,
            body,
        };
        assert!(matches!(
            f.dispatcher.receive(&f.board, &request).await,
            Err(AppError::Validation(_))
        ));
    }
}
