//! Follow Handshake Coordinator
//!
//! Follow -> Accept | Reject between a local board and a remote actor, in
//! both directions:
//!
//! - inbound Follow: persist the follower (upsert keyed by the ordered pair),
//!   send Accept, then reciprocate when the board auto-subscribes;
//! - outbound Follow: record a pending relationship, which an inbound Accept
//!   promotes and an inbound Reject clears.

use std::sync::Arc;

use super::activity::{Activity, ActivityKind, ActivityObject, builder};
use super::delivery::{DeliveryDispatcher, Signer};
use super::directory::ActorDirectory;
use crate::data::{Actor, BoardCache, Database};
use crate::error::AppError;

/// Result of handling an inbound Follow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowOutcome {
    Accepted {
        /// `false` when the pair was already recorded
        new_follower: bool,
        /// A Follow was sent back to the requester
        reciprocated: bool,
    },
    /// Target is not a local actor; nothing persisted
    Rejected,
}

/// Result of toggling an outbound follow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToggleOutcome {
    Requested,
    Unfollowed,
}

pub struct FollowCoordinator {
    db: Arc<Database>,
    directory: Arc<ActorDirectory>,
    delivery: DeliveryDispatcher,
    boards: Arc<BoardCache>,
}

impl FollowCoordinator {
    pub fn new(
        db: Arc<Database>,
        directory: Arc<ActorDirectory>,
        delivery: DeliveryDispatcher,
        boards: Arc<BoardCache>,
    ) -> Self {
        Self {
            db,
            directory,
            delivery,
            boards,
        }
    }

    /// Handle a verified inbound Follow
    pub async fn handle_follow(&self, follow: &Activity) -> Result<FollowOutcome, AppError> {
        let requester = self.directory.resolve(&follow.actor).await?;

        let Some(target) = self.local_target(follow).await? else {
            self.reject_unknown_target(follow, &requester.inbox).await;
            return Ok(FollowOutcome::Rejected);
        };

        let accept = builder::accept(&target, &follow.raw, &requester.id);
        let new_follower = self
            .db
            .upsert_follower(
                &requester.id,
                &target.id,
                &requester.inbox,
                follow.id.as_deref(),
            )
            .await?;
        tracing::info!(
            follower = %requester.id,
            target = %target.id,
            new_follower,
            "Accepted follow"
        );

        // The follower is recorded either way; the Accept is best-effort
        let _ = self
            .delivery
            .deliver_now(&requester.inbox, &accept, &Signer::for_actor(&target)?)
            .await;

        let reciprocated = self.reciprocate(&target, &requester).await?;
        Ok(FollowOutcome::Accepted {
            new_follower,
            reciprocated,
        })
    }

    /// Promote a pending outbound follow after the remote side accepted it
    ///
    /// Returns `false` when there was no pending record for the pair.
    pub async fn handle_accept(&self, accept: &Activity) -> Result<bool, AppError> {
        let Some(follower) = self.own_follow_actor(accept) else {
            return Ok(false);
        };

        let pending = self
            .db
            .get_follow(&follower, &accept.actor)
            .await?
            .is_some_and(|relation| relation.state == crate::data::FollowState::Pending);
        if !pending {
            tracing::debug!(actor = %accept.actor, %follower, "Accept without pending follow");
            return Ok(false);
        }

        self.db.accept_follow(&follower, &accept.actor).await?;
        self.boards.refresh().await?;
        tracing::info!(%follower, target = %accept.actor, "Follow accepted");
        Ok(true)
    }

    /// Clear a pending outbound follow the remote side refused
    pub async fn handle_reject(&self, reject: &Activity) -> Result<bool, AppError> {
        let Some(follower) = self.own_follow_actor(reject) else {
            return Ok(false);
        };

        let cleared = self.db.clear_pending_follow(&follower, &reject.actor).await?;
        if cleared {
            self.boards.refresh().await?;
            tracing::info!(%follower, target = %reject.actor, "Follow rejected");
        }
        Ok(cleared)
    }

    /// Follow `target` from a local actor unless a relationship exists
    ///
    /// Returns `false` when already following or pending.
    pub async fn follow(&self, local: &Actor, target: &Actor) -> Result<bool, AppError> {
        let follow = builder::follow(local, &target.id);
        let activity_id = follow["id"].as_str().unwrap_or_default().to_string();

        let inserted = self
            .db
            .insert_pending_follow(&local.id, &target.id, &target.inbox, &activity_id)
            .await?;
        if !inserted {
            return Ok(false);
        }

        if let Err(error) = self
            .delivery
            .deliver_now(&target.inbox, &follow, &Signer::for_actor(local)?)
            .await
        {
            // Nothing was sent, so nothing will ever answer this record
            self.db.clear_pending_follow(&local.id, &target.id).await?;
            return Err(error);
        }

        self.boards.refresh().await?;
        tracing::info!(actor = %local.id, target = %target.id, "Follow requested");
        Ok(true)
    }

    /// Follow `target` (Id or `name@host`), or stop following it
    pub async fn toggle_follow(&self, local: &Actor, target: &str) -> Result<ToggleOutcome, AppError> {
        let target = self.directory.resolve_handle(target).await?;

        if self.db.remove_follow(&local.id, &target.id).await? {
            self.boards.refresh().await?;
            tracing::info!(actor = %local.id, target = %target.id, "Unfollowed");
            return Ok(ToggleOutcome::Unfollowed);
        }

        self.follow(local, &target).await?;
        Ok(ToggleOutcome::Requested)
    }

    /// AutoSubscribe: follow the requester back unless already following
    async fn reciprocate(&self, local: &Actor, requester: &Actor) -> Result<bool, AppError> {
        if !local.auto_subscribe {
            return Ok(false);
        }
        if self.db.get_follow(&local.id, &requester.id).await?.is_some() {
            return Ok(false);
        }

        match self.follow(local, requester).await {
            Ok(sent) => Ok(sent),
            Err(error) => {
                tracing::warn!(actor = %local.id, target = %requester.id, %error, "Auto-subscribe failed");
                Ok(false)
            }
        }
    }

    /// The local actor a Follow is addressed to: object first, then To
    async fn local_target(&self, follow: &Activity) -> Result<Option<Actor>, AppError> {
        let candidates = follow
            .object
            .id()
            .map(str::to_string)
            .into_iter()
            .chain(follow.to.iter().cloned());

        for candidate in candidates {
            if !self.directory.is_local_id(&candidate) {
                continue;
            }
            if let Some(actor) = self.directory.get_local(&candidate).await? {
                return Ok(Some(actor));
            }
        }
        Ok(None)
    }

    async fn reject_unknown_target(&self, follow: &Activity, requester_inbox: &str) {
        let instance = match self.db.get_instance_actor().await {
            Ok(Some(instance)) => instance,
            Ok(None) => return,
            Err(error) => {
                tracing::warn!(%error, "Cannot load instance actor for Reject");
                return;
            }
        };

        let reject = builder::reject(&instance.id, &follow.raw, &follow.actor);
        match Signer::for_actor(&instance) {
            Ok(signer) => {
                let _ = self.delivery.deliver_now(requester_inbox, &reject, &signer).await;
            }
            Err(error) => tracing::warn!(%error, "Cannot sign Reject"),
        }
        tracing::info!(actor = %follow.actor, "Rejected follow for unknown target");
    }

    /// Local actor that issued the Follow an Accept/Reject answers
    ///
    /// The object is the Follow itself, or an activity wrapping it.
    fn own_follow_actor(&self, answer: &Activity) -> Option<String> {
        let follow = match &answer.object {
            ActivityObject::Activity(object) if object.kind == ActivityKind::Follow => object,
            ActivityObject::Activity(object) => match &object.object {
                ActivityObject::Activity(inner) if inner.kind == ActivityKind::Follow => inner,
                _ => return None,
            },
            _ => return None,
        };

        self.directory
            .is_local_id(&follow.actor)
            .then(|| follow.actor.clone())
    }
}
