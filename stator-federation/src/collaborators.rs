//! Boundaries to the rest of the social server
//!
//! Handlers only see these traits. The server wires in implementations that
//! speak ActivityPub, talk to the database and send mail; the engine never
//! depends on how.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Result of refreshing a remote actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActorFetch {
    /// Actor document fetched and stored (or the identity is local)
    Updated,
    /// The remote server says the actor no longer exists
    Gone,
}

#[async_trait]
pub trait ActorFetcher: Send + Sync {
    async fn fetch_actor(&self, identity_id: Uuid) -> anyhow::Result<ActorFetch>;
}

/// Result of applying an inbox message's side effects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxResult {
    Processed,
    /// The message can never be applied (bad signature, unknown activity)
    Rejected(String),
}

#[async_trait]
pub trait InboxProcessor: Send + Sync {
    async fn process(&self, message_id: Uuid) -> anyhow::Result<InboxResult>;
}

/// Delivery of a post (or its deletion) to followers' inboxes
#[async_trait]
pub trait FanOut: Send + Sync {
    /// Returns the number of deliveries queued
    async fn fan_out(&self, post_id: Uuid) -> anyhow::Result<usize>;

    async fn fan_out_delete(&self, post_id: Uuid) -> anyhow::Result<usize>;
}

/// How a follow request was delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowRequest {
    /// Target is local and accepted immediately
    AcceptedLocally,
    /// Sent to a remote server; waiting for its Accept
    SentRemote,
}

#[async_trait]
pub trait FollowDelivery: Send + Sync {
    async fn request(&self, follow_id: Uuid) -> anyhow::Result<FollowRequest>;

    async fn undo(&self, follow_id: Uuid) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_password_reset(&self, reset_id: Uuid) -> anyhow::Result<()>;
}

/// Every collaborator the federation graphs need
#[derive(Clone)]
pub struct Collaborators {
    pub actors: Arc<dyn ActorFetcher>,
    pub inbox: Arc<dyn InboxProcessor>,
    pub fan_out: Arc<dyn FanOut>,
    pub follows: Arc<dyn FollowDelivery>,
    pub mailer: Arc<dyn Mailer>,
}

impl Collaborators {
    /// Collaborators that only log what they would do
    pub fn dry_run() -> Self {
        let dry = Arc::new(DryRun::default());
        Self {
            actors: dry.clone(),
            inbox: dry.clone(),
            fan_out: dry.clone(),
            follows: dry.clone(),
            mailer: dry,
        }
    }
}

/// Logs every call and reports success; records calls for inspection.
///
/// Used by the standalone worker when no server is wired in, and in tests.
#[derive(Debug, Default)]
pub struct DryRun {
    calls: Mutex<Vec<(&'static str, Uuid)>>,
}

impl DryRun {
    fn record(&self, call: &'static str, id: Uuid) {
        info!(call = call, id = %id, "Dry-run collaborator call");
        self.calls.lock().push((call, id));
    }

    pub fn calls(&self) -> Vec<(&'static str, Uuid)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ActorFetcher for DryRun {
    async fn fetch_actor(&self, identity_id: Uuid) -> anyhow::Result<ActorFetch> {
        self.record("fetch_actor", identity_id);
        Ok(ActorFetch::Updated)
    }
}

#[async_trait]
impl InboxProcessor for DryRun {
    async fn process(&self, message_id: Uuid) -> anyhow::Result<InboxResult> {
        self.record("process_inbox", message_id);
        Ok(InboxResult::Processed)
    }
}

#[async_trait]
impl FanOut for DryRun {
    async fn fan_out(&self, post_id: Uuid) -> anyhow::Result<usize> {
        self.record("fan_out", post_id);
        Ok(0)
    }

    async fn fan_out_delete(&self, post_id: Uuid) -> anyhow::Result<usize> {
        self.record("fan_out_delete", post_id);
        Ok(0)
    }
}

#[async_trait]
impl FollowDelivery for DryRun {
    async fn request(&self, follow_id: Uuid) -> anyhow::Result<FollowRequest> {
        self.record("follow_request", follow_id);
        Ok(FollowRequest::SentRemote)
    }

    async fn undo(&self, follow_id: Uuid) -> anyhow::Result<()> {
        self.record("follow_undo", follow_id);
        Ok(())
    }
}

#[async_trait]
impl Mailer for DryRun {
    async fn send_password_reset(&self, reset_id: Uuid) -> anyhow::Result<()> {
        self.record("send_password_reset", reset_id);
        Ok(())
    }
}
