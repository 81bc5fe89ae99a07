//! State graphs for federated social objects
//!
//! One module per entity type, each exposing its state names and a
//! `graph` constructor. [`registry`] wires every graph to a set of
//! [`Collaborators`].

pub mod collaborators;
pub mod follow;
pub mod identity;
pub mod inbox;
pub mod password_reset;
pub mod post;

pub use collaborators::{
    ActorFetch, ActorFetcher, Collaborators, DryRun, FanOut, FollowDelivery, FollowRequest,
    InboxProcessor, InboxResult, Mailer,
};

use stator_core::graph::DEFAULT_HANDLER_TIMEOUT;
use stator_core::{EntityType, GraphRegistry, Result, StateName};
use std::time::Duration;

/// Timing knobs for the federation graphs
#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// How long a fetched identity stays `updated` before it is refetched
    /// (default: 1 day)
    pub identity_refresh: Duration,

    /// How long a processed inbox message is kept (default: 7 days)
    pub inbox_retention: Duration,

    /// Lifetime of a password reset link (default: 3 days)
    pub password_reset_ttl: Duration,

    /// Bound on each handler invocation (default: 30 seconds)
    pub handler_timeout: Duration,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            identity_refresh: Duration::from_secs(24 * 3600),
            inbox_retention: Duration::from_secs(7 * 24 * 3600),
            password_reset_ttl: Duration::from_secs(3 * 24 * 3600),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }
}

/// Registry holding every federation graph
pub fn registry(collab: &Collaborators, config: &FederationConfig) -> Result<GraphRegistry> {
    GraphRegistry::new()
        .with(identity::graph(collab.actors.clone(), config)?)?
        .with(follow::graph(collab.follows.clone(), config)?)?
        .with(inbox::graph(collab.inbox.clone(), config)?)?
        .with(post::graph(collab.fan_out.clone(), config)?)?
        .with(password_reset::graph(collab.mailer.clone(), config)?)
}

/// Operator shorthands for common forced transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    /// Refetch an identity now
    ForceUpdate,
    /// Replay an inbox message
    ResetState,
}

impl AdminAction {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "force-update" => Some(Self::ForceUpdate),
            "reset-state" => Some(Self::ResetState),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ForceUpdate => "force-update",
            Self::ResetState => "reset-state",
        }
    }

    /// Entity type and target state this action forces
    pub fn target(&self) -> (EntityType, StateName) {
        match self {
            Self::ForceUpdate => (identity::ENTITY_TYPE.into(), identity::OUTDATED.into()),
            Self::ResetState => (inbox::ENTITY_TYPE.into(), inbox::RECEIVED.into()),
        }
    }
}
