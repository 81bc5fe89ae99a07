//! Follow lifecycle
//!
//! ```text
//! unrequested --request--> remote_requested --(Accept arrives)--> accepted
//!             \--local target----------------------------------->/
//! accepted --(unfollow)--> undone --send Undo--> undone_remotely
//! ```
//!
//! `remote_requested` and `accepted` are moved on by the inbox and web
//! layers through the manual trigger.

use crate::collaborators::{FollowDelivery, FollowRequest};
use crate::FederationConfig;
use async_trait::async_trait;
use stator_core::{EntityRecord, Result, StateDef, StateGraph, Transition, TransitionHandler};
use std::sync::Arc;

pub const ENTITY_TYPE: &str = "follow";
pub const UNREQUESTED: &str = "unrequested";
pub const REMOTE_REQUESTED: &str = "remote_requested";
pub const ACCEPTED: &str = "accepted";
pub const UNDONE: &str = "undone";
pub const UNDONE_REMOTELY: &str = "undone_remotely";

pub struct SendRequest {
    delivery: Arc<dyn FollowDelivery>,
}

#[async_trait]
impl TransitionHandler for SendRequest {
    async fn handle(&self, entity: &EntityRecord) -> anyhow::Result<Transition> {
        Ok(match self.delivery.request(entity.entity.id).await? {
            FollowRequest::AcceptedLocally => Transition::to(ACCEPTED),
            FollowRequest::SentRemote => Transition::to(REMOTE_REQUESTED),
        })
    }
}

pub struct SendUndo {
    delivery: Arc<dyn FollowDelivery>,
}

#[async_trait]
impl TransitionHandler for SendUndo {
    async fn handle(&self, entity: &EntityRecord) -> anyhow::Result<Transition> {
        self.delivery.undo(entity.entity.id).await?;
        Ok(Transition::to(UNDONE_REMOTELY))
    }
}

pub fn graph(delivery: Arc<dyn FollowDelivery>, config: &FederationConfig) -> Result<StateGraph> {
    StateGraph::builder(ENTITY_TYPE)
        .handler_timeout(config.handler_timeout)
        .initial(UNREQUESTED)
        .state(
            StateDef::new(UNREQUESTED)
                .transitions_to([REMOTE_REQUESTED, ACCEPTED])
                .handler(SendRequest {
                    delivery: delivery.clone(),
                }),
        )
        .state(
            StateDef::new(REMOTE_REQUESTED)
                .transitions_to([ACCEPTED])
                .manual_to([UNREQUESTED])
                .externally_progressed(),
        )
        .state(
            StateDef::new(ACCEPTED)
                .transitions_to([UNDONE])
                .externally_progressed(),
        )
        .state(
            StateDef::new(UNDONE)
                .transitions_to([UNDONE_REMOTELY])
                .handler(SendUndo { delivery }),
        )
        .state(StateDef::terminal(UNDONE_REMOTELY))
        .build()
}
