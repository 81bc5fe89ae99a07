//! Inbox message lifecycle
//!
//! ```text
//! received --process--> processed --(retention)--> deleted
//! ```
//!
//! Operators may reset a processed message back to `received` to replay
//! it. A message can never jump from `received` straight to `deleted`.

use crate::collaborators::{InboxProcessor, InboxResult};
use crate::FederationConfig;
use async_trait::async_trait;
use stator_core::{EntityRecord, Result, StateDef, StateGraph, Transition, TransitionHandler};
use std::sync::Arc;

pub const ENTITY_TYPE: &str = "inbox_message";
pub const RECEIVED: &str = "received";
pub const PROCESSED: &str = "processed";
pub const DELETED: &str = "deleted";

pub struct ProcessMessage {
    processor: Arc<dyn InboxProcessor>,
}

#[async_trait]
impl TransitionHandler for ProcessMessage {
    async fn handle(&self, entity: &EntityRecord) -> anyhow::Result<Transition> {
        Ok(match self.processor.process(entity.entity.id).await? {
            InboxResult::Processed => Transition::to(PROCESSED),
            InboxResult::Rejected(reason) => Transition::Fail(reason),
        })
    }
}

pub fn graph(processor: Arc<dyn InboxProcessor>, config: &FederationConfig) -> Result<StateGraph> {
    StateGraph::builder(ENTITY_TYPE)
        .handler_timeout(config.handler_timeout)
        .initial(RECEIVED)
        .state(
            StateDef::new(RECEIVED)
                .transitions_to([PROCESSED])
                .handler(ProcessMessage { processor }),
        )
        .state(
            StateDef::new(PROCESSED)
                .transitions_to([DELETED])
                .manual_to([RECEIVED])
                .externally_progressed()
                .timeout_after(config.inbox_retention, DELETED),
        )
        .state(StateDef::terminal(DELETED))
        .build()
}
