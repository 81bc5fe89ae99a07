//! Post lifecycle: fan out on creation, fan out the deletion on delete
//!
//! ```text
//! new --fan out--> fanned_out --(author deletes)--> deleted --fan out--> deleted_fanned_out
//! ```

use crate::collaborators::FanOut;
use crate::FederationConfig;
use async_trait::async_trait;
use stator_core::{EntityRecord, Result, StateDef, StateGraph, Transition, TransitionHandler};
use std::sync::Arc;
use tracing::debug;

pub const ENTITY_TYPE: &str = "post";
pub const NEW: &str = "new";
pub const FANNED_OUT: &str = "fanned_out";
pub const DELETED: &str = "deleted";
pub const DELETED_FANNED_OUT: &str = "deleted_fanned_out";

pub struct FanOutPost {
    fan_out: Arc<dyn FanOut>,
}

#[async_trait]
impl TransitionHandler for FanOutPost {
    async fn handle(&self, entity: &EntityRecord) -> anyhow::Result<Transition> {
        let deliveries = self.fan_out.fan_out(entity.entity.id).await?;
        debug!(post_id = %entity.entity.id, deliveries, "Post fanned out");
        Ok(Transition::to(FANNED_OUT))
    }
}

pub struct FanOutDelete {
    fan_out: Arc<dyn FanOut>,
}

#[async_trait]
impl TransitionHandler for FanOutDelete {
    async fn handle(&self, entity: &EntityRecord) -> anyhow::Result<Transition> {
        self.fan_out.fan_out_delete(entity.entity.id).await?;
        Ok(Transition::to(DELETED_FANNED_OUT))
    }
}

pub fn graph(fan_out: Arc<dyn FanOut>, config: &FederationConfig) -> Result<StateGraph> {
    StateGraph::builder(ENTITY_TYPE)
        .handler_timeout(config.handler_timeout)
        .initial(NEW)
        .state(
            StateDef::new(NEW)
                .transitions_to([FANNED_OUT])
                .handler(FanOutPost {
                    fan_out: fan_out.clone(),
                }),
        )
        .state(
            StateDef::new(FANNED_OUT)
                .transitions_to([DELETED])
                .manual_to([NEW])
                .externally_progressed(),
        )
        .state(
            StateDef::new(DELETED)
                .transitions_to([DELETED_FANNED_OUT])
                .handler(FanOutDelete { fan_out }),
        )
        .state(StateDef::terminal(DELETED_FANNED_OUT))
        .build()
}
