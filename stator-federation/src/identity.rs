//! Identity lifecycle: remote actors are refetched when outdated
//!
//! ```text
//! outdated --fetch--> updated --(refresh interval)--> outdated
//! ```

use crate::collaborators::{ActorFetch, ActorFetcher};
use crate::FederationConfig;
use async_trait::async_trait;
use stator_core::{EntityRecord, Result, StateDef, StateGraph, Transition, TransitionHandler};
use std::sync::Arc;

pub const ENTITY_TYPE: &str = "identity";
pub const OUTDATED: &str = "outdated";
pub const UPDATED: &str = "updated";

/// Refetch the actor document
pub struct FetchActor {
    fetcher: Arc<dyn ActorFetcher>,
}

#[async_trait]
impl TransitionHandler for FetchActor {
    async fn handle(&self, entity: &EntityRecord) -> anyhow::Result<Transition> {
        match self.fetcher.fetch_actor(entity.entity.id).await? {
            ActorFetch::Updated => Ok(Transition::to(UPDATED)),
            ActorFetch::Gone => Ok(Transition::fail("actor no longer exists on its server")),
        }
    }
}

pub fn graph(fetcher: Arc<dyn ActorFetcher>, config: &FederationConfig) -> Result<StateGraph> {
    StateGraph::builder(ENTITY_TYPE)
        .handler_timeout(config.handler_timeout)
        .initial(OUTDATED)
        .state(
            StateDef::new(OUTDATED)
                .transitions_to([UPDATED])
                .handler(FetchActor { fetcher }),
        )
        .state(
            StateDef::new(UPDATED)
                .transitions_to([OUTDATED])
                .externally_progressed()
                .timeout_after(config.identity_refresh, OUTDATED),
        )
        .build()
}
