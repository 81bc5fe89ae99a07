//! Manual trigger: operator-forced transitions
//!
//! Goes through the same claim path as the scheduler, so a forced
//! transition never races a running handler. A live lease means `Busy`;
//! the caller retries later.

use crate::executor::{AdvanceKind, Outcome, TransitionReport};
use crate::lease::LeaseManager;
use crate::metrics::TRANSITIONS_TOTAL;
use crate::{map_storage_error, Error, Result};
use stator_core::{Clock, EntityRef, GraphRegistry, StateName};
use stator_storage::{StateStore, StateUpdate};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Default lease held while a manual transition is written
pub const DEFAULT_MANUAL_LEASE: Duration = Duration::from_secs(30);

/// Forces entities into a target state on operator request
pub struct ManualTrigger {
    registry: Arc<GraphRegistry>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    leases: Arc<LeaseManager>,
    manual_lease: Duration,
}

impl ManualTrigger {
    pub fn new(
        registry: Arc<GraphRegistry>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        leases: Arc<LeaseManager>,
        manual_lease: Duration,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            leases,
            manual_lease,
        }
    }

    /// Force `entity` into `target`.
    ///
    /// `target` must be an automatic or manual edge from the current state,
    /// or the current state itself (a reset that clears the attempt counter
    /// and unfreezes the entity).
    #[instrument(
        skip(self),
        fields(entity_type = %entity.entity_type, entity_id = %entity.id, target = %target)
    )]
    pub async fn transition_perform(
        &self,
        entity: &EntityRef,
        target: &StateName,
    ) -> Result<TransitionReport> {
        let start = Instant::now();
        let graph = self.registry.require(&entity.entity_type)?;

        if !graph.contains(target) {
            return Err(Error::InvariantViolation(format!(
                "'{}' is not a state of '{}'",
                target, entity.entity_type
            )));
        }

        let Some(claim) = self.leases.try_claim(entity, self.manual_lease).await? else {
            let exists = self
                .store
                .get(entity)
                .await
                .map_err(|e| map_storage_error(e, "look up entity"))?
                .is_some();
            return Err(if exists {
                Error::Busy(format!("{} is claimed by another worker", entity))
            } else {
                Error::NotFound(entity.to_string())
            });
        };

        let current = claim.record.state.clone();
        if !graph.can_force(&current, target) {
            self.leases.release(&claim.lease).await?;
            warn!(from = %current, "Rejected manual transition to unreachable state");
            return Err(Error::InvariantViolation(format!(
                "'{}' is not reachable from '{}' for '{}'",
                target, current, entity.entity_type
            )));
        }

        let update = StateUpdate::Transitioned {
            state: target.clone(),
            at: self.clock.now(),
        };
        let written = self
            .store
            .complete(entity, &claim.lease.owner, &update)
            .await
            .map_err(|e| map_storage_error(e, "write manual transition"))?;

        let outcome = if written {
            TRANSITIONS_TOTAL
                .with_label_values(&[entity.entity_type.as_str(), current.as_str(), target.as_str()])
                .inc();
            info!(from = %current, "Manual transition applied");
            Outcome::Advanced {
                to: target.clone(),
                via: AdvanceKind::Manual,
            }
        } else {
            warn!("Manual lease lost before write-back");
            Outcome::LeaseLost
        };

        Ok(TransitionReport {
            entity: entity.clone(),
            from_state: current,
            outcome,
            duration: start.elapsed(),
        })
    }

    /// Force each entity in `entities` into `target`, one result per entity
    pub async fn force_many(
        &self,
        entities: &[EntityRef],
        target: &StateName,
    ) -> Vec<(EntityRef, Result<TransitionReport>)> {
        let mut results = Vec::with_capacity(entities.len());
        for entity in entities {
            let result = self.transition_perform(entity, target).await;
            results.push((entity.clone(), result));
        }
        results
    }
}
