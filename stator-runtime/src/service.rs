//! Service facade bundling the engine behind one handle
//!
//! The worker and the CLI only talk to [`StatorService`].

use crate::lease::LeaseManager;
use crate::runner::{CycleReport, RunSummary, RunnerConfig, StatorRunner};
use crate::trigger::{ManualTrigger, DEFAULT_MANUAL_LEASE};
use crate::{map_storage_error, Error, Result, TransitionReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use stator_core::{Clock, EntityRecord, EntityRef, EntityType, GraphRegistry, StateName};
use stator_storage::{StateCount, StateStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Configuration for [`StatorService`]
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Prefix of every lease owner token taken by this process
    pub worker_id: String,
    pub runner: RunnerConfig,
    /// Lease held while a manual transition is written (default: 30 seconds)
    pub manual_lease: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("stator-{}", Uuid::new_v4().simple()),
            runner: RunnerConfig::default(),
            manual_lease: DEFAULT_MANUAL_LEASE,
        }
    }
}

/// An entity with failed attempts, as shown to operators
#[derive(Debug, Clone, Serialize)]
pub struct StuckEntity {
    pub record: EntityRecord,
    /// Reached the attempt ceiling; only a manual trigger moves it again
    pub frozen: bool,
    pub max_attempts: Option<u32>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// The engine: registry, store, scheduler and manual trigger
pub struct StatorService {
    registry: Arc<GraphRegistry>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    runner: StatorRunner,
    trigger: ManualTrigger,
}

impl StatorService {
    pub fn new(
        registry: GraphRegistry,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        config: ServiceConfig,
    ) -> Result<Self> {
        if config.worker_id.trim().is_empty() {
            return Err(Error::Configuration("worker_id cannot be empty".to_string()));
        }
        if config.manual_lease.is_zero() {
            return Err(Error::Configuration("manual_lease must be > 0".to_string()));
        }

        let registry = Arc::new(registry);
        let leases = Arc::new(LeaseManager::new(
            store.clone(),
            clock.clone(),
            config.worker_id.clone(),
        ));
        let runner = StatorRunner::new(
            registry.clone(),
            store.clone(),
            clock.clone(),
            leases.clone(),
            config.runner,
        )?;
        let trigger = ManualTrigger::new(
            registry.clone(),
            store.clone(),
            clock.clone(),
            leases,
            config.manual_lease,
        );

        info!(
            worker_id = %config.worker_id,
            entity_types = registry.len(),
            "Stator service initialized"
        );

        Ok(Self {
            registry,
            store,
            clock,
            runner,
            trigger,
        })
    }

    pub fn registry(&self) -> &GraphRegistry {
        &self.registry
    }

    pub fn runner(&self) -> &StatorRunner {
        &self.runner
    }

    /// Start tracking a new entity in its graph's initial state
    #[instrument(skip(self), fields(entity_type = %entity_type, entity_id = %id))]
    pub async fn create(&self, entity_type: &EntityType, id: Uuid) -> Result<EntityRecord> {
        let graph = self.registry.require(entity_type)?;
        let record = EntityRecord::new(
            EntityRef::new(entity_type.clone(), id),
            graph.initial().clone(),
            self.clock.now(),
        );
        self.store
            .insert(&record)
            .await
            .map_err(|e| map_storage_error(e, "create entity"))?;
        Ok(record)
    }

    pub async fn get(&self, entity: &EntityRef) -> Result<EntityRecord> {
        self.store
            .get(entity)
            .await
            .map_err(|e| map_storage_error(e, "get entity"))?
            .ok_or_else(|| Error::NotFound(entity.to_string()))
    }

    /// Stop tracking an entity (its domain row was deleted)
    pub async fn delete(&self, entity: &EntityRef) -> Result<()> {
        let existed = self
            .store
            .delete(entity)
            .await
            .map_err(|e| map_storage_error(e, "delete entity"))?;
        if existed {
            Ok(())
        } else {
            Err(Error::NotFound(entity.to_string()))
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.runner.run_cycle().await
    }

    pub async fn wait_idle(&self) -> Vec<TransitionReport> {
        self.runner.wait_idle().await
    }

    pub async fn run<F>(&self, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        self.runner.run(shutdown).await
    }

    pub async fn transition_perform(
        &self,
        entity: &EntityRef,
        target: &StateName,
    ) -> Result<TransitionReport> {
        self.trigger.transition_perform(entity, target).await
    }

    pub async fn force_many(
        &self,
        entities: &[EntityRef],
        target: &StateName,
    ) -> Vec<(EntityRef, Result<TransitionReport>)> {
        self.trigger.force_many(entities, target).await
    }

    /// Retrying and frozen entities, most attempts first, optionally of one type
    pub async fn stuck(
        &self,
        entity_type: Option<&EntityType>,
        limit: usize,
    ) -> Result<Vec<StuckEntity>> {
        let records = self
            .store
            .list_stuck(entity_type, limit)
            .await
            .map_err(|e| map_storage_error(e, "list stuck entities"))?;

        Ok(records
            .into_iter()
            .map(|record| {
                let policy = self
                    .registry
                    .get(&record.entity.entity_type)
                    .map(|graph| graph.retry_policy(&record.state).clone());
                match policy {
                    Some(policy) => {
                        let frozen = record.is_frozen(&policy);
                        StuckEntity {
                            next_attempt_at: (!frozen).then(|| record.next_attempt_at(&policy)),
                            max_attempts: Some(policy.max_attempts),
                            frozen,
                            record,
                        }
                    }
                    None => StuckEntity {
                        record,
                        frozen: false,
                        max_attempts: None,
                        next_attempt_at: None,
                    },
                }
            })
            .collect())
    }

    /// Entity counts per type and state
    pub async fn counts(&self) -> Result<Vec<StateCount>> {
        self.store
            .count_by_state()
            .await
            .map_err(|e| map_storage_error(e, "count entities"))
    }
}
