//! Builders for constructing test objects
//!
//! [`EngineBuilder`] wires registry, in-memory store, manual clock and
//! service together the way the worker does with PostgreSQL.

use crate::fixtures;
use chrono::{DateTime, Utc};
use stator_core::{
    Clock, EntityRecord, EntityRef, EntityType, GraphRegistry, ManualClock, StateGraph,
};
use stator_runtime::{
    LeaseManager, ServiceConfig, StatorService, TransitionExecutor, TransitionReport,
};
use stator_storage::{MemoryStore, StateStore};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Builder for [`EntityRecord`]s in arbitrary states
pub struct EntityRecordBuilder {
    record: EntityRecord,
}

impl EntityRecordBuilder {
    /// Fresh record created at [`fixtures::epoch`]
    pub fn new(entity_type: &str, state: &str) -> Self {
        Self {
            record: EntityRecord::new(
                EntityRef::new(entity_type, Uuid::new_v4()),
                state,
                fixtures::epoch(),
            ),
        }
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.record.entity.id = id;
        self
    }

    /// Entered the current state at `at`
    pub fn changed_at(mut self, at: DateTime<Utc>) -> Self {
        self.record.state_changed = at;
        self
    }

    /// `count` failed attempts, the last one at `at`
    pub fn attempts(mut self, count: u32, at: DateTime<Utc>) -> Self {
        self.record.attempt_count = count;
        self.record.state_attempted = (count > 0).then_some(at);
        self
    }

    /// Leased by `owner` until `until`
    pub fn leased(mut self, owner: &str, until: DateTime<Utc>) -> Self {
        self.record.state_lock_owner = Some(owner.to_string());
        self.record.state_locked_until = Some(until);
        self
    }

    pub fn build(self) -> EntityRecord {
        self.record
    }
}

/// Builder for an in-memory [`TestEngine`]
pub struct EngineBuilder {
    registry: GraphRegistry,
    clock: ManualClock,
    store: Arc<MemoryStore>,
    config: ServiceConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            registry: GraphRegistry::new(),
            clock: fixtures::clock(),
            store: Arc::new(MemoryStore::new()),
            config: ServiceConfig {
                worker_id: "test-worker".to_string(),
                ..ServiceConfig::default()
            },
        }
    }

    pub fn graph(mut self, graph: StateGraph) -> Self {
        self.registry
            .register(graph)
            .expect("graph registered twice");
        self
    }

    pub fn registry(mut self, registry: GraphRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Share a store (and clock) with another engine, as two worker
    /// processes share one database
    pub fn sharing(mut self, other: &TestEngine) -> Self {
        self.store = other.store.clone();
        self.clock = other.clock.clone();
        self
    }

    pub fn worker_id(mut self, worker_id: &str) -> Self {
        self.config.worker_id = worker_id.to_string();
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.runner.concurrency = concurrency;
        self
    }

    pub fn lease_duration(mut self, lease: Duration) -> Self {
        self.config.runner.lease_duration = lease;
        self
    }

    pub fn build(self) -> TestEngine {
        let registry = Arc::new(self.registry.clone());
        let service = StatorService::new(
            self.registry,
            self.store.clone(),
            Arc::new(self.clock.clone()),
            self.config,
        )
        .expect("valid engine configuration");

        TestEngine {
            service,
            registry,
            store: self.store,
            clock: self.clock,
        }
    }
}

/// Engine over the in-memory store, driven by a manual clock
pub struct TestEngine {
    pub service: StatorService,
    pub registry: Arc<GraphRegistry>,
    pub store: Arc<MemoryStore>,
    pub clock: ManualClock,
}

impl TestEngine {
    /// Create an entity of `entity_type` in its initial state
    pub async fn create(&self, entity_type: &str) -> EntityRef {
        self.service
            .create(&EntityType::new(entity_type), Uuid::new_v4())
            .await
            .expect("entity created")
            .entity
    }

    /// Store a record as-is
    pub fn insert(&self, record: EntityRecord) -> EntityRef {
        let entity = record.entity.clone();
        self.store.put(record);
        entity
    }

    pub async fn get(&self, entity: &EntityRef) -> EntityRecord {
        self.store
            .get(entity)
            .await
            .expect("store read")
            .expect("entity exists")
    }

    /// Run one scheduling cycle and wait for every dispatched execution
    pub async fn cycle(&self) -> Vec<TransitionReport> {
        self.service.run_cycle().await.expect("scheduling cycle");
        self.service.wait_idle().await
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// A lease manager acting as a separate worker on the same store
    pub fn worker(&self, worker_id: &str) -> LeaseManager {
        LeaseManager::new(self.store.clone(), self.clock_arc(), worker_id)
    }

    /// An executor acting as a separate worker on the same store
    pub fn executor(&self) -> TransitionExecutor {
        TransitionExecutor::new(self.registry.clone(), self.store.clone(), self.clock_arc())
    }

    fn clock_arc(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }
}
