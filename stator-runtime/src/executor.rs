//! Transition executor
//!
//! Runs the handler for one claimed entity and performs the single write
//! that records the outcome and releases the lease. Handler failures never
//! surface as errors from [`TransitionExecutor::execute`]; they become
//! [`Outcome::Retrying`] or [`Outcome::Frozen`]. Only storage failures do.
//!
//! A claimed entity that is no longer due (frozen or backing off) is
//! released untouched and reported as [`Outcome::Skipped`].

use crate::lease::Lease;
use crate::metrics::{
    ENTITIES_FROZEN_TOTAL, HANDLER_DURATION, TRANSITIONS_TOTAL, TRANSITION_FAILURES_TOTAL,
};
use crate::{map_storage_error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use stator_core::{
    Clock, EntityRecord, EntityRef, GraphRegistry, RetryPolicy, StateName, StateGraph, Transition,
};
use stator_storage::{StateStore, StateUpdate};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// What moved the entity forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceKind {
    Handler,
    Timeout,
    Manual,
}

/// Why an attempt did not advance the entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Failure {
    /// The handler asked to be retried later
    Retry,

    /// The handler returned an error
    Error(String),

    /// The handler exceeded the per-type timeout
    Timeout,

    /// The handler declared the entity permanently failed
    Permanent(String),
}

impl Failure {
    fn metric_kind(&self) -> &'static str {
        match self {
            Failure::Retry => "retry",
            Failure::Error(_) => "error",
            Failure::Timeout => "timeout",
            Failure::Permanent(_) => "permanent",
        }
    }
}

/// Result of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The entity entered `to`
    Advanced { to: StateName, via: AdvanceKind },

    /// The attempt failed; the entity is due again at `next_attempt_at`
    Retrying {
        attempt_count: u32,
        next_attempt_at: DateTime<Utc>,
        failure: Failure,
    },

    /// The attempt ceiling was reached; excluded from scheduling until forced
    Frozen { attempt_count: u32, failure: Failure },

    /// The handler or stored row broke a graph invariant; recorded as a failed attempt
    InvariantViolation {
        reason: String,
        attempt_count: u32,
        frozen: bool,
    },

    /// Nothing to do in this state right now; the lease was released
    Skipped { reason: String },

    /// The lease expired and was taken by someone else; nothing was written
    LeaseLost,
}

impl Outcome {
    pub fn is_advanced(&self) -> bool {
        matches!(self, Outcome::Advanced { .. })
    }
}

/// Report of one execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionReport {
    pub entity: EntityRef,
    pub from_state: StateName,
    pub outcome: Outcome,
    #[serde(skip)]
    pub duration: Duration,
}

/// Executes transitions for claimed entities
pub struct TransitionExecutor {
    registry: Arc<GraphRegistry>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl TransitionExecutor {
    pub fn new(
        registry: Arc<GraphRegistry>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
        }
    }

    /// Run the handler for `record`'s current state and record the outcome.
    ///
    /// `record` must be the row as returned by the claim that produced `lease`.
    #[instrument(
        skip(self, record, lease),
        fields(
            entity_type = %record.entity.entity_type,
            entity_id = %record.entity.id,
            state = %record.state
        )
    )]
    pub async fn execute(&self, record: EntityRecord, lease: Lease) -> Result<TransitionReport> {
        let start = Instant::now();

        let Some(graph) = self.registry.get(&record.entity.entity_type).cloned() else {
            let reason = format!("unknown entity type '{}'", record.entity.entity_type);
            return self
                .record_invariant_violation(&record, &lease, &RetryPolicy::default(), reason, start)
                .await;
        };

        let Some(def) = graph.state(&record.state) else {
            let reason = format!(
                "state '{}' is not declared for '{}'",
                record.state, record.entity.entity_type
            );
            return self
                .record_invariant_violation(&record, &lease, graph.default_retry(), reason, start)
                .await;
        };

        if !def.is_schedulable() {
            return self
                .skip(&record, &lease, format!("state '{}' is not polled", record.state), start)
                .await;
        }

        // The row may have moved on since the due query: another scheduler
        // can record an attempt between our query and our claim
        let policy = graph.retry_policy(&record.state);
        if !record.is_ready(policy, self.clock.now()) {
            let reason = if record.is_frozen(policy) {
                "attempt ceiling reached".to_string()
            } else {
                format!("backing off until {}", record.next_attempt_at(policy))
            };
            return self.skip(&record, &lease, reason, start).await;
        }

        if let Some(timeout) = def.timeout() {
            let elapsed = record.time_in_state(self.clock.now());
            if elapsed.to_std().is_ok_and(|e| e >= timeout.after) {
                info!(target_state = %timeout.target, "State timeout elapsed");
                return self
                    .advance(&record, &lease, timeout.target.clone(), AdvanceKind::Timeout, start)
                    .await;
            }
        }

        let Some(handler) = def.handler_ref().cloned() else {
            return self
                .skip(&record, &lease, "waiting for external progress".to_string(), start)
                .await;
        };

        let handler_start = Instant::now();
        let result = tokio::time::timeout(graph.handler_timeout(), handler.handle(&record)).await;
        HANDLER_DURATION
            .with_label_values(&[record.entity.entity_type.as_str(), record.state.as_str()])
            .observe(handler_start.elapsed().as_secs_f64());

        match result {
            Ok(Ok(Transition::Advance(target))) => {
                if graph.can_transition(&record.state, &target) {
                    self.advance(&record, &lease, target, AdvanceKind::Handler, start)
                        .await
                } else {
                    let reason = format!(
                        "handler returned '{}', which is not a transition from '{}'",
                        target, record.state
                    );
                    let policy = graph.retry_policy(&record.state);
                    self.record_invariant_violation(&record, &lease, policy, reason, start)
                        .await
                }
            }
            Ok(Ok(Transition::Retry)) => {
                self.record_failure(&graph, &record, &lease, Failure::Retry, start)
                    .await
            }
            Ok(Ok(Transition::Fail(reason))) => {
                self.record_failure(&graph, &record, &lease, Failure::Permanent(reason), start)
                    .await
            }
            Ok(Err(e)) => {
                warn!(error = %format!("{:#}", e), "Transition handler failed");
                self.record_failure(&graph, &record, &lease, Failure::Error(format!("{:#}", e)), start)
                    .await
            }
            Err(_) => {
                warn!(
                    timeout_ms = graph.handler_timeout().as_millis() as u64,
                    "Transition handler timed out"
                );
                self.record_failure(&graph, &record, &lease, Failure::Timeout, start)
                    .await
            }
        }
    }

    async fn advance(
        &self,
        record: &EntityRecord,
        lease: &Lease,
        target: StateName,
        via: AdvanceKind,
        start: Instant,
    ) -> Result<TransitionReport> {
        let update = StateUpdate::Transitioned {
            state: target.clone(),
            at: self.clock.now(),
        };
        if !self.write(lease, &update).await? {
            return Ok(self.report(record, Outcome::LeaseLost, start));
        }

        TRANSITIONS_TOTAL
            .with_label_values(&[
                record.entity.entity_type.as_str(),
                record.state.as_str(),
                target.as_str(),
            ])
            .inc();
        debug!(to = %target, "Entity advanced");

        Ok(self.report(record, Outcome::Advanced { to: target, via }, start))
    }

    async fn record_failure(
        &self,
        graph: &StateGraph,
        record: &EntityRecord,
        lease: &Lease,
        failure: Failure,
        start: Instant,
    ) -> Result<TransitionReport> {
        let policy = graph.retry_policy(&record.state);
        let attempt_count = match &failure {
            Failure::Permanent(_) => policy.max_attempts.max(record.attempt_count),
            _ => record.attempt_count.saturating_add(1),
        };

        let now = self.clock.now();
        let update = StateUpdate::Attempted { attempt_count, at: now };
        if !self.write(lease, &update).await? {
            return Ok(self.report(record, Outcome::LeaseLost, start));
        }

        TRANSITION_FAILURES_TOTAL
            .with_label_values(&[
                record.entity.entity_type.as_str(),
                record.state.as_str(),
                failure.metric_kind(),
            ])
            .inc();

        let outcome = if policy.is_exhausted(attempt_count) {
            ENTITIES_FROZEN_TOTAL
                .with_label_values(&[record.entity.entity_type.as_str(), record.state.as_str()])
                .inc();
            warn!(
                attempt_count = attempt_count,
                failure = failure.metric_kind(),
                "Entity frozen after exhausting retries"
            );
            Outcome::Frozen {
                attempt_count,
                failure,
            }
        } else {
            let next_attempt_at = now + policy.backoff_chrono(attempt_count);
            debug!(
                attempt_count = attempt_count,
                next_attempt_at = %next_attempt_at,
                "Transition attempt failed, will retry"
            );
            Outcome::Retrying {
                attempt_count,
                next_attempt_at,
                failure,
            }
        };

        Ok(self.report(record, outcome, start))
    }

    async fn record_invariant_violation(
        &self,
        record: &EntityRecord,
        lease: &Lease,
        policy: &RetryPolicy,
        reason: String,
        start: Instant,
    ) -> Result<TransitionReport> {
        error!(reason = %reason, "Invariant violation, state preserved");

        let attempt_count = record.attempt_count.saturating_add(1);
        let update = StateUpdate::Attempted {
            attempt_count,
            at: self.clock.now(),
        };
        if !self.write(lease, &update).await? {
            return Ok(self.report(record, Outcome::LeaseLost, start));
        }

        TRANSITION_FAILURES_TOTAL
            .with_label_values(&[
                record.entity.entity_type.as_str(),
                record.state.as_str(),
                "invariant",
            ])
            .inc();

        let frozen = policy.is_exhausted(attempt_count);
        if frozen {
            ENTITIES_FROZEN_TOTAL
                .with_label_values(&[record.entity.entity_type.as_str(), record.state.as_str()])
                .inc();
        }

        Ok(self.report(
            record,
            Outcome::InvariantViolation {
                reason,
                attempt_count,
                frozen,
            },
            start,
        ))
    }

    async fn skip(
        &self,
        record: &EntityRecord,
        lease: &Lease,
        reason: String,
        start: Instant,
    ) -> Result<TransitionReport> {
        debug!(reason = %reason, "Nothing to execute");
        let released = self
            .store
            .release(&lease.entity, &lease.owner)
            .await
            .map_err(|e| map_storage_error(e, "release lease"))?;
        let outcome = if released {
            Outcome::Skipped { reason }
        } else {
            Outcome::LeaseLost
        };
        Ok(self.report(record, outcome, start))
    }

    /// The one fenced write of an execution
    async fn write(&self, lease: &Lease, update: &StateUpdate) -> Result<bool> {
        let written = self
            .store
            .complete(&lease.entity, &lease.owner, update)
            .await
            .map_err(|e| map_storage_error(e, "write transition outcome"))?;
        if !written {
            warn!(owner = %lease.owner, "Lease lost before write-back, outcome discarded");
        }
        Ok(written)
    }

    fn report(&self, record: &EntityRecord, outcome: Outcome, start: Instant) -> TransitionReport {
        TransitionReport {
            entity: record.entity.clone(),
            from_state: record.state.clone(),
            outcome,
            duration: start.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseManager;
    use chrono::TimeZone;
    use stator_core::{handler_fn, ManualClock, StateDef, StateGraph};
    use stator_storage::MemoryStore;
    use uuid::Uuid;

    struct Harness {
        store: Arc<MemoryStore>,
        clock: ManualClock,
        leases: LeaseManager,
        executor: TransitionExecutor,
    }

    impl Harness {
        fn new(graph: StateGraph) -> Self {
            let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
            let store = Arc::new(MemoryStore::new());
            let registry = Arc::new(GraphRegistry::new().with(graph).unwrap());
            let leases = LeaseManager::new(store.clone(), Arc::new(clock.clone()), "test");
            let executor =
                TransitionExecutor::new(registry, store.clone(), Arc::new(clock.clone()));
            Self {
                store,
                clock,
                leases,
                executor,
            }
        }

        fn insert(&self, entity_type: &str, state: &str) -> EntityRef {
            let entity = EntityRef::new(entity_type, Uuid::new_v4());
            self.store
                .put(EntityRecord::new(entity.clone(), state, self.clock.now()));
            entity
        }

        async fn run(&self, entity: &EntityRef) -> TransitionReport {
            let claim = self
                .leases
                .try_claim(entity, Duration::from_secs(60))
                .await
                .unwrap()
                .unwrap();
            self.executor.execute(claim.record, claim.lease).await.unwrap()
        }

        async fn current(&self, entity: &EntityRef) -> EntityRecord {
            self.store.get(entity).await.unwrap().unwrap()
        }
    }

    fn graph_with(handler: impl stator_core::TransitionHandler + 'static, policy: RetryPolicy) -> StateGraph {
        StateGraph::builder("identity")
            .initial("outdated")
            .state(
                StateDef::new("outdated")
                    .transitions_to(["updated"])
                    .handler(handler)
                    .retry(policy),
            )
            .state(StateDef::terminal("updated"))
            .handler_timeout(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_advance_resets_counters_and_releases_lease() {
        let h = Harness::new(graph_with(
            handler_fn(|_| async { Ok(Transition::to("updated")) }),
            RetryPolicy::default(),
        ));
        let entity = h.insert("identity", "outdated");
        h.clock.advance(Duration::from_secs(5));

        let report = h.run(&entity).await;
        assert_eq!(
            report.outcome,
            Outcome::Advanced {
                to: "updated".into(),
                via: AdvanceKind::Handler
            }
        );

        let current = h.current(&entity).await;
        assert_eq!(current.state, "updated");
        assert_eq!(current.state_changed, h.clock.now());
        assert_eq!(current.attempt_count, 0);
        assert!(current.state_attempted.is_none());
        assert!(current.state_locked_until.is_none());
    }

    #[tokio::test]
    async fn test_handler_error_counts_as_attempt() {
        let h = Harness::new(graph_with(
            handler_fn(|_| async { Err(anyhow::anyhow!("remote server unreachable")) }),
            RetryPolicy::fixed(Duration::from_secs(10), 3),
        ));
        let entity = h.insert("identity", "outdated");

        let report = h.run(&entity).await;
        match report.outcome {
            Outcome::Retrying {
                attempt_count,
                next_attempt_at,
                failure: Failure::Error(msg),
            } => {
                assert_eq!(attempt_count, 1);
                assert_eq!(next_attempt_at, h.clock.now() + chrono::Duration::seconds(10));
                assert!(msg.contains("unreachable"));
            }
            other => panic!("Expected Retrying, got {:?}", other),
        }

        let current = h.current(&entity).await;
        assert_eq!(current.state, "outdated");
        assert_eq!(current.attempt_count, 1);
        assert_eq!(current.state_attempted, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn test_handler_timeout_counts_as_attempt() {
        let h = Harness::new(graph_with(
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Transition::to("updated"))
            }),
            RetryPolicy::default(),
        ));
        let entity = h.insert("identity", "outdated");

        let report = h.run(&entity).await;
        assert!(matches!(
            report.outcome,
            Outcome::Retrying {
                attempt_count: 1,
                failure: Failure::Timeout,
                ..
            }
        ));
        assert_eq!(h.current(&entity).await.state, "outdated");
    }

    #[tokio::test]
    async fn test_exhausted_retries_freeze() {
        let h = Harness::new(graph_with(
            handler_fn(|_| async { Ok(Transition::Retry) }),
            RetryPolicy::fixed(Duration::from_secs(1), 2),
        ));
        let entity = h.insert("identity", "outdated");

        let first = h.run(&entity).await;
        assert!(matches!(first.outcome, Outcome::Retrying { attempt_count: 1, .. }));

        h.clock.advance(Duration::from_secs(1));
        let second = h.run(&entity).await;
        assert_eq!(
            second.outcome,
            Outcome::Frozen {
                attempt_count: 2,
                failure: Failure::Retry
            }
        );
        assert!(h.current(&entity).await.state_locked_until.is_none());
    }

    #[tokio::test]
    async fn test_permanent_failure_freezes_immediately() {
        let h = Harness::new(graph_with(
            handler_fn(|_| async { Ok(Transition::fail("actor deleted")) }),
            RetryPolicy::fixed(Duration::from_secs(1), 5),
        ));
        let entity = h.insert("identity", "outdated");

        let report = h.run(&entity).await;
        assert!(matches!(
            report.outcome,
            Outcome::Frozen {
                attempt_count: 5,
                failure: Failure::Permanent(_)
            }
        ));
    }

    #[tokio::test]
    async fn test_undeclared_target_is_invariant_violation() {
        let h = Harness::new(graph_with(
            handler_fn(|_| async { Ok(Transition::to("deleted")) }),
            RetryPolicy::default(),
        ));
        let entity = h.insert("identity", "outdated");

        let report = h.run(&entity).await;
        assert!(matches!(
            report.outcome,
            Outcome::InvariantViolation {
                attempt_count: 1,
                frozen: false,
                ..
            }
        ));
        let current = h.current(&entity).await;
        assert_eq!(current.state, "outdated");
        assert_eq!(current.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_state_is_recorded_as_failure() {
        let h = Harness::new(graph_with(
            handler_fn(|_| async { Ok(Transition::to("updated")) }),
            RetryPolicy::default(),
        ));
        let entity = h.insert("identity", "vanished");

        let report = h.run(&entity).await;
        assert!(matches!(report.outcome, Outcome::InvariantViolation { .. }));
        let current = h.current(&entity).await;
        assert_eq!(current.state, "vanished");
        assert_eq!(current.attempt_count, 1);
        assert!(current.state_lock_owner.is_none());
    }

    #[tokio::test]
    async fn test_lost_lease_discards_outcome() {
        let h = Harness::new(graph_with(
            handler_fn(|_| async { Ok(Transition::to("updated")) }),
            RetryPolicy::default(),
        ));
        let entity = h.insert("identity", "outdated");

        let stale = h
            .leases
            .try_claim(&entity, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        h.clock.advance(Duration::from_secs(31));
        let fresh = h
            .leases
            .try_claim(&entity, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let report = h.executor.execute(stale.record, stale.lease).await.unwrap();
        assert_eq!(report.outcome, Outcome::LeaseLost);

        let current = h.current(&entity).await;
        assert_eq!(current.state, "outdated");
        assert_eq!(current.state_lock_owner, Some(fresh.lease.owner));
    }

    #[tokio::test]
    async fn test_claimed_entity_no_longer_due_is_released_untouched() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let h = Harness::new(graph_with(
            handler_fn(move |_| {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Ok(Transition::to("updated")) }
            }),
            RetryPolicy::fixed(Duration::from_secs(10), 3),
        ));

        // Frozen by a failure recorded after our due query
        let frozen = EntityRef::new("identity", Uuid::new_v4());
        let mut record = EntityRecord::new(frozen.clone(), "outdated", h.clock.now());
        record.attempt_count = 3;
        record.state_attempted = Some(h.clock.now());
        h.store.put(record);

        let report = h.run(&frozen).await;
        assert!(matches!(report.outcome, Outcome::Skipped { .. }));
        let current = h.current(&frozen).await;
        assert_eq!(current.attempt_count, 3);
        assert!(current.state_lock_owner.is_none());

        // Backing off after a failure recorded after our due query
        let backing_off = EntityRef::new("identity", Uuid::new_v4());
        let mut record = EntityRecord::new(backing_off.clone(), "outdated", h.clock.now());
        record.attempt_count = 1;
        record.state_attempted = Some(h.clock.now());
        h.store.put(record);

        let report = h.run(&backing_off).await;
        assert!(matches!(report.outcome, Outcome::Skipped { .. }));
        assert_eq!(h.current(&backing_off).await.attempt_count, 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        h.clock.advance(Duration::from_secs(10));
        let report = h.run(&backing_off).await;
        assert!(report.outcome.is_advanced());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
