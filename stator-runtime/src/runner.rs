//! Scheduler / runner
//!
//! Each cycle asks storage for due entities, claims them and dispatches the
//! executor for each claim on a detached task holding a worker permit. A
//! cycle does not wait on handlers. Any number of runners may poll the same
//! store concurrently; the atomic claim is the only thing keeping them apart.

use crate::concurrency::ConcurrencyLimiter;
use crate::executor::{TransitionExecutor, TransitionReport};
use crate::lease::LeaseManager;
use crate::metrics::CYCLE_DISPATCHED_TOTAL;
use crate::{map_storage_error, Error, Result};
use serde::Serialize;
use stator_core::{Clock, GraphRegistry};
use stator_storage::{DueQuery, StateStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum executions in flight in this process (default: 16)
    pub concurrency: usize,
    /// Lease taken for each dispatched execution (default: 120 seconds)
    pub lease_duration: Duration,
    /// Pause between cycles in the run loop (default: 1 second)
    pub schedule_interval: Duration,
    /// Stop the run loop after this long (default: run until shutdown)
    pub run_for: Option<Duration>,
    /// How long to wait for in-flight executions on shutdown (default: 30 seconds)
    pub drain_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            lease_duration: Duration::from_secs(120),
            schedule_interval: Duration::from_secs(1),
            run_for: None,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl RunnerConfig {
    /// Check the config against the graphs it will run
    pub fn validate(&self, registry: &GraphRegistry) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Configuration("concurrency must be > 0".to_string()));
        }
        if self.schedule_interval.is_zero() {
            return Err(Error::Configuration(
                "schedule_interval must be > 0".to_string(),
            ));
        }
        for graph in registry.graphs() {
            if self.lease_duration <= graph.handler_timeout() {
                return Err(Error::Configuration(format!(
                    "lease duration {:?} must exceed the '{}' handler timeout {:?}",
                    self.lease_duration,
                    graph.entity_type(),
                    graph.handler_timeout()
                )));
            }
        }
        Ok(())
    }
}

/// Result of one scheduling cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Due entities returned by the storage query
    pub candidates: usize,
    /// Claimed and handed to an executor
    pub dispatched: usize,
    /// Claimed by someone else between the query and the claim
    pub busy: usize,
}

/// Totals for a run loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub cycles: u64,
    pub dispatched: u64,
    pub busy: u64,
    pub failed_cycles: u64,
}

/// Polls storage for due entities and dispatches executions
pub struct StatorRunner {
    registry: Arc<GraphRegistry>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    leases: Arc<LeaseManager>,
    executor: Arc<TransitionExecutor>,
    limiter: ConcurrencyLimiter,
    config: RunnerConfig,
    in_flight: Mutex<JoinSet<Option<TransitionReport>>>,
}

impl StatorRunner {
    pub fn new(
        registry: Arc<GraphRegistry>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        leases: Arc<LeaseManager>,
        config: RunnerConfig,
    ) -> Result<Self> {
        config.validate(&registry)?;
        let executor = Arc::new(TransitionExecutor::new(
            registry.clone(),
            store.clone(),
            clock.clone(),
        ));
        Ok(Self {
            limiter: ConcurrencyLimiter::new(config.concurrency),
            registry,
            store,
            clock,
            leases,
            executor,
            config,
            in_flight: Mutex::new(JoinSet::new()),
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// One query per schedulable `(entity_type, state)` pair.
    ///
    /// Externally progressed states are only polled once their timeout
    /// has elapsed.
    pub fn due_queries(&self) -> Vec<DueQuery> {
        let mut queries = Vec::new();
        for graph in self.registry.graphs() {
            for def in graph.schedulable_states() {
                let mut query = DueQuery::new(
                    graph.entity_type().clone(),
                    def.name().clone(),
                    graph.retry_policy(def.name()).clone(),
                );
                if def.handler_ref().is_none() {
                    if let Some(timeout) = def.timeout() {
                        query = query.with_min_state_age(timeout.after);
                    }
                }
                queries.push(query);
            }
        }
        queries
    }

    /// Run one scheduling cycle.
    ///
    /// Returns once every candidate is either dispatched or found busy;
    /// handlers keep running on detached tasks. Executions that finished
    /// since the previous cycle are reaped first, so a process driven only
    /// by external triggers does not accumulate them.
    #[instrument(skip(self), fields(worker_id = %self.leases.worker_id()))]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.reap_finished().await;
        let mut report = CycleReport::default();

        let budget = self.limiter.available();
        if budget == 0 {
            debug!("No free workers, skipping cycle");
            return Ok(report);
        }

        let queries = self.due_queries();
        let candidates = self
            .store
            .find_due(&queries, self.clock.now(), budget)
            .await
            .map_err(|e| map_storage_error(e, "find due entities"))?;
        report.candidates = candidates.len();

        for candidate in candidates {
            let Some(permit) = self.limiter.try_acquire() else {
                debug!(in_use = self.limiter.in_use(), "Worker budget used up mid-cycle");
                break;
            };

            let claim = match self
                .leases
                .try_claim(&candidate.entity, self.config.lease_duration)
                .await
            {
                Ok(Some(claim)) => claim,
                Ok(None) => {
                    report.busy += 1;
                    continue;
                }
                Err(e) => {
                    warn!(entity = %candidate.entity, error = %e, "Claim failed");
                    continue;
                }
            };

            let executor = self.executor.clone();
            self.in_flight.lock().await.spawn(async move {
                let _permit = permit;
                let entity = claim.lease.entity.clone();
                match executor.execute(claim.record, claim.lease).await {
                    Ok(report) => Some(report),
                    Err(e) => {
                        // Lease left to expire; the entity is retried after it does
                        error!(entity = %entity, error = %e, "Execution failed to record outcome");
                        None
                    }
                }
            });
            report.dispatched += 1;
        }

        CYCLE_DISPATCHED_TOTAL.inc_by(report.dispatched as u64);
        if report.candidates > 0 {
            debug!(
                candidates = report.candidates,
                dispatched = report.dispatched,
                busy = report.busy,
                "Cycle complete"
            );
        }
        Ok(report)
    }

    /// Executions dispatched and not yet reaped
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    /// Wait for every in-flight execution and return their reports.
    ///
    /// Reports of executions reaped by a later cycle are not included.
    pub async fn wait_idle(&self) -> Vec<TransitionReport> {
        let mut set = std::mem::take(&mut *self.in_flight.lock().await);
        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => error!(error = %e, "Execution task panicked"),
            }
        }
        reports
    }

    /// Drop bookkeeping for executions that already finished
    async fn reap_finished(&self) {
        let mut set = self.in_flight.lock().await;
        while let Some(joined) = set.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "Execution task panicked");
            }
        }
    }

    /// Run cycles until `shutdown` resolves or `run_for` elapses, then drain.
    ///
    /// A failing cycle is logged and the loop carries on.
    pub async fn run<F>(&self, shutdown: F) -> RunSummary
    where
        F: Future<Output = ()>,
    {
        let mut summary = RunSummary::default();
        let deadline = self.config.run_for.map(|d| Instant::now() + d);
        let mut ticker = interval(self.config.schedule_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stop_at = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(shutdown);
        tokio::pin!(stop_at);

        info!(
            concurrency = self.config.concurrency,
            schedule_interval_ms = self.config.schedule_interval.as_millis() as u64,
            run_for_secs = self.config.run_for.map(|d| d.as_secs()),
            "Stator runner started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping runner");
                    break;
                }
                _ = &mut stop_at => {
                    info!("Run duration elapsed, stopping runner");
                    break;
                }
                _ = ticker.tick() => {}
            }

            summary.cycles += 1;
            match self.run_cycle().await {
                Ok(cycle) => {
                    summary.dispatched += cycle.dispatched as u64;
                    summary.busy += cycle.busy as u64;
                }
                Err(e) => {
                    summary.failed_cycles += 1;
                    error!(error = %e, "Scheduling cycle failed");
                }
            }
        }

        match tokio::time::timeout(self.config.drain_timeout, self.wait_idle()).await {
            Ok(reports) => info!(drained = reports.len(), "In-flight executions finished"),
            Err(_) => warn!(
                drain_timeout_secs = self.config.drain_timeout.as_secs(),
                "Timed out waiting for in-flight executions; their leases will expire"
            ),
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{AdvanceKind, Outcome};
    use chrono::{TimeZone, Utc};
    use stator_core::{handler_fn, EntityRecord, EntityRef, ManualClock, StateDef, StateGraph, Transition};
    use stator_storage::MemoryStore;
    use uuid::Uuid;

    fn registry() -> Arc<GraphRegistry> {
        let post = StateGraph::builder("post")
            .initial("new")
            .state(
                StateDef::new("new")
                    .transitions_to(["fanned_out"])
                    .handler(handler_fn(|_| async { Ok(Transition::to("fanned_out")) })),
            )
            .state(StateDef::terminal("fanned_out"))
            .build()
            .unwrap();
        let follow = StateGraph::builder("follow")
            .initial("pending_approval")
            .state(
                StateDef::new("pending_approval")
                    .transitions_to(["accepted", "timed_out"])
                    .externally_progressed()
                    .timeout_after(Duration::from_secs(3600), "timed_out"),
            )
            .state(StateDef::terminal("accepted"))
            .state(StateDef::terminal("timed_out"))
            .build()
            .unwrap();
        Arc::new(
            GraphRegistry::new()
                .with(post)
                .unwrap()
                .with(follow)
                .unwrap(),
        )
    }

    fn runner(store: Arc<MemoryStore>, clock: ManualClock, concurrency: usize) -> StatorRunner {
        let clock: Arc<dyn Clock> = Arc::new(clock);
        let leases = Arc::new(LeaseManager::new(store.clone(), clock.clone(), "runner-test"));
        StatorRunner::new(
            registry(),
            store,
            clock,
            leases,
            RunnerConfig {
                concurrency,
                schedule_interval: Duration::from_millis(10),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_due_queries_cover_schedulable_states() {
        let r = runner(Arc::new(MemoryStore::new()), clock(), 4);
        let queries = r.due_queries();
        assert_eq!(queries.len(), 2);

        let follow = queries
            .iter()
            .find(|q| q.entity_type.as_str() == "follow")
            .unwrap();
        assert_eq!(follow.min_state_age, Some(Duration::from_secs(3600)));

        let post = queries
            .iter()
            .find(|q| q.entity_type.as_str() == "post")
            .unwrap();
        assert_eq!(post.min_state_age, None);
    }

    #[test]
    fn test_lease_must_exceed_handler_timeout() {
        let config = RunnerConfig {
            lease_duration: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(&registry()),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_cycle_dispatches_up_to_budget() {
        let store = Arc::new(MemoryStore::new());
        let clock = clock();
        for _ in 0..5 {
            store.put(EntityRecord::new(
                EntityRef::new("post", Uuid::new_v4()),
                "new",
                clock.now(),
            ));
        }
        let r = runner(store.clone(), clock.clone(), 3);

        let first = r.run_cycle().await.unwrap();
        assert_eq!(first.candidates, 3);
        assert_eq!(first.dispatched, 3);
        let reports = r.wait_idle().await;
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|rep| rep.outcome
            == Outcome::Advanced {
                to: "fanned_out".into(),
                via: AdvanceKind::Handler
            }));

        let second = r.run_cycle().await.unwrap();
        assert_eq!(second.dispatched, 2);
        r.wait_idle().await;

        let third = r.run_cycle().await.unwrap();
        assert_eq!(third, CycleReport::default());
        assert!(store.snapshot().iter().all(|rec| rec.state == "fanned_out"));
    }

    #[tokio::test]
    async fn test_externally_progressed_state_times_out() {
        let store = Arc::new(MemoryStore::new());
        let clock = clock();
        let entity = EntityRef::new("follow", Uuid::new_v4());
        store.put(EntityRecord::new(entity.clone(), "pending_approval", clock.now()));
        let r = runner(store.clone(), clock.clone(), 4);

        clock.advance(Duration::from_secs(3599));
        assert_eq!(r.run_cycle().await.unwrap().candidates, 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(r.run_cycle().await.unwrap().dispatched, 1);
        let reports = r.wait_idle().await;
        assert_eq!(
            reports[0].outcome,
            Outcome::Advanced {
                to: "timed_out".into(),
                via: AdvanceKind::Timeout
            }
        );
        let current = store.get(&entity).await.unwrap().unwrap();
        assert_eq!(current.state, "timed_out");
    }

    #[tokio::test]
    async fn test_locked_candidates_are_not_dispatched() {
        let store = Arc::new(MemoryStore::new());
        let clock = clock();
        let mut locked = EntityRecord::new(EntityRef::new("post", Uuid::new_v4()), "new", clock.now());
        locked.state_locked_until = Some(clock.now() + chrono::Duration::seconds(30));
        locked.state_lock_owner = Some("elsewhere/1".to_string());
        store.put(locked);
        let r = runner(store, clock, 4);

        let report = r.run_cycle().await.unwrap();
        assert_eq!(report, CycleReport::default());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_and_drains() {
        let store = Arc::new(MemoryStore::new());
        let clock = clock();
        for _ in 0..3 {
            store.put(EntityRecord::new(
                EntityRef::new("post", Uuid::new_v4()),
                "new",
                clock.now(),
            ));
        }
        let r = runner(store.clone(), clock, 8);

        let summary = r.run(tokio::time::sleep(Duration::from_millis(100))).await;
        assert!(summary.cycles >= 1);
        assert_eq!(summary.dispatched, 3);
        assert_eq!(summary.failed_cycles, 0);
        assert!(store.snapshot().iter().all(|rec| rec.state == "fanned_out"));
    }

    #[tokio::test]
    async fn test_run_for_bounds_the_loop() {
        let store = Arc::new(MemoryStore::new());
        let clock = clock();
        let clock_dyn: Arc<dyn Clock> = Arc::new(clock);
        let leases = Arc::new(LeaseManager::new(store.clone(), clock_dyn.clone(), "bounded"));
        let r = StatorRunner::new(
            registry(),
            store,
            clock_dyn,
            leases,
            RunnerConfig {
                schedule_interval: Duration::from_millis(10),
                run_for: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        )
        .unwrap();

        let summary = r.run(futures::future::pending::<()>()).await;
        assert!(summary.cycles >= 1);
    }

    #[tokio::test]
    async fn test_triggered_cycles_reap_finished_executions() {
        let store = Arc::new(MemoryStore::new());
        let clock = clock();
        for _ in 0..50 {
            store.put(EntityRecord::new(
                EntityRef::new("post", Uuid::new_v4()),
                "new",
                clock.now(),
            ));
        }
        let r = runner(store.clone(), clock, 4);

        // Driven by triggers only: no run loop and no wait_idle
        for _ in 0..100 {
            r.run_cycle().await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert!(r.in_flight().await <= 8);
            if store.snapshot().iter().all(|rec| rec.state == "fanned_out") {
                break;
            }
        }
        assert!(store.snapshot().iter().all(|rec| rec.state == "fanned_out"));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(r.run_cycle().await.unwrap(), CycleReport::default());
        assert_eq!(r.in_flight().await, 0);
    }
}
