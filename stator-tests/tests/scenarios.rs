//! End-to-end engine scenarios over the in-memory store
//!
//! Each test drives the scheduler cycle by cycle with a manual clock, so
//! retry delays, lease expiry and state timeouts are exact.

use stator_core::{RetryPolicy, StateName};
use stator_federation::{
    identity, inbox, password_reset, ActorFetch, Collaborators, FederationConfig,
};
use stator_runtime::{AdvanceKind, Error, Failure, Outcome};
use stator_tests::fixtures::graphs::{self, ACTIVE, FETCHING, REMOTE_ACTOR};
use stator_tests::{
    assert_entity, assert_report, EngineBuilder, EntityRecordBuilder, ScriptedActorFetcher,
    ScriptedHandler, Step,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn retry_twice_then_advance() {
    let handler = Arc::new(ScriptedHandler::new([
        Step::Retry,
        Step::Retry,
        Step::advance(ACTIVE),
    ]));
    let engine = EngineBuilder::new()
        .graph(graphs::fetching_with(
            handler.clone(),
            RetryPolicy::fixed(Duration::from_secs(10), 5),
        ))
        .build();
    let entity = engine.create(REMOTE_ACTOR).await;
    let created_at = engine.now();

    let reports = engine.cycle().await;
    assert_eq!(reports.len(), 1);
    assert_report(&reports[0])
        .from_state(FETCHING)
        .retrying(1)
        .failed_with(&Failure::Retry);
    assert_entity(&engine.get(&entity).await)
        .in_state(FETCHING)
        .attempts(1)
        .changed_at(created_at)
        .unlocked_at(engine.now());

    // Not due again until the retry delay has passed
    assert!(engine.cycle().await.is_empty());
    engine.advance(Duration::from_secs(9));
    assert!(engine.cycle().await.is_empty());

    engine.advance(Duration::from_secs(1));
    let reports = engine.cycle().await;
    assert_report(&reports[0]).retrying(2);
    assert_entity(&engine.get(&entity).await)
        .in_state(FETCHING)
        .attempts(2)
        .changed_at(created_at);

    engine.advance(Duration::from_secs(10));
    let reports = engine.cycle().await;
    assert_report(&reports[0]).advanced_to(ACTIVE, AdvanceKind::Handler);

    let record = engine.get(&entity).await;
    assert_entity(&record)
        .in_state(ACTIVE)
        .clean()
        .changed_at(engine.now())
        .unlocked_at(engine.now());
    assert!(record.state_changed >= created_at);
    assert_eq!(handler.calls(), 3);

    // Terminal states are never polled
    engine.advance(Duration::from_secs(3600));
    assert!(engine.cycle().await.is_empty());
}

#[tokio::test]
async fn live_lease_makes_other_workers_busy_until_expiry() {
    let engine = EngineBuilder::new()
        .graph(graphs::fetching(ScriptedHandler::always_retry()))
        .worker_id("worker-b")
        .build();
    let entity = engine.create(REMOTE_ACTOR).await;

    let worker_a = engine.worker("worker-a");
    worker_a
        .try_claim(&entity, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("worker A claims the idle entity");
    assert_entity(&engine.get(&entity).await).leased_by("worker-a", engine.now());

    // Scheduler of worker B sees it as busy
    let cycle = engine.service.run_cycle().await.unwrap();
    assert_eq!(cycle.dispatched, 0);
    engine.service.wait_idle().await;

    // Manual trigger of worker B too
    engine.advance(Duration::from_secs(29));
    let err = engine
        .service
        .transition_perform(&entity, &StateName::from(ACTIVE))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Busy(_)));
    assert_entity(&engine.get(&entity).await)
        .in_state(FETCHING)
        .attempts(0);

    engine.advance(Duration::from_secs(2));
    let report = engine
        .service
        .transition_perform(&entity, &StateName::from(ACTIVE))
        .await
        .unwrap();
    assert_report(&report).advanced_to(ACTIVE, AdvanceKind::Manual);
    assert_entity(&engine.get(&entity).await)
        .in_state(ACTIVE)
        .unlocked_at(engine.now());
}

#[tokio::test]
async fn expired_lease_is_claimable_without_release() {
    let engine = EngineBuilder::new()
        .graph(graphs::fetching(ScriptedHandler::new([Step::advance(ACTIVE)])))
        .build();
    let entity = engine.create(REMOTE_ACTOR).await;

    // Worker A crashes holding the lease
    engine
        .worker("worker-a")
        .try_claim(&entity, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert!(engine
        .worker("worker-b")
        .try_claim(&entity, Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());

    engine.advance(Duration::from_secs(31));
    let reports = engine.cycle().await;
    assert_eq!(reports.len(), 1);
    assert_report(&reports[0]).advanced_to(ACTIVE, AdvanceKind::Handler);
}

#[tokio::test]
async fn inbox_message_cannot_skip_to_deleted() {
    let registry =
        stator_federation::registry(&Collaborators::dry_run(), &FederationConfig::default())
            .unwrap();
    let engine = EngineBuilder::new().registry(registry).build();
    let message = engine.create(inbox::ENTITY_TYPE).await;

    let err = engine
        .service
        .transition_perform(&message, &StateName::from(inbox::DELETED))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvariantViolation(_)));
    assert_entity(&engine.get(&message).await)
        .in_state(inbox::RECEIVED)
        .clean()
        .unlocked_at(engine.now());

    // The normal path still works afterwards
    let reports = engine.cycle().await;
    assert_report(&reports[0]).advanced_to(inbox::PROCESSED, AdvanceKind::Handler);
}

#[tokio::test]
async fn frozen_entity_waits_for_manual_reset() {
    let handler = Arc::new(ScriptedHandler::always_retry());
    let engine = EngineBuilder::new()
        .graph(graphs::fetching_with(
            handler.clone(),
            RetryPolicy::fixed(Duration::from_secs(1), 3),
        ))
        .build();
    let entity = engine.create(REMOTE_ACTOR).await;

    assert_report(&engine.cycle().await[0]).retrying(1);
    engine.advance(Duration::from_secs(1));
    assert_report(&engine.cycle().await[0]).retrying(2);
    engine.advance(Duration::from_secs(1));
    assert_report(&engine.cycle().await[0]).frozen();
    assert!(engine.get(&entity).await.attempt_count >= 3);

    // No amount of waiting makes it due again
    engine.advance(Duration::from_secs(30 * 24 * 3600));
    assert!(engine.cycle().await.is_empty());
    assert_eq!(handler.calls(), 3);

    let stuck = engine.service.stuck(None, 10).await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert!(stuck[0].frozen);

    // Resetting to the same state clears the counter
    engine
        .service
        .transition_perform(&entity, &StateName::from(FETCHING))
        .await
        .unwrap();
    assert_entity(&engine.get(&entity).await)
        .in_state(FETCHING)
        .clean();

    handler.push(Step::advance(ACTIVE));
    assert_report(&engine.cycle().await[0]).advanced_to(ACTIVE, AdvanceKind::Handler);
}

#[tokio::test]
async fn permanent_failure_freezes_immediately() {
    let engine = EngineBuilder::new()
        .graph(graphs::fetching(ScriptedHandler::new([Step::Fail(
            "actor suspended".to_string(),
        )])))
        .build();
    let entity = engine.create(REMOTE_ACTOR).await;

    let reports = engine.cycle().await;
    assert_report(&reports[0])
        .frozen()
        .failed_with(&Failure::Permanent("actor suspended".to_string()));
    assert_entity(&engine.get(&entity).await)
        .in_state(FETCHING)
        .attempts(5);

    engine.advance(Duration::from_secs(86_400));
    assert!(engine.cycle().await.is_empty());
}

#[tokio::test]
async fn handler_error_counts_as_failed_attempt() {
    let engine = EngineBuilder::new()
        .graph(graphs::fetching(ScriptedHandler::new([Step::Error(
            "connection reset".to_string(),
        )])))
        .build();
    let entity = engine.create(REMOTE_ACTOR).await;

    let reports = engine.cycle().await;
    assert_report(&reports[0])
        .retrying(1)
        .failed_with(&Failure::Error("connection reset".to_string()));
    assert_entity(&engine.get(&entity).await)
        .in_state(FETCHING)
        .attempts(1);
}

#[tokio::test]
async fn handler_timeout_counts_as_failed_attempt() {
    let handler: Arc<dyn stator_core::TransitionHandler> = Arc::new(ScriptedHandler::new([
        Step::sleep(Duration::from_secs(5), Step::advance(ACTIVE)),
    ]));
    let graph = stator_core::StateGraph::builder(REMOTE_ACTOR)
        .initial(FETCHING)
        .state(
            stator_core::StateDef::new(FETCHING)
                .transitions_to([ACTIVE])
                .handler_arc(handler),
        )
        .state(stator_core::StateDef::terminal(ACTIVE))
        .handler_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let engine = EngineBuilder::new().graph(graph).build();
    let entity = engine.create(REMOTE_ACTOR).await;

    let reports = engine.cycle().await;
    assert_report(&reports[0])
        .retrying(1)
        .failed_with(&Failure::Timeout);
    assert_entity(&engine.get(&entity).await)
        .in_state(FETCHING)
        .attempts(1)
        .unlocked_at(engine.now());
}

#[tokio::test]
async fn handler_returning_undeclared_edge_keeps_state() {
    let engine = EngineBuilder::new()
        .graph(graphs::fetching(ScriptedHandler::new([Step::advance(
            "archived",
        )])))
        .build();
    let entity = engine.create(REMOTE_ACTOR).await;

    let reports = engine.cycle().await;
    assert!(matches!(
        reports[0].outcome,
        Outcome::InvariantViolation {
            attempt_count: 1,
            frozen: false,
            ..
        }
    ));
    assert_entity(&engine.get(&entity).await)
        .in_state(FETCHING)
        .attempts(1);
}

#[tokio::test]
async fn externally_progressed_state_times_out() {
    let config = FederationConfig {
        password_reset_ttl: Duration::from_secs(3600),
        ..Default::default()
    };
    let registry = stator_federation::registry(&Collaborators::dry_run(), &config).unwrap();
    let engine = EngineBuilder::new().registry(registry).build();
    let reset = engine.create(password_reset::ENTITY_TYPE).await;

    assert_report(&engine.cycle().await[0])
        .advanced_to(password_reset::SENT, AdvanceKind::Handler);
    let sent_at = engine.now();

    engine.advance(Duration::from_secs(3599));
    assert!(engine.cycle().await.is_empty());
    assert_entity(&engine.get(&reset).await).in_state(password_reset::SENT);

    engine.advance(Duration::from_secs(1));
    let reports = engine.cycle().await;
    assert_report(&reports[0])
        .from_state(password_reset::SENT)
        .advanced_to(password_reset::EXPIRED, AdvanceKind::Timeout);
    let record = engine.get(&reset).await;
    assert_entity(&record)
        .in_state(password_reset::EXPIRED)
        .changed_at(engine.now());
    assert!(record.state_changed > sent_at);
}

#[tokio::test]
async fn identity_refetch_lifecycle() {
    let fetcher = Arc::new(ScriptedActorFetcher::new([
        Err("timeout".to_string()),
        Ok(ActorFetch::Updated),
    ]));
    let config = FederationConfig {
        identity_refresh: Duration::from_secs(600),
        ..Default::default()
    };
    let registry = identity_registry(fetcher.clone(), &config);
    let engine = EngineBuilder::new().registry(registry).build();
    let actor = engine.create(identity::ENTITY_TYPE).await;

    assert_report(&engine.cycle().await[0]).retrying(1);

    // Default policy: 30s before the second attempt
    engine.advance(Duration::from_secs(30));
    assert_report(&engine.cycle().await[0])
        .advanced_to(identity::UPDATED, AdvanceKind::Handler);
    assert_entity(&engine.get(&actor).await)
        .in_state(identity::UPDATED)
        .clean();

    // Refreshed once the refresh interval passes
    engine.advance(Duration::from_secs(600));
    assert_report(&engine.cycle().await[0])
        .advanced_to(identity::OUTDATED, AdvanceKind::Timeout);
    assert_report(&engine.cycle().await[0])
        .advanced_to(identity::UPDATED, AdvanceKind::Handler);
    assert_eq!(fetcher.calls(), 3);
}

#[tokio::test]
async fn gone_actor_freezes_identity() {
    let fetcher = Arc::new(ScriptedActorFetcher::new([Ok(ActorFetch::Gone)]));
    let registry = identity_registry(fetcher, &FederationConfig::default());
    let engine = EngineBuilder::new().registry(registry).build();
    engine.create(identity::ENTITY_TYPE).await;

    assert_report(&engine.cycle().await[0]).frozen();
}

#[tokio::test]
async fn fenced_write_after_lease_expiry() {
    let engine = EngineBuilder::new()
        .graph(graphs::fetching(ScriptedHandler::new([
            Step::advance(ACTIVE),
            Step::advance(ACTIVE),
        ])))
        .build();
    let entity = engine.insert(EntityRecordBuilder::new(REMOTE_ACTOR, FETCHING).build());

    let slow = engine
        .worker("worker-a")
        .try_claim(&entity, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    // Worker A stalls past its lease; worker B takes over
    engine.advance(Duration::from_secs(31));
    let fresh = engine
        .worker("worker-b")
        .try_claim(&entity, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let report = engine
        .executor()
        .execute(slow.record, slow.lease)
        .await
        .unwrap();
    assert_report(&report).lease_lost();
    assert_entity(&engine.get(&entity).await)
        .in_state(FETCHING)
        .leased_by("worker-b", engine.now());

    let report = engine
        .executor()
        .execute(fresh.record, fresh.lease)
        .await
        .unwrap();
    assert_report(&report).advanced_to(ACTIVE, AdvanceKind::Handler);
}

fn identity_registry(
    fetcher: Arc<ScriptedActorFetcher>,
    config: &FederationConfig,
) -> stator_core::GraphRegistry {
    let collab = Collaborators {
        actors: fetcher,
        ..Collaborators::dry_run()
    };
    stator_federation::registry(&collab, config).unwrap()
}
