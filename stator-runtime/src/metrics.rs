//! Prometheus metrics for the scheduler and executor

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

lazy_static! {
    /// Successful state changes (handler, timeout or manual)
    ///
    /// Labels:
    /// - entity_type, from_state, to_state
    pub static ref TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "stator_transitions_total",
        "Total number of successful state transitions",
        &["entity_type", "from_state", "to_state"]
    )
    .expect("stator_transitions_total metric registration");

    /// Failed transition attempts
    ///
    /// Labels:
    /// - kind: "retry", "error", "timeout", "permanent", "invariant"
    pub static ref TRANSITION_FAILURES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "stator_transition_failures_total",
        "Total number of failed transition attempts",
        &["entity_type", "state", "kind"]
    )
    .expect("stator_transition_failures_total metric registration");

    /// Entities that reached their attempt ceiling
    pub static ref ENTITIES_FROZEN_TOTAL: IntCounterVec = register_int_counter_vec!(
        "stator_entities_frozen_total",
        "Total number of entities frozen after exhausting retries",
        &["entity_type", "state"]
    )
    .expect("stator_entities_frozen_total metric registration");

    /// Handler wall time, including handlers that time out
    pub static ref HANDLER_DURATION: HistogramVec = register_histogram_vec!(
        "stator_handler_duration_seconds",
        "Duration of transition handler invocations",
        &["entity_type", "state"],
        vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("stator_handler_duration_seconds metric registration");

    /// Executions dispatched by scheduling cycles
    pub static ref CYCLE_DISPATCHED_TOTAL: IntCounter = register_int_counter!(
        "stator_cycle_dispatched_total",
        "Total number of executions dispatched by the scheduler"
    )
    .expect("stator_cycle_dispatched_total metric registration");

    /// Claims lost to another live lease
    pub static ref CLAIM_CONFLICTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "stator_claim_conflicts_total",
        "Total number of claim attempts on existing entities that found a live lease",
        &["entity_type"]
    )
    .expect("stator_claim_conflicts_total metric registration");
}
