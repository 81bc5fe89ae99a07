//! Prometheus metrics for storage operations

use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

lazy_static! {
    /// Database operation latency
    ///
    /// Labels:
    /// - operation: Store operation name (e.g., "find_due", "try_claim")
    pub static ref DB_OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "stator_db_operation_duration_seconds",
        "Duration of state store database operations",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register db_operation_duration metric");

    /// Database errors by SQLSTATE class
    ///
    /// Labels:
    /// - operation: Store operation name
    /// - kind: "unique_violation", "pool_exhausted", "connection", "other"
    pub static ref DB_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "stator_db_errors_total",
        "Total number of state store database errors",
        &["operation", "kind"]
    )
    .expect("Failed to register db_errors_total metric");
}
