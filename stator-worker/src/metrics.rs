//! Prometheus metrics for the worker's HTTP surface
//!
//! Everything registered in the default registry (runtime, storage and the
//! request metrics below) is exposed at `/metrics` in text format.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    /// HTTP requests by endpoint and status code
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "stator_http_requests_total",
        "Total number of HTTP requests by endpoint and status",
        &["endpoint", "status_code"]
    )
    .expect("stator_http_requests_total metric registration");

    /// HTTP request duration
    ///
    /// Buckets: 1ms to 30s; a trigger request waits for the due query and claims
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "stator_http_request_duration_seconds",
        "HTTP request duration in seconds",
        &["endpoint"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0]
    )
    .expect("stator_http_request_duration_seconds metric registration");
}

/// Record a served request
pub fn record_http_request(endpoint: &str, status_code: u16, duration_secs: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[endpoint, &status_code.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[endpoint])
        .observe(duration_secs);
}

/// Register every metric before the first request
pub fn init_metrics() {
    lazy_static::initialize(&HTTP_REQUESTS_TOTAL);
    lazy_static::initialize(&HTTP_REQUEST_DURATION_SECONDS);
    lazy_static::initialize(&stator_runtime::metrics::TRANSITIONS_TOTAL);
    lazy_static::initialize(&stator_runtime::metrics::TRANSITION_FAILURES_TOTAL);
    lazy_static::initialize(&stator_runtime::metrics::ENTITIES_FROZEN_TOTAL);
    lazy_static::initialize(&stator_runtime::metrics::HANDLER_DURATION);
    lazy_static::initialize(&stator_runtime::metrics::CYCLE_DISPATCHED_TOTAL);
    lazy_static::initialize(&stator_runtime::metrics::CLAIM_CONFLICTS_TOTAL);
    lazy_static::initialize(&stator_storage::metrics::DB_OPERATION_DURATION);
    lazy_static::initialize(&stator_storage::metrics::DB_ERRORS_TOTAL);

    tracing::info!("Prometheus metrics initialized");
}

/// Encode the default registry in the Prometheus text format
pub fn render() -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
