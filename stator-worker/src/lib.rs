//! Stator worker library
//!
//! The HTTP surface of the engine: the `/.stator/` trigger endpoint used by
//! cron pingers, the operator admin API, health and metrics. The binary in
//! `main.rs` wires it to PostgreSQL and optionally runs the scheduler loop
//! in the background.

pub mod config;
pub mod handler;
pub mod metrics;
pub mod tracing_config;
pub mod types;

pub use config::WorkerConfig;
pub use handler::{router, AppState};
