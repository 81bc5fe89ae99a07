//! # Stator Runtime
//!
//! Drives entities through their state graphs: the scheduler finds due
//! entities, the lease manager claims them, the executor runs the state's
//! handler and writes the outcome back. The manual trigger lets operators
//! force a transition through the same claim path.

pub mod concurrency;
pub mod executor;
pub mod lease;
pub mod metrics;
pub mod runner;
pub mod service;
pub mod trigger;

// Re-export commonly used types
pub use concurrency::ConcurrencyLimiter;
pub use executor::{AdvanceKind, Failure, Outcome, TransitionExecutor, TransitionReport};
pub use lease::{Claim, Lease, LeaseManager};
pub use runner::{CycleReport, RunSummary, RunnerConfig, StatorRunner};
pub use service::{ServiceConfig, StatorService, StuckEntity};
pub use trigger::ManualTrigger;

use tracing::error;

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for runtime operations
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Entity is busy: {0}")]
    Busy(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<stator_core::Error> for Error {
    fn from(e: stator_core::Error) -> Self {
        use stator_core::Error as CoreError;

        match e {
            CoreError::Configuration(msg) => Error::Configuration(msg),
            CoreError::InvariantViolation(msg) => Error::InvariantViolation(msg),
            CoreError::UnknownState { .. } => Error::InvariantViolation(e.to_string()),
            CoreError::UnknownEntityType(_) => Error::NotFound(e.to_string()),
        }
    }
}

/// Map storage errors to runtime errors, logging the operation context.
///
/// Connection and database errors become `Storage` (transient); validation
/// failures indicate a bug upstream and become `InvariantViolation`.
pub(crate) fn map_storage_error(e: stator_storage::Error, context: &str) -> Error {
    use stator_storage::Error as StorageError;

    match e {
        StorageError::NotFound(msg) => {
            error!(error = %msg, context = %context, "Entity not found");
            Error::NotFound(msg)
        }
        StorageError::AlreadyExists(msg) => {
            error!(error = %msg, context = %context, "Entity already exists");
            Error::AlreadyExists(msg)
        }
        StorageError::ValidationError(msg) => {
            error!(error = %msg, context = %context, "Validation error");
            Error::InvariantViolation(msg)
        }
        StorageError::PoolExhausted(_)
        | StorageError::ConnectionFailed(_)
        | StorageError::Database(_) => {
            let err_msg = format!("{}: {}", context, e);
            error!(error = %err_msg, "Transient storage error");
            Error::Storage(err_msg)
        }
        StorageError::Migration(_) | StorageError::Internal(_) => {
            let err_msg = format!("{}: {}", context, e);
            error!(error = %err_msg, "Storage error");
            Error::Internal(err_msg)
        }
    }
}
