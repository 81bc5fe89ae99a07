//! # Stator Storage
//!
//! Persistence of entity state records. The [`StateStore`] trait carries
//! the atomic compare-and-claim primitive the runtime relies on for
//! at-most-one-executor-per-entity; [`PostgresStorage`] implements it over
//! `sqlx`, [`MemoryStore`] in process for tests and single-node tools.

pub mod memory;
pub mod metrics;
pub mod migrations;
pub mod models;
pub mod postgres;
pub mod store;

// Re-export commonly used types
pub use memory::MemoryStore;
pub use models::{EntityModel, StateCount};
pub use postgres::{PoolConfig, PostgresStorage};
pub use store::{DueQuery, StateStore, StateUpdate};

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for storage operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::PoolExhausted(_) | Error::ConnectionFailed(_)
        )
    }
}
