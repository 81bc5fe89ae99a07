//! Stator core
//!
//! Domain types for the state-machine engine: entity records, state graphs,
//! transition handlers, retry policy and the clock abstraction. This crate
//! has no storage or runtime dependencies.

pub mod clock;
pub mod entity;
pub mod graph;
pub mod handler;
pub mod registry;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{EntityRecord, EntityRef, EntityType, StateName};
pub use graph::{StateDef, StateGraph, StateGraphBuilder, StateTimeout};
pub use handler::{handler_fn, Transition, TransitionHandler};
pub use registry::GraphRegistry;
pub use retry::{RetryPolicy, RetryStrategy};

/// Core error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Unknown state '{state}' for entity type '{entity_type}'")]
    UnknownState { entity_type: String, state: String },

    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;
