//! Shared test utilities for Stator crates
//!
//! This crate provides:
//! - **Fixtures**: a fixed start time, manual clocks and small ready-made graphs
//! - **Builders**: entity records and a fully wired in-memory engine
//! - **Mocks**: scripted transition handlers and collaborators
//! - **Assertions**: fluent checks on entity records and transition reports
//!
//! # Example
//!
//! ```ignore
//! use stator_tests::{assertions::assert_entity, builders::EngineBuilder, fixtures, mocks};
//!
//! #[tokio::test]
//! async fn test_retry_then_advance() {
//!     let handler = mocks::ScriptedHandler::new([mocks::Step::Retry, mocks::Step::advance("active")]);
//!     let engine = EngineBuilder::new().graph(fixtures::graphs::fetching(handler)).build();
//!     let entity = engine.create("remote_actor").await;
//!
//!     engine.cycle().await;
//!     // ...
//! }
//! ```

pub mod assertions;
pub mod builders;
pub mod fixtures;
pub mod mocks;

// Re-export commonly used items
pub use assertions::{assert_entity, assert_report};
pub use builders::{EngineBuilder, EntityRecordBuilder, TestEngine};
pub use mocks::{ScriptedActorFetcher, ScriptedHandler, Step};
