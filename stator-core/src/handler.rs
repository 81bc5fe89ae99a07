//! Transition handler contract
//!
//! A handler is bound to one state of a graph. It is given the claimed
//! entity and decides what happens next. Handlers typically perform network
//! I/O against remote servers, run under the executor's timeout and may be
//! abandoned mid-flight, so their side effects must be idempotent.

use crate::entity::{EntityRecord, StateName};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;

/// What a handler asks the executor to do with the entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Move to the given state (must be an edge of the graph)
    Advance(StateName),

    /// Not yet; try again after the backoff delay
    Retry,

    /// Permanent failure; freeze the entity until an operator intervenes
    Fail(String),
}

impl Transition {
    /// Shorthand for [`Transition::Advance`]
    pub fn to(state: impl Into<StateName>) -> Self {
        Self::Advance(state.into())
    }

    /// Shorthand for [`Transition::Fail`]
    pub fn fail(reason: impl Into<String>) -> Self {
        Self::Fail(reason.into())
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Advance(state) => write!(f, "advance to {}", state),
            Transition::Retry => f.write_str("retry"),
            Transition::Fail(reason) => write!(f, "fail: {}", reason),
        }
    }
}

/// Handler run when an entity sits in a given state.
///
/// An `Err` is an unexpected error: it is logged and treated as a retry.
#[async_trait]
pub trait TransitionHandler: Send + Sync {
    async fn handle(&self, entity: &EntityRecord) -> anyhow::Result<Transition>;
}

/// Adapter turning an async closure into a [`TransitionHandler`]
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> TransitionHandler for FnHandler<F, Fut>
where
    F: Fn(EntityRecord) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Transition>> + Send,
{
    async fn handle(&self, entity: &EntityRecord) -> anyhow::Result<Transition> {
        (self.f)(entity.clone()).await
    }
}

/// Build a handler from an async closure
///
/// ```
/// use stator_core::handler::{handler_fn, Transition};
///
/// let handler = handler_fn(|_entity| async { Ok(Transition::to("active")) });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(EntityRecord) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Transition>> + Send,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}
