//! Mock implementations for handlers and collaborators
//!
//! Scripted mocks replay a fixed sequence of results and count their calls,
//! so tests can assert both what happened and how often the handler ran.

use async_trait::async_trait;
use parking_lot::Mutex;
use stator_core::{EntityRecord, StateName, Transition, TransitionHandler};
use stator_federation::{ActorFetch, ActorFetcher};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// One scripted handler result
#[derive(Debug, Clone)]
pub enum Step {
    Advance(StateName),
    Retry,
    Fail(String),
    /// Return an `Err` from the handler
    Error(String),
    /// Sleep, then return the inner step
    Sleep(Duration, Box<Step>),
}

impl Step {
    pub fn advance(state: impl Into<StateName>) -> Self {
        Step::Advance(state.into())
    }

    pub fn sleep(duration: Duration, then: Step) -> Self {
        Step::Sleep(duration, Box::new(then))
    }
}

/// Transition handler replaying a script
///
/// Once the script runs out every call returns [`Transition::Retry`].
#[derive(Debug, Default)]
pub struct ScriptedHandler {
    script: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Uuid>>,
}

impl ScriptedHandler {
    pub fn new(script: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Handler that always asks to retry
    pub fn always_retry() -> Self {
        Self::default()
    }

    /// Append steps to the script
    pub fn push(&self, step: Step) {
        self.script.lock().push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Entity ids in the order the handler saw them
    pub fn seen(&self) -> Vec<Uuid> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl TransitionHandler for ScriptedHandler {
    async fn handle(&self, entity: &EntityRecord) -> anyhow::Result<Transition> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().push(entity.entity.id);

        let mut step = self.script.lock().pop_front().unwrap_or(Step::Retry);
        loop {
            match step {
                Step::Advance(state) => return Ok(Transition::Advance(state)),
                Step::Retry => return Ok(Transition::Retry),
                Step::Fail(reason) => return Ok(Transition::Fail(reason)),
                Step::Error(msg) => return Err(anyhow::anyhow!(msg)),
                Step::Sleep(duration, then) => {
                    tokio::time::sleep(duration).await;
                    step = *then;
                }
            }
        }
    }
}

/// [`ActorFetcher`] replaying scripted results
///
/// `Err(msg)` entries become handler errors; an exhausted script reports
/// `Updated`.
#[derive(Debug, Default)]
pub struct ScriptedActorFetcher {
    results: Mutex<VecDeque<Result<ActorFetch, String>>>,
    calls: AtomicUsize,
}

impl ScriptedActorFetcher {
    pub fn new(results: impl IntoIterator<Item = Result<ActorFetch, String>>) -> Self {
        Self {
            results: Mutex::new(results.into_iter().collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActorFetcher for ScriptedActorFetcher {
    async fn fetch_actor(&self, _identity_id: Uuid) -> anyhow::Result<ActorFetch> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.results.lock().pop_front() {
            Some(Ok(fetch)) => Ok(fetch),
            Some(Err(msg)) => Err(anyhow::anyhow!(msg)),
            None => Ok(ActorFetch::Updated),
        }
    }
}
