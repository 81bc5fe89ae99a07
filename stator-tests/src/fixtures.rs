//! Test data factories for Stator types
//!
//! Every fixture starts from the same instant so timestamps in assertions
//! are predictable.

use chrono::{DateTime, TimeZone, Utc};
use stator_core::ManualClock;

/// Instant every manual clock starts at
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// A manual clock set to [`epoch`]
pub fn clock() -> ManualClock {
    ManualClock::new(epoch())
}

/// Small graphs exercising one engine feature each
pub mod graphs {
    use stator_core::{RetryPolicy, StateDef, StateGraph, TransitionHandler};
    use std::sync::Arc;
    use std::time::Duration;

    pub const REMOTE_ACTOR: &str = "remote_actor";
    pub const FETCHING: &str = "fetching";
    pub const ACTIVE: &str = "active";

    /// `remote_actor`: `fetching --handler--> active`
    ///
    /// Fixed 10 second retry delay, five attempts.
    pub fn fetching(handler: impl TransitionHandler + 'static) -> StateGraph {
        fetching_with(Arc::new(handler), RetryPolicy::fixed(Duration::from_secs(10), 5))
    }

    pub fn fetching_with(handler: Arc<dyn TransitionHandler>, retry: RetryPolicy) -> StateGraph {
        StateGraph::builder(REMOTE_ACTOR)
            .initial(FETCHING)
            .state(
                StateDef::new(FETCHING)
                    .transitions_to([ACTIVE])
                    .handler_arc(handler),
            )
            .state(StateDef::terminal(ACTIVE).manual_to([FETCHING]))
            .default_retry(retry)
            .build()
            .expect("fetching graph is valid")
    }

    pub const WIDGET: &str = "widget";

    /// `widget`: `a <-> b`, both may end in terminal `c`; `c` can be reset to `a`
    pub fn widget(handler: Arc<dyn TransitionHandler>) -> StateGraph {
        StateGraph::builder(WIDGET)
            .initial("a")
            .state(
                StateDef::new("a")
                    .transitions_to(["b", "c"])
                    .handler_arc(handler.clone()),
            )
            .state(
                StateDef::new("b")
                    .transitions_to(["a", "c"])
                    .handler_arc(handler),
            )
            .state(StateDef::terminal("c").manual_to(["a"]))
            .default_retry(RetryPolicy::fixed(Duration::from_secs(1), 3))
            .build()
            .expect("widget graph is valid")
    }
}
