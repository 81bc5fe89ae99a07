//! State graph definitions
//!
//! A [`StateGraph`] declares, for one entity type, every state an entity can
//! be in, the edges between states and the handler that runs in each state.
//! Graphs are validated once when built and are read-only afterwards.
//!
//! # Example
//!
//! ```
//! use stator_core::graph::{StateDef, StateGraph};
//! use stator_core::handler::{handler_fn, Transition};
//!
//! let graph = StateGraph::builder("identity")
//!     .initial("outdated")
//!     .state(
//!         StateDef::new("outdated")
//!             .transitions_to(["updated"])
//!             .handler(handler_fn(|_| async { Ok(Transition::to("updated")) })),
//!     )
//!     .state(StateDef::terminal("updated").manual_to(["outdated"]))
//!     .build()
//!     .expect("valid graph");
//!
//! assert!(graph.can_transition(&"outdated".into(), &"updated".into()));
//! assert!(graph.can_force(&"updated".into(), &"outdated".into()));
//! ```

use crate::entity::{EntityType, StateName};
use crate::handler::TransitionHandler;
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on a single handler invocation
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Move an entity out of a state once it has been there long enough
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTimeout {
    pub after: Duration,
    pub target: StateName,
}

/// Declaration of one state in a graph
#[derive(Clone)]
pub struct StateDef {
    name: StateName,
    transitions: BTreeSet<StateName>,
    manual_transitions: BTreeSet<StateName>,
    handler: Option<Arc<dyn TransitionHandler>>,
    terminal: bool,
    externally_progressed: bool,
    timeout: Option<StateTimeout>,
    retry: Option<RetryPolicy>,
}

impl StateDef {
    /// Declare a non-terminal state
    pub fn new(name: impl Into<StateName>) -> Self {
        Self {
            name: name.into(),
            transitions: BTreeSet::new(),
            manual_transitions: BTreeSet::new(),
            handler: None,
            terminal: false,
            externally_progressed: false,
            timeout: None,
            retry: None,
        }
    }

    /// Declare a terminal state (no automatic outgoing transitions, never polled)
    pub fn terminal(name: impl Into<StateName>) -> Self {
        let mut def = Self::new(name);
        def.terminal = true;
        def
    }

    /// States the handler may advance to
    pub fn transitions_to<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StateName>,
    {
        self.transitions.extend(states.into_iter().map(Into::into));
        self
    }

    /// Extra states only an operator may force the entity into
    pub fn manual_to<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StateName>,
    {
        self.manual_transitions
            .extend(states.into_iter().map(Into::into));
        self
    }

    /// Bind the handler run while an entity sits in this state
    pub fn handler(self, handler: impl TransitionHandler + 'static) -> Self {
        self.handler_arc(Arc::new(handler))
    }

    /// Bind a shared handler
    pub fn handler_arc(mut self, handler: Arc<dyn TransitionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// The state is advanced by something outside the engine and is not
    /// polled unless it carries a timeout
    pub fn externally_progressed(mut self) -> Self {
        self.externally_progressed = true;
        self
    }

    /// Move to `target` once the entity has been in this state for `after`
    pub fn timeout_after(mut self, after: Duration, target: impl Into<StateName>) -> Self {
        self.timeout = Some(StateTimeout {
            after,
            target: target.into(),
        });
        self
    }

    /// Override the graph's default retry policy for this state
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn name(&self) -> &StateName {
        &self.name
    }

    pub fn transitions(&self) -> &BTreeSet<StateName> {
        &self.transitions
    }

    pub fn manual_transitions(&self) -> &BTreeSet<StateName> {
        &self.manual_transitions
    }

    pub fn handler_ref(&self) -> Option<&Arc<dyn TransitionHandler>> {
        self.handler.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn is_externally_progressed(&self) -> bool {
        self.externally_progressed
    }

    pub fn timeout(&self) -> Option<&StateTimeout> {
        self.timeout.as_ref()
    }

    pub fn retry_override(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Whether the scheduler ever polls entities in this state
    pub fn is_schedulable(&self) -> bool {
        !self.terminal && (!self.externally_progressed || self.timeout.is_some())
    }
}

impl fmt::Debug for StateDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateDef")
            .field("name", &self.name)
            .field("transitions", &self.transitions)
            .field("manual_transitions", &self.manual_transitions)
            .field("has_handler", &self.handler.is_some())
            .field("terminal", &self.terminal)
            .field("externally_progressed", &self.externally_progressed)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

/// Immutable state graph for one entity type
#[derive(Debug, Clone)]
pub struct StateGraph {
    entity_type: EntityType,
    initial: StateName,
    states: BTreeMap<StateName, StateDef>,
    default_retry: RetryPolicy,
    handler_timeout: Duration,
}

impl StateGraph {
    /// Start declaring a graph for `entity_type`
    pub fn builder(entity_type: impl Into<EntityType>) -> StateGraphBuilder {
        StateGraphBuilder::new(entity_type)
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    /// State new entities are created in
    pub fn initial(&self) -> &StateName {
        &self.initial
    }

    pub fn state(&self, name: &StateName) -> Option<&StateDef> {
        self.states.get(name)
    }

    /// Look up a state, failing if it is not declared in this graph
    pub fn require_state(&self, name: &StateName) -> Result<&StateDef> {
        self.states.get(name).ok_or_else(|| Error::UnknownState {
            entity_type: self.entity_type.to_string(),
            state: name.to_string(),
        })
    }

    pub fn contains(&self, name: &StateName) -> bool {
        self.states.contains_key(name)
    }

    pub fn states(&self) -> impl Iterator<Item = &StateDef> {
        self.states.values()
    }

    pub fn state_names(&self) -> impl Iterator<Item = &StateName> {
        self.states.keys()
    }

    /// Whether a handler may move an entity from `from` to `to`
    pub fn can_transition(&self, from: &StateName, to: &StateName) -> bool {
        self.states
            .get(from)
            .is_some_and(|def| def.transitions.contains(to))
    }

    /// Whether an operator may force an entity from `from` to `to`.
    ///
    /// Allows automatic edges, manual edges and resetting into the current
    /// state.
    pub fn can_force(&self, from: &StateName, to: &StateName) -> bool {
        if !self.contains(to) {
            return false;
        }
        match self.states.get(from) {
            Some(def) => {
                from == to || def.transitions.contains(to) || def.manual_transitions.contains(to)
            }
            None => false,
        }
    }

    /// Retry policy in effect for `state`
    pub fn retry_policy(&self, state: &StateName) -> &RetryPolicy {
        self.states
            .get(state)
            .and_then(|def| def.retry.as_ref())
            .unwrap_or(&self.default_retry)
    }

    pub fn default_retry(&self) -> &RetryPolicy {
        &self.default_retry
    }

    /// Bound on a single handler invocation for this entity type
    pub fn handler_timeout(&self) -> Duration {
        self.handler_timeout
    }

    /// States the scheduler polls
    pub fn schedulable_states(&self) -> impl Iterator<Item = &StateDef> {
        self.states.values().filter(|def| def.is_schedulable())
    }

    pub fn is_terminal(&self, state: &StateName) -> bool {
        self.states.get(state).is_some_and(|def| def.terminal)
    }
}

/// Builder for [`StateGraph`]
pub struct StateGraphBuilder {
    entity_type: EntityType,
    initial: Option<StateName>,
    states: Vec<StateDef>,
    default_retry: RetryPolicy,
    handler_timeout: Duration,
}

impl StateGraphBuilder {
    pub fn new(entity_type: impl Into<EntityType>) -> Self {
        Self {
            entity_type: entity_type.into(),
            initial: None,
            states: Vec::new(),
            default_retry: RetryPolicy::default(),
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
        }
    }

    /// Set the state new entities start in
    pub fn initial(mut self, state: impl Into<StateName>) -> Self {
        self.initial = Some(state.into());
        self
    }

    /// Declare a state
    pub fn state(mut self, def: StateDef) -> Self {
        self.states.push(def);
        self
    }

    /// Retry policy for states without their own
    pub fn default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Bound on a single handler invocation
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Validate and freeze the graph
    pub fn build(self) -> Result<StateGraph> {
        let entity_type = self.entity_type;
        let config_err =
            |msg: String| Error::Configuration(format!("graph '{}': {}", entity_type, msg));

        let mut states: BTreeMap<StateName, StateDef> = BTreeMap::new();
        for def in self.states {
            if states.contains_key(&def.name) {
                return Err(config_err(format!("state '{}' declared twice", def.name)));
            }
            states.insert(def.name.clone(), def);
        }

        if states.is_empty() {
            return Err(config_err("no states declared".to_string()));
        }

        let initial = self
            .initial
            .ok_or_else(|| config_err("no initial state".to_string()))?;
        if !states.contains_key(&initial) {
            return Err(config_err(format!(
                "initial state '{}' is not declared",
                initial
            )));
        }

        self.default_retry
            .validate()
            .map_err(|e| config_err(format!("default retry policy: {}", e)))?;

        if self.handler_timeout.is_zero() {
            return Err(config_err("handler timeout must be > 0".to_string()));
        }

        for def in states.values() {
            let edges = def.transitions.iter().chain(def.manual_transitions.iter());
            for target in edges {
                if !states.contains_key(target) {
                    return Err(config_err(format!(
                        "state '{}' references undeclared state '{}'",
                        def.name, target
                    )));
                }
            }

            if let Some(policy) = &def.retry {
                policy
                    .validate()
                    .map_err(|e| config_err(format!("state '{}' retry policy: {}", def.name, e)))?;
            }

            if def.terminal {
                if !def.transitions.is_empty() {
                    return Err(config_err(format!(
                        "terminal state '{}' has automatic transitions",
                        def.name
                    )));
                }
                if def.handler.is_some() {
                    return Err(config_err(format!(
                        "terminal state '{}' has a handler",
                        def.name
                    )));
                }
                if def.timeout.is_some() {
                    return Err(config_err(format!(
                        "terminal state '{}' has a timeout",
                        def.name
                    )));
                }
                continue;
            }

            if def.transitions.is_empty() {
                return Err(config_err(format!(
                    "non-terminal state '{}' has no transitions",
                    def.name
                )));
            }

            if def.handler.is_none() && !def.externally_progressed {
                return Err(config_err(format!(
                    "non-terminal state '{}' has no handler",
                    def.name
                )));
            }

            if let Some(timeout) = &def.timeout {
                if timeout.after.is_zero() {
                    return Err(config_err(format!(
                        "state '{}' timeout must be > 0",
                        def.name
                    )));
                }
                if !def.transitions.contains(&timeout.target) {
                    return Err(config_err(format!(
                        "state '{}' timeout target '{}' is not one of its transitions",
                        def.name, timeout.target
                    )));
                }
            }
        }

        Ok(StateGraph {
            entity_type,
            initial,
            states,
            default_retry: self.default_retry,
            handler_timeout: self.handler_timeout,
        })
    }
}
