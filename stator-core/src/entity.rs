//! Entity identity and the persisted state record
//!
//! Every stateful domain row (Identity, Follow, InboxMessage, ...) is tracked
//! by the engine through an [`EntityRecord`]: the generic state fields plus a
//! reference to the row they belong to.

use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Name of a stateful entity type (e.g. `identity`, `inbox_message`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Create a new entity type name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the type name as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier of a state within a state graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateName(String);

impl StateName {
    /// Create a new state name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the state name as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StateName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StateName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl PartialEq<str> for StateName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for StateName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Reference to one stateful row: its type plus its primary key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub id: Uuid,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<EntityType>, id: Uuid) -> Self {
        Self {
            entity_type: entity_type.into(),
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// The state fields the engine persists for every stateful entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity: EntityRef,

    /// Current state; always a node of the entity type's graph
    pub state: StateName,

    /// When the entity entered its current state
    pub state_changed: DateTime<Utc>,

    /// When the last failed attempt happened (None after a successful transition)
    pub state_attempted: Option<DateTime<Utc>>,

    /// Consecutive failed attempts since the last successful transition
    pub attempt_count: u32,

    /// While in the future, the entity is claimed by `state_lock_owner`
    pub state_locked_until: Option<DateTime<Utc>>,

    /// Opaque owner token of the current (or last) lease holder
    pub state_lock_owner: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl EntityRecord {
    /// A fresh, unclaimed record sitting in `state`
    pub fn new(entity: EntityRef, state: impl Into<StateName>, now: DateTime<Utc>) -> Self {
        Self {
            entity,
            state: state.into(),
            state_changed: now,
            state_attempted: None,
            attempt_count: 0,
            state_locked_until: None,
            state_lock_owner: None,
            created_at: now,
        }
    }

    /// Whether a live lease is held on this entity at `now`
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state_locked_until, Some(until) if until > now)
    }

    /// Whether the attempt ceiling has been reached
    pub fn is_frozen(&self, policy: &RetryPolicy) -> bool {
        policy.is_exhausted(self.attempt_count)
    }

    /// Earliest time the scheduler may pick this entity up again
    pub fn next_attempt_at(&self, policy: &RetryPolicy) -> DateTime<Utc> {
        match self.state_attempted {
            None => self.state_changed,
            Some(attempted) => attempted + policy.backoff_chrono(self.attempt_count),
        }
    }

    /// Whether the attempt ceiling and backoff allow an attempt at `now`,
    /// regardless of who holds the lease
    pub fn is_ready(&self, policy: &RetryPolicy, now: DateTime<Utc>) -> bool {
        !self.is_frozen(policy)
            && (self.state_attempted.is_none() || now >= self.next_attempt_at(policy))
    }

    /// Whether the entity is due for another attempt at `now`
    pub fn is_due(&self, policy: &RetryPolicy, now: DateTime<Utc>) -> bool {
        !self.is_locked(now) && self.is_ready(policy, now)
    }

    /// How long the entity has been sitting in its current state
    pub fn time_in_state(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.state_changed
    }
}
