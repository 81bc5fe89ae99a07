//! Storage contract used by the runtime

use crate::models::StateCount;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stator_core::{EntityRecord, EntityRef, EntityType, RetryPolicy, StateName};
use std::time::Duration;

/// Selection of due entities for one schedulable `(entity_type, state)` pair.
///
/// An entity matches when it is in `state`, below the policy's attempt
/// ceiling, not under a live lease, past its backoff delay and (when
/// `min_state_age` is set) has been in the state at least that long.
#[derive(Debug, Clone, PartialEq)]
pub struct DueQuery {
    pub entity_type: EntityType,
    pub state: StateName,
    pub retry: RetryPolicy,
    pub min_state_age: Option<Duration>,
}

impl DueQuery {
    pub fn new(entity_type: EntityType, state: StateName, retry: RetryPolicy) -> Self {
        Self {
            entity_type,
            state,
            retry,
            min_state_age: None,
        }
    }

    pub fn with_min_state_age(mut self, age: Duration) -> Self {
        self.min_state_age = Some(age);
        self
    }

    /// Whether `record` satisfies this query at `now`
    pub fn matches(&self, record: &EntityRecord, now: DateTime<Utc>) -> bool {
        if record.entity.entity_type != self.entity_type || record.state != self.state {
            return false;
        }
        if let Some(age) = self.min_state_age {
            let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
            if record.time_in_state(now) < age {
                return false;
            }
        }
        record.is_due(&self.retry, now)
    }
}

/// The single write performed when an execution or manual trigger finishes.
///
/// Every update also clears the lease fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    /// Enter `state`; resets the attempt counters.
    /// `state_changed` becomes `max(previous, at)`.
    Transitioned { state: StateName, at: DateTime<Utc> },

    /// Record a failed attempt; the state is left unchanged
    Attempted { attempt_count: u32, at: DateTime<Utc> },
}

/// Persistence of entity state records
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a new record; fails with `AlreadyExists` on a duplicate key
    async fn insert(&self, record: &EntityRecord) -> Result<()>;

    async fn get(&self, entity: &EntityRef) -> Result<Option<EntityRecord>>;

    /// Due entities across all `queries`, oldest due first, at most `limit`
    async fn find_due(
        &self,
        queries: &[DueQuery],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EntityRecord>>;

    /// Atomically claim `entity` for `owner` until `until`.
    ///
    /// Succeeds only if no live lease exists at `now`; returns the claimed
    /// row, or `None` when another holder's lease is live or the row is gone.
    async fn try_claim(
        &self,
        entity: &EntityRef,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<EntityRecord>>;

    /// Apply `update` and release the lease, only if `owner` still holds it.
    ///
    /// Returns `false` (and writes nothing) when the lease was lost.
    async fn complete(
        &self,
        entity: &EntityRef,
        owner: &str,
        update: &StateUpdate,
    ) -> Result<bool>;

    /// Clear the lease fields if `owner` still holds them
    async fn release(&self, entity: &EntityRef, owner: &str) -> Result<bool>;

    /// Remove a record; returns whether it existed
    async fn delete(&self, entity: &EntityRef) -> Result<bool>;

    /// Entities with failed attempts, most attempts first.
    ///
    /// `entity_type` narrows the selection before `limit` applies.
    async fn list_stuck(
        &self,
        entity_type: Option<&EntityType>,
        limit: usize,
    ) -> Result<Vec<EntityRecord>>;

    /// Entity counts per `(entity_type, state)`
    async fn count_by_state(&self) -> Result<Vec<StateCount>>;
}
