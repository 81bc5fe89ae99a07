//! In-process state store
//!
//! Every operation runs under one mutex, which makes `try_claim` and the
//! owner-fenced writes atomic the same way a single conditional UPDATE is
//! in PostgreSQL.

use crate::models::StateCount;
use crate::store::{DueQuery, StateStore, StateUpdate};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use stator_core::{EntityRecord, EntityRef, EntityType};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// In-memory [`StateStore`]
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<EntityRef, EntityRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored record
    pub fn snapshot(&self) -> Vec<EntityRecord> {
        self.records.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Overwrite a record without any checks (test setup only)
    pub fn put(&self, record: EntityRecord) {
        self.records.lock().insert(record.entity.clone(), record);
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn insert(&self, record: &EntityRecord) -> Result<()> {
        if record.state.as_str().is_empty() {
            return Err(Error::ValidationError("state cannot be empty".to_string()));
        }
        let mut records = self.records.lock();
        if records.contains_key(&record.entity) {
            return Err(Error::AlreadyExists(record.entity.to_string()));
        }
        records.insert(record.entity.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, entity: &EntityRef) -> Result<Option<EntityRecord>> {
        Ok(self.records.lock().get(entity).cloned())
    }

    async fn find_due(
        &self,
        queries: &[DueQuery],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EntityRecord>> {
        if limit == 0 || queries.is_empty() {
            return Ok(Vec::new());
        }

        let records = self.records.lock();
        let mut due: Vec<(DateTime<Utc>, EntityRecord)> = records
            .values()
            .filter_map(|record| {
                queries
                    .iter()
                    .find(|q| q.matches(record, now))
                    .map(|q| (record.next_attempt_at(&q.retry), record.clone()))
            })
            .collect();
        drop(records);

        due.sort_by(|(a_at, a), (b_at, b)| {
            a_at.cmp(b_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        Ok(due.into_iter().take(limit).map(|(_, r)| r).collect())
    }

    async fn try_claim(
        &self,
        entity: &EntityRef,
        owner: &str,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Option<EntityRecord>> {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(entity) else {
            return Ok(None);
        };
        if record.is_locked(now) {
            return Ok(None);
        }
        record.state_locked_until = Some(until);
        record.state_lock_owner = Some(owner.to_string());
        Ok(Some(record.clone()))
    }

    async fn complete(
        &self,
        entity: &EntityRef,
        owner: &str,
        update: &StateUpdate,
    ) -> Result<bool> {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(entity) else {
            return Ok(false);
        };
        if record.state_lock_owner.as_deref() != Some(owner) {
            return Ok(false);
        }

        match update {
            StateUpdate::Transitioned { state, at } => {
                record.state = state.clone();
                record.state_changed = record.state_changed.max(*at);
                record.state_attempted = None;
                record.attempt_count = 0;
            }
            StateUpdate::Attempted { attempt_count, at } => {
                record.state_attempted = Some(*at);
                record.attempt_count = *attempt_count;
            }
        }
        record.state_locked_until = None;
        record.state_lock_owner = None;
        Ok(true)
    }

    async fn release(&self, entity: &EntityRef, owner: &str) -> Result<bool> {
        let mut records = self.records.lock();
        match records.get_mut(entity) {
            Some(record) if record.state_lock_owner.as_deref() == Some(owner) => {
                record.state_locked_until = None;
                record.state_lock_owner = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, entity: &EntityRef) -> Result<bool> {
        Ok(self.records.lock().remove(entity).is_some())
    }

    async fn list_stuck(
        &self,
        entity_type: Option<&EntityType>,
        limit: usize,
    ) -> Result<Vec<EntityRecord>> {
        let mut stuck: Vec<EntityRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| r.attempt_count > 0)
            .filter(|r| entity_type.map_or(true, |t| r.entity.entity_type == *t))
            .cloned()
            .collect();
        stuck.sort_by(|a, b| {
            b.attempt_count
                .cmp(&a.attempt_count)
                .then_with(|| a.state_attempted.cmp(&b.state_attempted))
        });
        stuck.truncate(limit);
        Ok(stuck)
    }

    async fn count_by_state(&self) -> Result<Vec<StateCount>> {
        let mut counts: BTreeMap<(String, String), i64> = BTreeMap::new();
        for record in self.records.lock().values() {
            *counts
                .entry((
                    record.entity.entity_type.to_string(),
                    record.state.to_string(),
                ))
                .or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((entity_type, state), count)| StateCount {
                entity_type,
                state,
                count,
            })
            .collect())
    }
}
