//! Database models for entity state records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use stator_core::{EntityRecord, EntityRef, EntityType, StateName};
use uuid::Uuid;

/// Row of the `stator_entities` table
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EntityModel {
    pub entity_type: String,
    pub entity_id: Uuid,
    pub state: String,
    pub state_changed: DateTime<Utc>,
    pub state_attempted: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub state_locked_until: Option<DateTime<Utc>>,
    pub state_lock_owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityModel {
    pub fn from_record(record: &EntityRecord, updated_at: DateTime<Utc>) -> Self {
        Self {
            entity_type: record.entity.entity_type.as_str().to_string(),
            entity_id: record.entity.id,
            state: record.state.as_str().to_string(),
            state_changed: record.state_changed,
            state_attempted: record.state_attempted,
            attempt_count: i32::try_from(record.attempt_count).unwrap_or(i32::MAX),
            state_locked_until: record.state_locked_until,
            state_lock_owner: record.state_lock_owner.clone(),
            created_at: record.created_at,
            updated_at,
        }
    }
}

impl From<EntityModel> for EntityRecord {
    fn from(model: EntityModel) -> Self {
        EntityRecord {
            entity: EntityRef::new(EntityType::new(model.entity_type), model.entity_id),
            state: StateName::new(model.state),
            state_changed: model.state_changed,
            state_attempted: model.state_attempted,
            attempt_count: u32::try_from(model.attempt_count).unwrap_or(0),
            state_locked_until: model.state_locked_until,
            state_lock_owner: model.state_lock_owner,
            created_at: model.created_at,
        }
    }
}

/// Number of entities of one type sitting in one state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct StateCount {
    pub entity_type: String,
    pub state: String,
    pub count: i64,
}
