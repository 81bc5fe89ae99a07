//! Time-bounded exclusive claims on entities
//!
//! A lease is the only thing that keeps two executors off the same entity.
//! It is taken with one atomic conditional update and expires on its own;
//! there is no heartbeat, so a crashed holder is recovered by expiry alone.

use crate::metrics::CLAIM_CONFLICTS_TOTAL;
use crate::{map_storage_error, Result};
use chrono::{DateTime, Utc};
use stator_core::{Clock, EntityRecord, EntityRef};
use stator_storage::StateStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use uuid::Uuid;

/// A live claim on one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub entity: EntityRef,

    /// Unique per claim: `"{worker_id}/{uuid}"`
    pub owner: String,

    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A successful claim: the lease plus the row as it was claimed
#[derive(Debug, Clone)]
pub struct Claim {
    pub lease: Lease,
    pub record: EntityRecord,
}

/// Claims and releases entity leases
pub struct LeaseManager {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    worker_id: String,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            clock,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn owner_token(&self) -> String {
        format!("{}/{}", self.worker_id, Uuid::new_v4())
    }

    /// Claim `entity` for `duration` if nobody holds a live lease on it.
    ///
    /// Returns `None` when another lease is live or the entity is gone.
    #[instrument(
        skip(self),
        fields(
            entity_type = %entity.entity_type,
            entity_id = %entity.id,
            worker_id = %self.worker_id
        )
    )]
    pub async fn try_claim(&self, entity: &EntityRef, duration: Duration) -> Result<Option<Claim>> {
        let now = self.clock.now();
        let expires_at = now
            + chrono::Duration::from_std(duration)
                .map_err(|e| crate::Error::Configuration(format!("lease duration: {}", e)))?;
        let owner = self.owner_token();

        let claimed = self
            .store
            .try_claim(entity, &owner, now, expires_at)
            .await
            .map_err(|e| map_storage_error(e, "claim entity"))?;

        match claimed {
            Some(record) => {
                debug!(owner = %owner, expires_at = %expires_at, "Lease acquired");
                Ok(Some(Claim {
                    lease: Lease {
                        entity: entity.clone(),
                        owner,
                        acquired_at: now,
                        expires_at,
                    },
                    record,
                }))
            }
            None => {
                // A missing row is not a conflict
                let exists = self
                    .store
                    .get(entity)
                    .await
                    .map_err(|e| map_storage_error(e, "look up unclaimed entity"))?
                    .is_some();
                if exists {
                    CLAIM_CONFLICTS_TOTAL
                        .with_label_values(&[entity.entity_type.as_str()])
                        .inc();
                    debug!("Entity already claimed");
                } else {
                    debug!("Entity no longer exists");
                }
                Ok(None)
            }
        }
    }

    /// Release `lease` if it is still ours; a successor's lease is never touched
    #[instrument(
        skip(self, lease),
        fields(entity_type = %lease.entity.entity_type, entity_id = %lease.entity.id)
    )]
    pub async fn release(&self, lease: &Lease) -> Result<bool> {
        self.store
            .release(&lease.entity, &lease.owner)
            .await
            .map_err(|e| map_storage_error(e, "release lease"))
    }
}
