//! CLI command implementations

pub mod cycle;
pub mod force;
pub mod migrate;
pub mod run;
pub mod status;
pub mod stuck;

use anyhow::{Context, Result};
use stator_core::SystemClock;
use stator_federation::{Collaborators, FederationConfig};
use stator_runtime::{ServiceConfig, StatorService};
use stator_storage::PostgresStorage;
use std::sync::Arc;

/// Connect to the database and assemble the engine with the federation graphs
pub async fn connect(database_url: &str, config: ServiceConfig) -> Result<StatorService> {
    let storage = PostgresStorage::new(database_url)
        .await
        .context("Failed to connect to database")?;
    let registry =
        stator_federation::registry(&Collaborators::dry_run(), &FederationConfig::default())?;

    let service = StatorService::new(registry, Arc::new(storage), Arc::new(SystemClock), config)?;
    Ok(service)
}

/// Service config for short-lived CLI processes
pub fn cli_config() -> ServiceConfig {
    ServiceConfig {
        worker_id: format!("cli-{}", std::process::id()),
        ..ServiceConfig::default()
    }
}
