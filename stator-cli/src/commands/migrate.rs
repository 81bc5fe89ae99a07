//! Migrate command

use anyhow::Result;
use stator_storage::PostgresStorage;

pub async fn execute(database_url: &str) -> Result<()> {
    let storage = PostgresStorage::new(database_url).await?;
    storage.migrate().await?;
    tracing::info!("Migrations applied successfully");
    Ok(())
}
