//! Schema migrations for the `stator_entities` table

use crate::Result;
use sqlx::migrate::Migrator;
use sqlx::PgPool;
use tracing::info;

/// Embedded migrations from `stator-storage/migrations`
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply every pending migration
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| crate::Error::Migration(e.to_string()))?;

    info!(
        known_migrations = MIGRATOR.iter().count(),
        "Stator migrations applied"
    );
    Ok(())
}
