//! Status command

use super::{cli_config, connect};
use anyhow::Result;
use stator_core::EntityRef;
use uuid::Uuid;

/// Print one entity's state fields, or counts per type and state
pub async fn execute(database_url: &str, entity_type: Option<&str>, id: Option<Uuid>) -> Result<()> {
    let service = connect(database_url, cli_config()).await?;

    match (entity_type, id) {
        (Some(entity_type), Some(id)) => {
            let record = service.get(&EntityRef::new(entity_type, id)).await?;
            println!("Entity: {}", record.entity);
            println!("State: {}", record.state);
            println!("State changed: {}", record.state_changed);
            println!("Attempts: {}", record.attempt_count);
            if let Some(attempted) = record.state_attempted {
                println!("Last attempt: {}", attempted);
            }
            if let (Some(until), Some(owner)) = (record.state_locked_until, &record.state_lock_owner) {
                println!("Lease: {} until {}", owner, until);
            }
        }
        (filter, _) => {
            let counts = service.counts().await?;
            println!("{:<20} {:<20} {:>10}", "TYPE", "STATE", "COUNT");
            for count in counts
                .iter()
                .filter(|c| filter.map_or(true, |t| c.entity_type == t))
            {
                println!("{:<20} {:<20} {:>10}", count.entity_type, count.state, count.count);
            }
        }
    }

    Ok(())
}
