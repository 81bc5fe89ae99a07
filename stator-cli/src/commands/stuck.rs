//! Stuck command

use super::{cli_config, connect};
use anyhow::Result;
use stator_core::EntityType;

pub async fn execute(database_url: &str, entity_type: Option<String>, limit: usize) -> Result<()> {
    let service = connect(database_url, cli_config()).await?;
    let entity_type = entity_type.map(EntityType::new);
    let stuck = service.stuck(entity_type.as_ref(), limit).await?;

    if stuck.is_empty() {
        println!("No stuck entities");
        return Ok(());
    }

    println!(
        "{:<52} {:<20} {:>8}  {}",
        "ENTITY", "STATE", "ATTEMPTS", "NEXT ATTEMPT"
    );
    for entry in stuck {
        let next = if entry.frozen {
            "frozen".to_string()
        } else {
            entry
                .next_attempt_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        };
        let attempts = match entry.max_attempts {
            Some(max) => format!("{}/{}", entry.record.attempt_count, max),
            None => entry.record.attempt_count.to_string(),
        };
        println!(
            "{:<52} {:<20} {:>8}  {}",
            entry.record.entity.to_string(),
            entry.record.state.to_string(),
            attempts,
            next
        );
    }
    Ok(())
}
