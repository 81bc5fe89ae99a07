//! Force command: operator transitions

use super::{cli_config, connect};
use anyhow::{bail, Result};
use stator_core::{EntityRef, StateName};
use stator_federation::AdminAction;
use stator_runtime::Outcome;
use uuid::Uuid;

pub async fn execute(database_url: &str, entity_type: &str, id: Uuid, target: &str) -> Result<()> {
    let service = connect(database_url, cli_config()).await?;
    let entity = EntityRef::new(entity_type, id);

    let report = service
        .transition_perform(&entity, &StateName::from(target))
        .await?;
    if report.outcome == Outcome::LeaseLost {
        bail!("Lease on {} was lost before the write; try again", entity);
    }
    println!("{}: {} -> {}", entity, report.from_state, target);
    Ok(())
}

pub async fn execute_action(database_url: &str, action: AdminAction, ids: &[Uuid]) -> Result<()> {
    let service = connect(database_url, cli_config()).await?;
    let (entity_type, target) = action.target();
    let entities: Vec<EntityRef> = ids
        .iter()
        .map(|id| EntityRef::new(entity_type.clone(), *id))
        .collect();

    let mut failed = 0;
    for (entity, result) in service.force_many(&entities, &target).await {
        match result {
            Ok(report) if report.outcome.is_advanced() => {
                println!("{}: {} -> {}", entity, report.from_state, target);
            }
            Ok(_) => {
                failed += 1;
                println!("{}: lease lost, not applied", entity);
            }
            Err(e) => {
                failed += 1;
                println!("{}: {}", entity, e);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} entities were not updated", failed, ids.len());
    }
    Ok(())
}
