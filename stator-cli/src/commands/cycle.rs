//! Cycle command: one scheduling pass

use super::{cli_config, connect};
use anyhow::Result;

pub async fn execute(database_url: &str, wait: bool) -> Result<()> {
    let service = connect(database_url, cli_config()).await?;

    let report = service.run_cycle().await?;
    println!(
        "Candidates: {}  Dispatched: {}  Busy: {}",
        report.candidates, report.dispatched, report.busy
    );

    // Dispatched handlers are detached; exiting now would abandon them
    let reports = service.wait_idle().await;
    if wait {
        for report in reports {
            println!(
                "{}  {} -> {}",
                report.entity,
                report.from_state,
                serde_json::to_string(&report.outcome)?
            );
        }
    }
    Ok(())
}
