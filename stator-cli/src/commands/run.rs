//! Run command: the scheduler loop in the foreground

use super::{cli_config, connect};
use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};

pub async fn execute(database_url: &str, run_for: Option<u64>, concurrency: usize) -> Result<()> {
    let mut config = cli_config();
    config.runner.concurrency = concurrency;
    config.runner.run_for = run_for.map(Duration::from_secs);

    let service = connect(database_url, config).await?;
    warn!("Using dry-run collaborators; handlers only log their side effects");

    let summary = service
        .run(async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!(
        cycles = summary.cycles,
        dispatched = summary.dispatched,
        busy = summary.busy,
        failed_cycles = summary.failed_cycles,
        "Runner stopped"
    );
    println!(
        "Ran {} cycles: {} dispatched, {} busy, {} failed cycles",
        summary.cycles, summary.dispatched, summary.busy, summary.failed_cycles
    );
    Ok(())
}
