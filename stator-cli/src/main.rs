//! Stator CLI

use clap::{Parser, Subcommand};
use stator_federation::AdminAction;
use uuid::Uuid;

mod commands;

#[derive(Parser)]
#[command(name = "stator")]
#[command(author, version, about = "Stator task engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,

    /// Run the scheduler loop until Ctrl-C (or for a fixed duration)
    Run {
        /// Stop after this many seconds
        #[arg(long = "for")]
        run_for: Option<u64>,

        /// Concurrent transitions
        #[arg(long, env = "STATOR_CONCURRENCY", default_value = "16")]
        concurrency: usize,
    },

    /// Run a single scheduling cycle
    Cycle {
        /// Wait for dispatched handlers to finish and print their outcomes
        #[arg(long)]
        wait: bool,
    },

    /// Force an entity into a state
    Force {
        /// Entity type (e.g. "identity")
        entity_type: String,

        /// Entity ID
        id: Uuid,

        /// Target state
        target: String,
    },

    /// Refetch identities now (forces them to "outdated")
    ForceUpdate {
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },

    /// Replay inbox messages (forces them back to "received")
    ResetState {
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },

    /// Show one entity, or entity counts per type and state
    Status {
        /// Entity type
        entity_type: Option<String>,

        /// Entity ID
        #[arg(requires = "entity_type")]
        id: Option<Uuid>,
    },

    /// List retrying and frozen entities
    Stuck {
        /// Only list entities of this type
        #[arg(long)]
        entity_type: Option<String>,

        /// Maximum entities to list
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let database_url = cli
        .database_url
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL not set"))?;

    match cli.command {
        Commands::Migrate => {
            commands::migrate::execute(&database_url).await?;
        }
        Commands::Run {
            run_for,
            concurrency,
        } => {
            commands::run::execute(&database_url, run_for, concurrency).await?;
        }
        Commands::Cycle { wait } => {
            commands::cycle::execute(&database_url, wait).await?;
        }
        Commands::Force {
            entity_type,
            id,
            target,
        } => {
            commands::force::execute(&database_url, &entity_type, id, &target).await?;
        }
        Commands::ForceUpdate { ids } => {
            commands::force::execute_action(&database_url, AdminAction::ForceUpdate, &ids)
                .await?;
        }
        Commands::ResetState { ids } => {
            commands::force::execute_action(&database_url, AdminAction::ResetState, &ids)
                .await?;
        }
        Commands::Status { entity_type, id } => {
            commands::status::execute(&database_url, entity_type.as_deref(), id).await?;
        }
        Commands::Stuck { entity_type, limit } => {
            commands::stuck::execute(&database_url, entity_type, limit).await?;
        }
    }

    Ok(())
}
