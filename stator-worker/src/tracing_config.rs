//! Tracing subscriber setup for the worker
//!
//! JSON lines on stdout, filtered by `RUST_LOG`:
//!
//! ```bash
//! export RUST_LOG=stator_worker=debug,stator_runtime=debug,stator_storage=info
//! ```

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset or invalid
pub const DEFAULT_FILTER: &str = "stator_worker=info,stator_runtime=info,tower_http=info";

/// Install the global subscriber
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .try_init()?;

    Ok(())
}
