//! Worker configuration module
//!
//! Loads and validates the worker configuration from environment variables.

use anyhow::{anyhow, Context, Result};
use stator_runtime::{RunnerConfig, ServiceConfig};
use stator_storage::PoolConfig;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL connection string
    pub database_url: String,
    /// HTTP port
    pub port: u16,
    /// Prefix of every lease owner token taken by this process
    pub worker_id: String,
    /// Maximum concurrent transitions in this process
    pub concurrency: usize,
    /// Lease taken for each scheduled transition
    pub lease_duration: Duration,
    /// Lease taken for an operator-forced transition
    pub manual_lease: Duration,
    /// Pause between scheduling cycles of the background runner
    pub schedule_interval: Duration,
    /// Run the scheduler loop inside the worker (otherwise only `/.stator/`
    /// triggers cycles)
    pub background_runner: bool,
    /// Stop the background runner after this long
    pub run_for: Option<Duration>,
    /// Connection pool ceiling
    pub db_max_connections: u32,
}

impl WorkerConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string (required)
    /// - `PORT`: HTTP port (default: 8080)
    /// - `STATOR_WORKER_ID`: lease owner prefix (default: random)
    /// - `STATOR_CONCURRENCY`: concurrent transitions (default: 16)
    /// - `STATOR_LEASE_SECONDS`: scheduled lease (default: 120)
    /// - `STATOR_MANUAL_LEASE_SECONDS`: manual lease (default: 30)
    /// - `STATOR_SCHEDULE_INTERVAL_MS`: cycle interval (default: 1000)
    /// - `STATOR_BACKGROUND_RUNNER`: run the loop in-process (default: true)
    /// - `STATOR_RUN_FOR_SECONDS`: stop the loop after this long (default: unset)
    /// - `STATOR_DB_MAX_CONNECTIONS`: pool size (default: 10)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RunnerConfig::default();
        let service_defaults = ServiceConfig::default();

        let database_url =
            lookup("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let config = Self {
            database_url,
            port: parse_or(&lookup, "PORT", 8080)?,
            worker_id: lookup("STATOR_WORKER_ID")
                .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4().simple())),
            concurrency: parse_or(&lookup, "STATOR_CONCURRENCY", defaults.concurrency)?,
            lease_duration: Duration::from_secs(parse_or(
                &lookup,
                "STATOR_LEASE_SECONDS",
                defaults.lease_duration.as_secs(),
            )?),
            manual_lease: Duration::from_secs(parse_or(
                &lookup,
                "STATOR_MANUAL_LEASE_SECONDS",
                service_defaults.manual_lease.as_secs(),
            )?),
            schedule_interval: Duration::from_millis(parse_or(
                &lookup,
                "STATOR_SCHEDULE_INTERVAL_MS",
                defaults.schedule_interval.as_millis() as u64,
            )?),
            background_runner: parse_or(&lookup, "STATOR_BACKGROUND_RUNNER", true)?,
            run_for: parse_opt::<u64, _>(&lookup, "STATOR_RUN_FOR_SECONDS")?
                .map(Duration::from_secs),
            db_max_connections: parse_or(&lookup, "STATOR_DB_MAX_CONNECTIONS", 10)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(anyhow!("DATABASE_URL cannot be empty"));
        }
        if self.worker_id.trim().is_empty() {
            return Err(anyhow!("STATOR_WORKER_ID cannot be empty"));
        }
        if self.concurrency == 0 {
            return Err(anyhow!("STATOR_CONCURRENCY must be > 0"));
        }
        if self.lease_duration.is_zero() || self.manual_lease.is_zero() {
            return Err(anyhow!("lease durations must be > 0"));
        }
        if self.schedule_interval.is_zero() {
            return Err(anyhow!("STATOR_SCHEDULE_INTERVAL_MS must be > 0"));
        }
        if self.db_max_connections == 0 {
            return Err(anyhow!("STATOR_DB_MAX_CONNECTIONS must be > 0"));
        }
        Ok(())
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            concurrency: self.concurrency,
            lease_duration: self.lease_duration,
            schedule_interval: self.schedule_interval,
            run_for: self.run_for,
            ..RunnerConfig::default()
        }
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            worker_id: self.worker_id.clone(),
            runner: self.runner_config(),
            manual_lease: self.manual_lease,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.db_max_connections,
            ..PoolConfig::default()
        }
    }
}

fn parse_opt<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {} value: {:?}", key, raw))
        })
        .transpose()
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

/// Mask password in database URL for logging
pub fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            // "postgres://" has a colon but no credentials after it
            if !url[colon_pos..at_pos].starts_with("://") {
                let mut masked = url.to_string();
                masked.replace_range(colon_pos + 1..at_pos, "****");
                return masked;
            }
        }
    }
    url.to_string()
}
