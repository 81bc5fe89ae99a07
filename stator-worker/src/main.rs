//! Stator worker
//!
//! HTTP server driving federation objects through their state graphs.
//!
//! # Architecture
//!
//! - POST/GET /.stator/ - Run one scheduling cycle (for cron pingers)
//! - /admin/... - Operator inspection and forced transitions
//! - GET /health, GET /metrics
//!
//! With `STATOR_BACKGROUND_RUNNER=true` (the default) the scheduler loop
//! also runs in-process until shutdown. Any number of workers can share one
//! database; the lease on each entity keeps them from stepping on each
//! other.
//!
//! # Configuration
//!
//! See [`stator_worker::config::WorkerConfig::from_env`].

use stator_core::SystemClock;
use stator_federation::{Collaborators, FederationConfig};
use stator_runtime::StatorService;
use stator_storage::PostgresStorage;
use stator_worker::{
    config::{mask_password, WorkerConfig},
    handler::AppState,
    metrics, router, tracing_config,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, warn};

/// Bound on one HTTP request; a trigger only waits for claims, not handlers
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Admin bodies are small id lists
const MAX_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() {
    if let Err(e) = tracing_config::init_tracing() {
        eprintln!("Failed to initialize tracing: {}", e);
        std::process::exit(1);
    }

    info!("Starting Stator worker");

    let config = match WorkerConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = format!("{:#}", e), "Failed to load configuration");
            std::process::exit(1);
        }
    };

    info!(
        database_url = %mask_password(&config.database_url),
        port = config.port,
        worker_id = %config.worker_id,
        concurrency = config.concurrency,
        background_runner = config.background_runner,
        "Configuration loaded"
    );

    metrics::init_metrics();

    let storage = match PostgresStorage::with_pool_config(&config.database_url, config.pool_config())
        .await
    {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to initialize storage");
            std::process::exit(1);
        }
    };

    if let Err(e) = storage.migrate().await {
        error!(error = %e, "Failed to apply migrations");
        std::process::exit(1);
    }

    info!("Storage initialized successfully");

    // No server collaborators are linked into the standalone binary
    warn!("Using dry-run collaborators; handlers only log their side effects");
    let registry = match stator_federation::registry(
        &Collaborators::dry_run(),
        &FederationConfig::default(),
    ) {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "Invalid state graphs");
            std::process::exit(1);
        }
    };

    let service = match StatorService::new(
        registry,
        Arc::new(storage),
        Arc::new(SystemClock),
        config.service_config(),
    ) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "Failed to initialize service");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runner = config.background_runner.then(|| {
        let service = service.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let summary = service
                .run(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await;
            info!(
                cycles = summary.cycles,
                dispatched = summary.dispatched,
                busy = summary.busy,
                failed_cycles = summary.failed_cycles,
                "Background runner stopped"
            );
        })
    });

    let app = router(AppState { service })
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, address = %addr, "Failed to bind server");
            std::process::exit(1);
        }
    };

    info!(address = %addr, "Server listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });
    if let Err(e) = serve.await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }

    if let Some(runner) = runner {
        if let Err(e) = runner.await {
            error!(error = %e, "Background runner panicked");
        }
    }

    info!("Worker shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl-C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
