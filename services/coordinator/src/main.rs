//! Fleet Coordinator
//!
//! Serves the node-facing fleet API and the administration API on separate
//! listeners, and sweeps expired state in the background.

use std::sync::Arc;

use anyhow::Result;
use fleet_coordinator::{
    api,
    clock::SystemClock,
    config,
    db::Store,
    fleet::Coordinator,
    state::AppState,
    sweep::{SweepWorker, SweepWorkerConfig},
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet coordinator");
    info!(
        listen_addr = %config.listen_addr,
        admin_listen_addr = %config.admin_listen_addr,
        database_path = %config.database_path,
        admin_auth = config.admin_token.is_some(),
        "Configuration loaded"
    );

    let store = match Store::open(&config.database_path) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Failed to open fleet store");
            return Err(e.into());
        }
    };

    let coordinator = Coordinator::new(store, Arc::new(SystemClock), config.fleet.clone());

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweep_worker = SweepWorker::new(
        coordinator.clone(),
        SweepWorkerConfig {
            interval: config.sweep_interval,
        },
    );
    let sweep_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            sweep_worker.run(shutdown_rx).await;
        }
    });

    let state = AppState::new(coordinator.clone(), config.clone());

    let fleet_listener = TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Fleet API listening");
    let admin_listener = TcpListener::bind(&config.admin_listen_addr).await?;
    info!(addr = %config.admin_listen_addr, "Admin API listening");

    let fleet_server = tokio::spawn({
        let app = api::create_router(state.clone());
        let shutdown_rx = shutdown_rx.clone();
        async move {
            axum::serve(fleet_listener, app)
                .with_graceful_shutdown(wait_for_shutdown(shutdown_rx, "fleet"))
                .await
        }
    });

    let admin_server = tokio::spawn({
        let app = api::create_admin_router(state);
        async move {
            axum::serve(admin_listener, app)
                .with_graceful_shutdown(wait_for_shutdown(shutdown_rx, "admin"))
                .await
        }
    });

    // Wait for shutdown signal (Ctrl+C) or an early server exit
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = fleet_server => log_server_exit("fleet", result),
        result = admin_server => log_server_exit("admin", result),
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, sweep_handle).await {
        warn!(error = %e, "Sweep worker did not shut down in time");
    }

    if let Err(e) = coordinator.shutdown().await {
        error!(error = %e, "Failed to flush fleet store");
    }

    info!("Fleet coordinator shutdown complete");
    Ok(())
}

async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>, listener: &'static str) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }
    info!(listener, "HTTP server shutting down");
}

fn log_server_exit(
    listener: &'static str,
    result: Result<std::io::Result<()>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(())) => info!(listener, "Server exited normally"),
        Ok(Err(e)) => error!(listener, error = %e, "Server error"),
        Err(e) => error!(listener, error = %e, "Server task panicked"),
    }
}
