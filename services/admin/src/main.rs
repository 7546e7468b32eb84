//! Fleet admin
//!
//! Central tier of the fleet. Accepts controller links over WebSocket or
//! HTTP polling, tracks registered controllers, and broadcasts dashboard and
//! cookie syncs to them.

use std::sync::Arc;

use anyhow::{Context, Result};
use fleet_admin::{
    api, config,
    pending::{JsonFilePendingStore, MemoryPendingStore, PendingSyncStore},
    protocol,
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet admin");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let store: Arc<dyn PendingSyncStore> = match &config.pending_sync_path {
        Some(path) => {
            let store = JsonFilePendingStore::open(path)
                .await
                .with_context(|| format!("opening pending-sync store {}", path.display()))?;
            info!(path = %path.display(), "Durable pending-sync store opened");
            Arc::new(store)
        }
        None => {
            warn!("FLEET_PENDING_SYNC_PATH not set, pending-sync flags will not survive restart");
            Arc::new(MemoryPendingStore::new())
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listen_addr = config.listen_addr;
    let state = AppState::new(config, store);

    let sweep_handle = state
        .supervisor()
        .spawn_liveness_sweep(shutdown_rx.clone());
    let protocol_handle = protocol::spawn(state.clone(), shutdown_rx.clone());

    let app = api::create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    // Upgraded WebSocket streams outlive the HTTP server; close them here.
    state.supervisor().shutdown();

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, sweep_handle).await {
        warn!(error = %e, "Liveness sweep did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, protocol_handle).await {
        warn!(error = %e, "Protocol handler did not shut down in time");
    }

    info!("Fleet admin shutdown complete");
    Ok(())
}
