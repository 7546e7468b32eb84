//! Fleet controller
//!
//! Per-site tier of the fleet. Registers with the admin, reports status,
//! applies dashboard and cookie syncs, and relays commands to host agents.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use fleet_controller::{
    api, config,
    runtime::{ControllerRuntime, LinkRoutes},
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to FLEET_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet controller");
    info!(
        controller_id = %config.controller_id,
        admin_url = %config.admin_url,
        hosts = config.hosts.len(),
        "Configuration loaded"
    );

    let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let routes = LinkRoutes::from_config(&config);
    let runtime = Arc::new(ControllerRuntime::start(config, routes));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = api::create_router(runtime.clone());

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "Status API listening");

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
                info!("Status API shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Status API exited normally"),
                Ok(Err(e)) => error!(error = %e, "Status API error"),
                Err(e) => error!(error = %e, "Status API task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    runtime.shutdown().await;

    info!("Fleet controller shutdown complete");
    Ok(())
}
