//! Local HTTP surface of the controller: health, link status, and the
//! manual restart of a link that gave up.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::runtime::{ControllerRuntime, ControllerStatus};

type AppState = Arc<ControllerRuntime>;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    pub admin_connected: bool,
    pub registered: bool,
}

pub fn create_router(runtime: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/status", get(status))
        .route("/v1/link/restart", post(restart))
        .layer(TraceLayer::new_for_http())
        .with_state(runtime)
}

async fn healthz(State(runtime): State<AppState>) -> Json<HealthResponse> {
    let status = runtime.status();
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "fleet-controller".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        admin_connected: status.connected,
        registered: status.registered,
    })
}

async fn status(State(runtime): State<AppState>) -> Json<ControllerStatus> {
    Json(runtime.status())
}

/// Connecting may take several failover rounds, so it runs in the
/// background.
async fn restart(State(runtime): State<AppState>) -> StatusCode {
    tokio::spawn(async move {
        match runtime.restart().await {
            Ok(mode) => info!(mode = %mode, "Admin link restarted"),
            Err(e) => warn!(error = %e, "Admin link restart failed"),
        }
    });
    StatusCode::ACCEPTED
}
