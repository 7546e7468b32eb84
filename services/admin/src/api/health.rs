//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: always "ok" while the process serves requests.
    pub status: String,
    pub service: String,
    pub version: String,
    /// Current timestamp (RFC 3339).
    pub timestamp: String,
    /// Controllers with a live link.
    pub connected_controllers: usize,
    /// Controllers currently using the polling fallback.
    pub poll_sessions: usize,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/livez", get(livez))
}

/// Is the service running? Reports link counts but never fails on them.
async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let connected_controllers = state
        .supervisor()
        .connected_peers()
        .iter()
        .filter(|peer| peer.as_controller().is_some())
        .count();

    Json(HealthResponse {
        status: "ok".to_string(),
        service: "fleet-admin".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        connected_controllers,
        poll_sessions: state.polls().len(),
    })
}

/// Minimal liveness check.
async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
