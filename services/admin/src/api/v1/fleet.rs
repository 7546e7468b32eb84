//! Fleet-wide sync endpoints.
//!
//! A broadcast is delivered to every registered controller and flagged for
//! catch-up on the rest. The response reports which controllers fall in
//! which group.

use std::collections::BTreeMap;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use fleet_id::ControllerId;
use fleet_proto::{CookieDomain, Dashboard, SyncType};
use serde::{Deserialize, Serialize};

use crate::api::error::AdminApiError;
use crate::broadcaster::BroadcastReport;
use crate::pending::PendingSyncFlag;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/dashboards", post(broadcast_dashboards))
        .route("/cookies", post(broadcast_cookies))
        .route("/pending", get(list_pending))
}

fn default_sync_type() -> SyncType {
    SyncType::Full
}

#[derive(Debug, Deserialize)]
pub struct DashboardSyncRequest {
    pub dashboards: Vec<Dashboard>,
    #[serde(default = "default_sync_type")]
    pub sync_type: SyncType,
}

#[derive(Debug, Deserialize)]
pub struct CookieSyncRequest {
    pub cookie_domains: Vec<CookieDomain>,
    #[serde(default = "default_sync_type")]
    pub sync_type: SyncType,
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub pending: BTreeMap<ControllerId, PendingSyncFlag>,
}

async fn broadcast_dashboards(
    State(state): State<AppState>,
    Json(request): Json<DashboardSyncRequest>,
) -> Result<Json<BroadcastReport>, AdminApiError> {
    let report = state
        .broadcaster()
        .broadcast_dashboards(request.dashboards, request.sync_type)
        .await?;
    Ok(Json(report))
}

async fn broadcast_cookies(
    State(state): State<AppState>,
    Json(request): Json<CookieSyncRequest>,
) -> Result<Json<BroadcastReport>, AdminApiError> {
    let report = state
        .broadcaster()
        .broadcast_cookies(request.cookie_domains, request.sync_type)
        .await?;
    Ok(Json(report))
}

async fn list_pending(
    State(state): State<AppState>,
) -> Result<Json<PendingResponse>, AdminApiError> {
    let pending = state.broadcaster().store().flags().await?;
    Ok(Json(PendingResponse { pending }))
}
