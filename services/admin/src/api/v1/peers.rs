//! Peer endpoints.
//!
//! Read-only connectivity views of connected controllers, plus direct
//! command execution through the dispatcher. Reading a view never opens
//! a connection or moves a breaker.

use std::time::Duration;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use fleet_id::{ControllerId, HostId, PeerId};
use fleet_link::{CircuitState, ConnectionState, PeerStatus};
use fleet_proto::{Command, CommandResponse};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

use crate::api::error::AdminApiError;
use crate::nodes::NodeRecord;
use crate::pending::PendingSyncFlag;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_peers))
        .route("/{controller_id}", get(get_peer))
        .route("/{controller_id}/commands", post(execute_command))
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct BreakerView {
    pub state: CircuitState,
    pub failure_count: u32,
    /// Milliseconds until an open circuit admits a trial attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct PeerView {
    pub peer_id: PeerId,
    /// Transport the current link arrived on: "websocket" or "poll".
    pub transport: String,
    pub state: ConnectionState,
    pub registered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_for_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub silent_for_ms: Option<u64>,
    pub reconnect_attempts: u32,
    pub breaker: BreakerView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_sync: Option<PendingSyncFlag>,
}

#[derive(Debug, Serialize)]
pub struct ListPeersResponse {
    pub peers: Vec<PeerView>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteCommandRequest {
    pub command: Command,
    /// Host behind the controller that should run the command. The
    /// controller itself handles it when absent.
    #[serde(default)]
    pub host_id: Option<HostId>,
    /// Overrides the admin's default command timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn list_peers(
    State(state): State<AppState>,
) -> Result<Json<ListPeersResponse>, AdminApiError> {
    let mut flags = state.broadcaster().store().flags().await?;
    let now = Instant::now();

    let mut peers: Vec<PeerView> = state
        .supervisor()
        .peers()
        .into_iter()
        .filter_map(|status| {
            let controller_id = status.identity.id.as_controller()?;
            let node = state.nodes().get(controller_id);
            Some(view(status, node, flags.remove(&controller_id), now))
        })
        .collect();
    peers.sort_by_key(|p| p.peer_id);

    Ok(Json(ListPeersResponse { peers }))
}

async fn get_peer(
    State(state): State<AppState>,
    Path(controller_id): Path<String>,
) -> Result<Json<PeerView>, AdminApiError> {
    let controller_id = parse_controller_id(&controller_id)?;
    let status = state
        .supervisor()
        .status(PeerId::Controller(controller_id))
        .ok_or_else(|| unknown_peer(controller_id))?;
    let flag = state.broadcaster().store().flag(controller_id).await?;

    Ok(Json(view(
        status,
        state.nodes().get(controller_id),
        flag,
        Instant::now(),
    )))
}

async fn execute_command(
    State(state): State<AppState>,
    Path(controller_id): Path<String>,
    Json(request): Json<ExecuteCommandRequest>,
) -> Result<Json<CommandResponse>, AdminApiError> {
    let controller_id = parse_controller_id(&controller_id)?;
    let peer = PeerId::Controller(controller_id);
    if state.supervisor().identity(peer).is_none() {
        return Err(unknown_peer(controller_id));
    }

    let target = request.host_id.map_or(peer, PeerId::Host);
    let command_type = request.command.command_type();
    info!(controller_id = %controller_id, target = %target, command_type, "Executing command");

    let timeout = request.timeout_ms.map(Duration::from_millis);
    let response = state
        .dispatcher()
        .execute_for(peer, target, request.command, timeout)
        .await?;
    Ok(Json(response))
}

// =============================================================================
// Helpers
// =============================================================================

fn parse_controller_id(raw: &str) -> Result<ControllerId, AdminApiError> {
    raw.parse().map_err(|_| {
        AdminApiError::bad_request("invalid_controller_id", format!("invalid controller id: {raw}"))
    })
}

fn unknown_peer(controller_id: ControllerId) -> AdminApiError {
    AdminApiError::not_found(
        "peer_not_found",
        format!("controller {controller_id} has never connected"),
    )
}

fn view(
    status: PeerStatus,
    node: Option<NodeRecord>,
    pending_sync: Option<PendingSyncFlag>,
    now: Instant,
) -> PeerView {
    let elapsed_ms = |at: Instant| now.saturating_duration_since(at).as_millis() as u64;
    PeerView {
        peer_id: status.identity.id,
        transport: status.identity.address,
        state: status.state,
        registered: status.registered,
        connected_for_ms: status.connected_at.map(elapsed_ms),
        silent_for_ms: status.last_heartbeat_at.map(elapsed_ms),
        reconnect_attempts: status.reconnect_attempts,
        breaker: BreakerView {
            state: status.breaker.state,
            failure_count: status.breaker.failure_count,
            retry_in_ms: status
                .breaker
                .retry_in(now)
                .map(|d| d.as_millis() as u64),
        },
        node,
        pending_sync,
    }
}
