//! Accepting side of the registration / heartbeat protocol.
//!
//! Frames from each controller are handled in arrival order by a worker
//! dedicated to that controller's current connection, so a slow handler for
//! one controller never holds up another. Replies and registration state are
//! bound to the connection a frame arrived on; a frame still queued from a
//! replaced connection cannot register or answer on its successor.
//!
//! - REGISTRATION creates or updates the node record, binds a site, and is
//!   answered with accept or reject. Acceptance starts a new sync session
//!   for the controller and triggers any pending catch-up sync.
//! - STATUS_UPDATE is acknowledged and refreshes liveness. Before
//!   registration it is answered with `NOT_REGISTERED` and ignored.
//! - Sync messages go through the ordering engine and are answered with a
//!   sync acknowledgement.

use std::collections::HashMap;

use async_trait::async_trait;
use fleet_id::{ControllerId, PeerId};
use fleet_link::{LinkError, LinkEvent};
use fleet_proto::{
    ErrorCode, ErrorResponse, Frame, HostStateReport, RegistrationRequest, RegistrationResponse,
    StatusAck, StatusUpdate, SyncAckStatus,
};
use fleet_sync::{SyncError, SyncHandler, SyncMessage};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::nodes::NodeStore;
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to reply: {0}")]
    Link(#[from] LinkError),

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("{0} sent {1} before registering")]
    NotRegistered(PeerId, &'static str),

    #[error("invalid message: {0}")]
    Invalid(String),

    #[error("sync message rejected: {0}")]
    Sync(#[from] SyncError),
}

/// Start handling inbound frames on the admin's supervisor.
pub fn spawn(state: AppState, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let mut events = state.supervisor().subscribe();

    tokio::spawn(async move {
        let mut workers: HashMap<PeerId, Worker> = HashMap::new();

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    route(&state, &mut workers, event);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Protocol handler stopping");
                        break;
                    }
                }
            }
        }
    })
}

/// Frame queue of one controller connection.
struct Worker {
    session: u64,
    tx: mpsc::UnboundedSender<Frame>,
}

impl Worker {
    fn spawn(state: &AppState, peer: PeerId, session: u64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(peer_worker(state.clone(), peer, session, rx));
        Self { session, tx }
    }
}

fn route(state: &AppState, workers: &mut HashMap<PeerId, Worker>, event: LinkEvent) {
    match event {
        LinkEvent::Connected { peer, session } => {
            info!(peer = %peer, session, "Controller link up");
        }
        LinkEvent::Disconnected {
            peer,
            session,
            reason,
        } => {
            info!(peer = %peer, session, reason = %reason, "Controller link down");
            // The worker drains what it already has, then exits.
            if workers.get(&peer).is_some_and(|w| w.session == session) {
                workers.remove(&peer);
            }
            if let Some(id) = peer.as_controller() {
                if !state.supervisor().is_connected(peer) {
                    state.nodes().mark_offline(id);
                }
            }
        }
        LinkEvent::Frame {
            peer,
            session,
            frame,
        } => {
            let current = workers.get(&peer).map(|w| w.session);
            if current.is_some_and(|current| session < current) {
                debug!(
                    peer = %peer,
                    session,
                    kind = frame.kind(),
                    "Dropping frame from replaced link"
                );
                return;
            }
            let reusable = workers
                .get(&peer)
                .is_some_and(|w| w.session == session && !w.tx.is_closed());
            if !reusable {
                workers.insert(peer, Worker::spawn(state, peer, session));
            }
            if let Some(worker) = workers.get(&peer) {
                let _ = worker.tx.send(frame);
            }
        }
        _ => {}
    }
}

async fn peer_worker(
    state: AppState,
    peer: PeerId,
    session: u64,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = frames.recv().await {
        let kind = frame.kind();
        match handle_frame(&state, peer, session, frame).await {
            Ok(()) => {}
            Err(ProtocolError::Link(e)) => {
                debug!(peer = %peer, kind, error = %e, "Reply not delivered");
            }
            Err(e @ ProtocolError::Rejected(_)) => {
                warn!(peer = %peer, error = %e, "Registration rejected");
            }
            Err(e) => {
                warn!(peer = %peer, kind, error = %e, "Frame rejected");
            }
        }
    }
}

/// Handle one application frame that arrived from `peer` on connection
/// `session`.
pub async fn handle_frame(
    state: &AppState,
    peer: PeerId,
    session: u64,
    frame: Frame,
) -> Result<(), ProtocolError> {
    let link = Link {
        state,
        peer,
        session,
    };
    match frame {
        Frame::Register(request) => handle_registration(&link, request).await,
        Frame::Status(update) => handle_status(&link, update).await,
        Frame::Sync(message) => handle_sync(&link, message).await,
        // Correlated by the dispatcher.
        Frame::CommandResult(_) => Ok(()),
        Frame::Command(envelope) => {
            let response = ErrorResponse::new(
                ErrorCode::UnknownCommand,
                format!("admin does not execute {}", envelope.command.command_type()),
            );
            link.reply(Frame::Error(response)).await?;
            Err(ProtocolError::Invalid(format!(
                "unexpected {} command",
                envelope.command.command_type()
            )))
        }
        Frame::Error(response) => {
            warn!(
                peer = %peer,
                error_code = %response.error_code,
                error_message = %response.error_message,
                "Controller reported an error"
            );
            Ok(())
        }
        other => {
            debug!(peer = %peer, kind = other.kind(), "Ignoring unexpected frame");
            Ok(())
        }
    }
}

/// The connection a frame arrived on.
struct Link<'a> {
    state: &'a AppState,
    peer: PeerId,
    session: u64,
}

impl Link<'_> {
    async fn reply(&self, frame: Frame) -> Result<(), LinkError> {
        self.state
            .supervisor()
            .send_on(self.peer, self.session, frame)
            .await
    }

    fn is_registered(&self) -> bool {
        self.state
            .supervisor()
            .is_registered_on(self.peer, self.session)
    }

    fn mark_registered(&self, registered: bool) -> bool {
        self.state
            .supervisor()
            .mark_registered_on(self.peer, self.session, registered)
    }
}

async fn handle_registration(
    link: &Link<'_>,
    request: RegistrationRequest,
) -> Result<(), ProtocolError> {
    let Link { state, peer, .. } = *link;

    if let Err(reason) = check_registration(peer, &request) {
        link.mark_registered(false);
        let response = RegistrationResponse::rejected(reason.clone(), false);
        link.reply(Frame::RegisterAck(response)).await?;
        return Err(ProtocolError::Rejected(reason));
    }

    if !link.mark_registered(true) {
        // The connection closed or was replaced before its request was handled.
        return Err(LinkError::NotConnected(peer).into());
    }

    let controller_id = request.controller_id;
    let registered = state
        .nodes()
        .register(&request, state.config().default_site_id);
    state.engine().reset_source(peer);

    info!(
        controller_id = %controller_id,
        hostname = %request.hostname,
        version = %request.version,
        site_id = ?registered.site_id,
        created = registered.created,
        "Controller registered"
    );

    link.reply(Frame::RegisterAck(RegistrationResponse::accepted(
        controller_id,
        registered.site_id,
    )))
    .await?;

    let broadcaster = state.broadcaster().clone();
    tokio::spawn(async move {
        match broadcaster.catch_up(controller_id).await {
            Ok(kinds) if !kinds.is_empty() => {
                info!(controller_id = %controller_id, kinds = ?kinds, "Catch-up sync delivered");
            }
            Ok(_) => {}
            Err(e) => {
                error!(controller_id = %controller_id, error = %e, "Catch-up sync failed");
            }
        }
    });

    Ok(())
}

fn check_registration(peer: PeerId, request: &RegistrationRequest) -> Result<(), String> {
    if peer.as_controller() != Some(request.controller_id) {
        return Err(format!(
            "controller id {} does not match link identity {peer}",
            request.controller_id
        ));
    }
    request.validate().map_err(|e| e.to_string())
}

async fn handle_status(link: &Link<'_>, update: StatusUpdate) -> Result<(), ProtocolError> {
    let Link { state, peer, .. } = *link;

    if !link.is_registered() {
        link.reply(Frame::Error(ErrorResponse::not_registered())).await?;
        return Err(ProtocolError::NotRegistered(peer, "STATUS_UPDATE"));
    }

    if peer.as_controller() != Some(update.controller_id) {
        let message = format!("status for {} on link {peer}", update.controller_id);
        link.reply(Frame::Error(ErrorResponse::new(
            ErrorCode::InvalidMessage,
            message.clone(),
        )))
        .await?;
        return Err(ProtocolError::Invalid(message));
    }

    state.nodes().apply_status(&update);
    state.supervisor().touch(peer);
    debug!(
        peer = %peer,
        status = ?update.status,
        cpu = update.metrics.cpu_percent,
        "Status update"
    );

    link.reply(Frame::StatusAck(StatusAck::now())).await?;
    Ok(())
}

async fn handle_sync(link: &Link<'_>, message: SyncMessage) -> Result<(), ProtocolError> {
    let Link { state, peer, .. } = *link;
    let message_id = message.id;

    if !link.is_registered() {
        let response = ErrorResponse::new(
            ErrorCode::NotRegistered,
            "sync message received before registration",
        )
        .retryable();
        link.reply(Frame::Error(response)).await?;
        return Err(ProtocolError::NotRegistered(peer, "SYNC"));
    }

    if message.source != peer {
        link.reply(Frame::SyncAck {
            message_id,
            status: SyncAckStatus::Rejected,
        })
        .await?;
        return Err(ProtocolError::Invalid(format!(
            "sync source {} on link {peer}",
            message.source
        )));
    }

    match state.engine().process(message).await {
        Ok(outcome) => {
            link.reply(Frame::SyncAck {
                message_id,
                status: SyncAckStatus::from(&outcome),
            })
            .await?;
            Ok(())
        }
        Err(e) => {
            link.reply(Frame::SyncAck {
                message_id,
                status: SyncAckStatus::Rejected,
            })
            .await?;
            Err(e.into())
        }
    }
}

// =============================================================================
// Sync handlers
// =============================================================================

/// Records host state forwarded by controllers on their node record.
pub struct HostStateRecorder {
    nodes: NodeStore,
}

impl HostStateRecorder {
    pub fn new(nodes: NodeStore) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl SyncHandler for HostStateRecorder {
    async fn handle(
        &self,
        message: &SyncMessage,
        payload: &serde_json::Value,
    ) -> Result<(), SyncError> {
        let controller_id: ControllerId = message.source.as_controller().ok_or_else(|| {
            SyncError::Handler {
                message_type: message.message_type.to_string(),
                reason: format!("{} is not a controller", message.source),
            }
        })?;

        let report: HostStateReport = serde_json::from_value(payload.clone())
            .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;

        if !self.nodes.record_host_state(
            controller_id,
            PeerId::Host(report.host_id),
            message.message_type,
            report.state,
        ) {
            return Err(SyncError::Handler {
                message_type: message.message_type.to_string(),
                reason: format!("unknown controller {controller_id}"),
            });
        }
        Ok(())
    }
}
