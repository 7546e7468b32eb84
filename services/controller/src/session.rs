//! The controller's side of the admin link.
//!
//! Registers on every new connection, reports status on a fixed interval
//! once registered, executes or relays commands from the admin, and
//! forwards applied host state upward as sequenced sync messages.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use fleet_id::{PeerId, SiteId};
use fleet_link::{
    ConnectionMode, CoordinatorEvent, DispatchError, FailoverCoordinator, LinkEvent,
    MonotonicClock,
};
use fleet_proto::{
    CommandEnvelope, CommandResponse, ErrorCode, Frame, NodeStatus, RegistrationRequest,
    RegistrationResponse, StatusUpdate, SyncAckStatus,
};
use fleet_sync::{Priority, SyncEmitter};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::fleet_state::FleetState;
use crate::hosts::{ForwardedState, HostFleet};
use crate::resources;

/// Pause before registering again after a rejection that suggested retry.
const REGISTER_RETRY_DELAY: Duration = Duration::from_secs(5);

const MDNS_SERVICE: &str = "_fleet-controller._tcp.local";

#[derive(Debug, Default)]
struct RegistrationState {
    /// Set by a rejection without retry; cleared by the next connection.
    blocked: bool,
    site_id: Option<SiteId>,
    last_error: Option<String>,
}

/// Drives the admin protocol over a [`FailoverCoordinator`].
#[derive(Clone)]
pub struct AdminSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: Config,
    link: Arc<FailoverCoordinator>,
    hosts: HostFleet,
    fleet: FleetState,
    emitter: SyncEmitter,
    clock: Arc<MonotonicClock>,
    state: Mutex<RegistrationState>,
}

impl AdminSession {
    pub fn new(
        config: Config,
        link: Arc<FailoverCoordinator>,
        hosts: HostFleet,
        fleet: FleetState,
        clock: Arc<MonotonicClock>,
    ) -> Self {
        let emitter = SyncEmitter::new(PeerId::Controller(config.controller_id));
        Self {
            inner: Arc::new(SessionInner {
                config,
                link,
                hosts,
                fleet,
                emitter,
                clock,
                state: Mutex::new(RegistrationState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistrationState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn self_peer(&self) -> PeerId {
        PeerId::Controller(self.inner.config.controller_id)
    }

    pub fn link(&self) -> &FailoverCoordinator {
        &self.inner.link
    }

    /// Site the admin bound this controller to at the last registration.
    pub fn assigned_site_id(&self) -> Option<SiteId> {
        self.state().site_id
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    fn set_last_error(&self, error: impl Into<String>) {
        self.state().last_error = Some(error.into());
    }

    /// Run the protocol until shutdown. Subscribes before returning, so the
    /// link may be connected right after this call.
    pub fn spawn(
        &self,
        mut forwarded: mpsc::UnboundedReceiver<ForwardedState>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut events = self.inner.link.subscribe();
        let session = self.clone();

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(session.inner.config.heartbeat_interval);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; registration sends the
            // first status instead.
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        session.on_event(event).await;
                    }
                    _ = heartbeat.tick() => {
                        if session.inner.link.registered() {
                            session.send_status().await;
                        }
                    }
                    Some(state) = forwarded.recv() => session.forward(state).await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Admin session stopped");
        })
    }

    async fn on_event(&self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::ModeChanged { mode: ConnectionMode::None } => {
                info!("Admin link down");
            }
            CoordinatorEvent::ModeChanged { mode } => {
                info!(mode = %mode, "Admin link up, registering");
                self.state().blocked = false;
                self.register().await;
            }
            CoordinatorEvent::ConnectionFailed { round, retry_in } => {
                self.set_last_error(format!("admin unreachable after round {round}"));
                match retry_in {
                    Some(delay) => warn!(
                        round,
                        retry_in_ms = delay.as_millis() as u64,
                        "Admin unreachable on every transport"
                    ),
                    None => error!(round, "Admin unreachable, waiting for restart"),
                }
            }
            CoordinatorEvent::Link {
                mode,
                event: LinkEvent::Frame { frame, .. },
            } if mode == self.inner.link.mode() => self.on_frame(frame).await,
            CoordinatorEvent::Link {
                event: LinkEvent::ConnectFailed { error, .. },
                ..
            } => self.set_last_error(error),
            _ => {}
        }
    }

    async fn on_frame(&self, frame: Frame) {
        match frame {
            Frame::RegisterAck(response) => self.on_register_ack(response).await,
            Frame::StatusAck(ack) => {
                debug!(server_time = %ack.server_time, "Status acknowledged");
            }
            Frame::Command(envelope) => {
                let session = self.clone();
                tokio::spawn(async move {
                    let response = session.handle_command(envelope).await;
                    if let Err(e) = session.inner.link.send(Frame::CommandResult(response)).await {
                        warn!(error = %e, "Command result not delivered");
                    }
                });
            }
            Frame::SyncAck {
                message_id,
                status: SyncAckStatus::Rejected,
            } => warn!(message_id = %message_id, "Admin rejected forwarded state"),
            Frame::SyncAck { message_id, status } => {
                debug!(message_id = %message_id, status = ?status, "Sync acknowledged");
            }
            Frame::Error(response) if response.error_code == ErrorCode::NotRegistered => {
                warn!(error_message = %response.error_message, "Admin lost our registration");
                self.inner.link.mark_registered(false);
                if !self.state().blocked {
                    self.register().await;
                }
            }
            Frame::Error(response) => {
                warn!(
                    error_code = %response.error_code,
                    error_message = %response.error_message,
                    "Admin reported an error"
                );
                self.set_last_error(response.error_message);
            }
            other => debug!(kind = other.kind(), "Ignoring admin frame"),
        }
    }

    pub fn registration_request(&self) -> RegistrationRequest {
        let config = &self.inner.config;
        RegistrationRequest {
            controller_id: config.controller_id,
            hostname: config.hostname.clone(),
            mac_address: String::new(),
            local_network: config.web_admin_url(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            location: config.location.clone(),
            site_id: config.site_id,
            mdns_service: MDNS_SERVICE.to_string(),
            web_admin_url: config.web_admin_url(),
            system_info: resources::system_info(),
            capabilities: vec![
                "dashboard_sync".to_string(),
                "cookie_sync".to_string(),
                "host_relay".to_string(),
            ],
            timestamp: self.inner.clock.now_millis(),
        }
    }

    async fn register(&self) {
        let request = self.registration_request();
        if let Err(e) = self.inner.link.send(Frame::Register(request)).await {
            // The coordinator recovers the link and registration runs again.
            warn!(error = %e, "Registration not sent");
        }
    }

    async fn on_register_ack(&self, response: RegistrationResponse) {
        if response.success {
            self.inner.link.mark_registered(true);
            // The admin restarts its view of our sequence on registration.
            self.inner.emitter.reset();
            self.state().site_id = response.assigned_site_id;
            info!(site_id = ?response.assigned_site_id, "Registered with admin");
            self.send_status().await;
            self.replay_host_state().await;
            return;
        }

        let reason = response.message.unwrap_or_default();
        self.set_last_error(format!("registration rejected: {reason}"));
        if !response.retry_suggested {
            error!(reason = %reason, "Registration rejected, not retrying on this connection");
            self.state().blocked = true;
            return;
        }

        warn!(
            reason = %reason,
            retry_in_ms = REGISTER_RETRY_DELAY.as_millis() as u64,
            "Registration rejected, retrying"
        );
        let session = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REGISTER_RETRY_DELAY).await;
            let link = &session.inner.link;
            if link.connected() && !link.registered() && !session.state().blocked {
                session.register().await;
            }
        });
    }

    async fn send_status(&self) {
        let mut metrics = resources::sample_metrics();
        metrics.connected_hosts = self.inner.hosts.connected_count() as u32;
        metrics.total_hosts = self.inner.hosts.host_ids().len() as u32;

        let update = StatusUpdate {
            controller_id: self.inner.config.controller_id,
            timestamp: self.inner.clock.now_millis(),
            status: NodeStatus::Online,
            metrics,
            services: Vec::new(),
            last_error: self.last_error(),
        };
        if let Err(e) = self.inner.link.send(Frame::Status(update)).await {
            debug!(error = %e, "Status not sent");
        }
    }

    /// Execute a command addressed to this controller, or relay it to the
    /// host it targets. Always produces a response for the admin.
    pub async fn handle_command(&self, envelope: CommandEnvelope) -> CommandResponse {
        let CommandEnvelope {
            command_id,
            target,
            command,
            ..
        } = envelope;
        let command_type = command.command_type();
        debug!(command_id = %command_id, target = %target, command_type, "Command received");

        let response = match target {
            target if target == self.self_peer() => match self.inner.fleet.apply(&command) {
                Some(applied) => CommandResponse::ok(
                    command_id,
                    serde_json::to_value(&applied).ok(),
                    self.inner.clock.now_millis(),
                ),
                None => CommandResponse::failed(
                    command_id,
                    format!("{command_type} must target a host"),
                    self.inner.clock.now_millis(),
                ),
            },
            PeerId::Host(host_id) if self.inner.hosts.host_ids().contains(&host_id) => {
                let result = self
                    .inner
                    .hosts
                    .dispatcher()
                    .execute(target, command, None)
                    .await;
                let now = self.inner.clock.now_millis();
                match result {
                    // Answer under the admin's correlation id.
                    Ok(response) => CommandResponse {
                        command_id,
                        timestamp: now,
                        ..response
                    },
                    Err(DispatchError::Failed { message, .. }) => {
                        CommandResponse::failed(command_id, message, now)
                    }
                    Err(e) => CommandResponse::failed(command_id, e.to_string(), now),
                }
            }
            other => CommandResponse::failed(
                command_id,
                format!("{other} is not reachable through this controller"),
                self.inner.clock.now_millis(),
            ),
        };

        if !response.success {
            warn!(
                command_id = %command_id,
                command_type,
                error = ?response.error_message,
                "Command failed"
            );
        }
        response
    }

    async fn forward(&self, state: ForwardedState) {
        if !self.inner.link.registered() {
            // The cache keeps it; the next registration replays it.
            debug!(host_id = %state.report.host_id, "Holding host state until registered");
            return;
        }
        self.emit(state).await;
    }

    async fn emit(&self, state: ForwardedState) {
        let host_id = state.report.host_id;
        let message = serde_json::to_value(&state.report)
            .map_err(fleet_sync::SyncError::from)
            .and_then(|payload| {
                self.inner.emitter.emit(
                    state.message_type,
                    payload,
                    Some(PeerId::Admin),
                    Priority::Normal,
                )
            });
        match message {
            Ok(message) => {
                if let Err(e) = self.inner.link.send(Frame::Sync(message)).await {
                    debug!(host_id = %host_id, error = %e, "Host state not forwarded");
                }
            }
            Err(e) => warn!(host_id = %host_id, error = %e, "Failed to package host state"),
        }
    }

    /// Send the latest known state of every host.
    async fn replay_host_state(&self) {
        for host_id in self.inner.hosts.host_ids() {
            let Some(cached) = self.inner.hosts.cache().get(*host_id) else {
                continue;
            };
            let received_at = cached.updated_at.unwrap_or_else(chrono::Utc::now);
            for (message_type, state) in cached.state {
                self.emit(ForwardedState {
                    message_type,
                    report: fleet_proto::HostStateReport {
                        host_id: *host_id,
                        received_at,
                        state,
                    },
                })
                .await;
            }
        }
    }
}
