//! Wiring of the controller's links and background tasks.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::{ControllerId, HostId, PeerId, SiteId};
use fleet_link::{
    CircuitState, ConnectionMode, ConnectionState, FailoverCoordinator, LinkError,
    MonotonicClock, Transport, TransportRoute, WebSocketTransport,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::fleet_state::FleetState;
use crate::hosts::HostFleet;
use crate::poll::PollTransport;
use crate::session::AdminSession;

/// Transports the runtime dials.
pub struct LinkRoutes {
    /// Streaming route to the admin.
    pub primary: TransportRoute,
    /// Polling route to the admin.
    pub fallback: TransportRoute,
    /// Transport for host agents; addresses come from the host list.
    pub hosts: Arc<dyn Transport>,
}

impl LinkRoutes {
    /// WebSocket to the admin and hosts, HTTP polling as the fallback.
    pub fn from_config(config: &Config) -> Self {
        let ws: Arc<dyn Transport> = Arc::new(WebSocketTransport::new());
        let poll = PollTransport::new(config.controller_id, config.poll_interval);
        Self {
            primary: TransportRoute::new(ws.clone(), config.stream_url()),
            fallback: TransportRoute::new(Arc::new(poll), config.poll_url()),
            hosts: ws,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostView {
    pub host_id: HostId,
    pub address: String,
    pub state: ConnectionState,
    pub breaker: CircuitState,
    pub failure_count: u32,
    pub reconnect_attempts: u32,
    pub last_report_at: Option<DateTime<Utc>>,
}

/// Side-effect free snapshot of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub controller_id: ControllerId,
    pub mode: ConnectionMode,
    pub connected: bool,
    pub registered: bool,
    pub rounds: u32,
    pub primary_failed: bool,
    pub fallback_failed: bool,
    pub gave_up: bool,
    pub site_id: Option<SiteId>,
    pub last_error: Option<String>,
    pub hosts: Vec<HostView>,
    pub dashboards: usize,
    pub cookie_domains: usize,
}

/// Owns every link and task of one controller process.
pub struct ControllerRuntime {
    config: Config,
    link: Arc<FailoverCoordinator>,
    session: AdminSession,
    hosts: HostFleet,
    fleet: FleetState,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ControllerRuntime {
    /// Start the controller over the given transports. Must be called
    /// within a Tokio runtime; connecting happens in the background.
    pub fn start(config: Config, routes: LinkRoutes) -> Self {
        let clock = Arc::new(MonotonicClock::new());
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();

        let hosts = HostFleet::new(
            config.host_supervisor(),
            routes.hosts,
            &config.hosts,
            clock.clone(),
            forward_tx,
        );
        let link = Arc::new(FailoverCoordinator::new(
            PeerId::Admin,
            config.failover(),
            config.admin_supervisor(),
            routes.primary,
            routes.fallback,
        ));
        let fleet = FleetState::new();
        let session = AdminSession::new(
            config.clone(),
            link.clone(),
            hosts.clone(),
            fleet.clone(),
            clock,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![
            session.spawn(forward_rx, shutdown_rx.clone()),
            hosts.spawn(shutdown_rx.clone()),
            hosts.supervisor().spawn_liveness_sweep(shutdown_rx.clone()),
        ];
        tasks.extend(link.spawn_liveness_sweeps(shutdown_rx));

        hosts.connect_all();
        let runtime = Self {
            config,
            link,
            session,
            hosts,
            fleet,
            shutdown,
            tasks: Mutex::new(tasks),
        };
        runtime.spawn_connect();

        info!(
            controller_id = %runtime.config.controller_id,
            hosts = runtime.config.hosts.len(),
            stream_enabled = runtime.config.stream_enabled,
            "Controller started"
        );
        runtime
    }

    fn spawn_connect(&self) {
        let link = self.link.clone();
        let handle = tokio::spawn(async move {
            match link.connect().await {
                Ok(mode) => info!(mode = %mode, "Admin link established"),
                Err(e) => warn!(error = %e, "Admin link not established"),
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    pub fn controller_id(&self) -> ControllerId {
        self.config.controller_id
    }

    pub fn session(&self) -> &AdminSession {
        &self.session
    }

    pub fn hosts(&self) -> &HostFleet {
        &self.hosts
    }

    pub fn fleet_state(&self) -> &FleetState {
        &self.fleet
    }

    /// Clear failover state, including a give-up, and connect again.
    pub async fn restart(&self) -> Result<ConnectionMode, LinkError> {
        info!("Restarting admin link");
        self.link.restart().await
    }

    pub fn status(&self) -> ControllerStatus {
        let link = self.link.status();
        let supervisor = self.hosts.supervisor();
        let hosts = self
            .hosts
            .host_ids()
            .iter()
            .filter_map(|host_id| {
                let status = supervisor.status(PeerId::Host(*host_id))?;
                Some(HostView {
                    host_id: *host_id,
                    address: status.identity.address,
                    state: status.state,
                    breaker: status.breaker.state,
                    failure_count: status.breaker.failure_count,
                    reconnect_attempts: status.reconnect_attempts,
                    last_report_at: self
                        .hosts
                        .cache()
                        .get(*host_id)
                        .and_then(|state| state.updated_at),
                })
            })
            .collect();

        ControllerStatus {
            controller_id: self.config.controller_id,
            mode: link.mode,
            connected: link.connected,
            registered: link.registered,
            rounds: link.rounds,
            primary_failed: link.primary_failed,
            fallback_failed: link.fallback_failed,
            gave_up: link.gave_up,
            site_id: self.session.assigned_site_id(),
            last_error: self.session.last_error(),
            hosts,
            dashboards: self.fleet.dashboards().len(),
            cookie_domains: self.fleet.cookie_domains().len(),
        }
    }

    /// Stop every task and close every link.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.link.shutdown();
        self.hosts.supervisor().shutdown();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let shutdown_timeout = Duration::from_secs(10);
        for task in tasks {
            if tokio::time::timeout(shutdown_timeout, task).await.is_err() {
                warn!("Controller task did not shut down in time");
            }
        }
        info!(controller_id = %self.config.controller_id, "Controller stopped");
    }
}
