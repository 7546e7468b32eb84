//! Transport failover coordinator.
//!
//! Presents one logical link to a single upstream peer backed by two
//! supervisors: a primary (streaming) transport and a fallback (polling)
//! transport. Each transport is disabled after one observed failure per
//! session. When both are disabled the session ends, and a new one starts
//! after a growing delay, up to `max_rounds` times.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use fleet_id::PeerId;
use fleet_proto::Frame;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::Subscription;
use crate::{
    BackoffPolicy, ConnectionSupervisor, DisconnectReason, EventBus, LinkError, LinkEvent,
    PeerIdentity, PeerStatus, SupervisorConfig, Transport,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    #[default]
    None,
    Primary,
    Fallback,
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionMode::None => write!(f, "none"),
            ConnectionMode::Primary => write!(f, "primary"),
            ConnectionMode::Fallback => write!(f, "fallback"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Deadline for each transport's connect and handshake.
    pub primary_timeout: Duration,

    /// Pause before switching to the other transport.
    pub fallback_delay: Duration,

    /// Sessions to try before giving up until restarted.
    pub max_rounds: u32,

    /// Delay between sessions.
    pub round_backoff: BackoffPolicy,

    /// When false only the fallback transport is used.
    pub primary_enabled: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            primary_timeout: Duration::from_secs(10),
            fallback_delay: Duration::from_secs(2),
            max_rounds: 5,
            round_backoff: BackoffPolicy {
                base: Duration::from_secs(2),
                max: Duration::from_secs(60),
            },
            primary_enabled: true,
        }
    }
}

/// Events re-emitted by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// An event from one of the transports, labelled with its mode.
    Link {
        mode: ConnectionMode,
        event: LinkEvent,
    },
    ModeChanged {
        mode: ConnectionMode,
    },
    /// Both transports failed this session. `retry_in` is `None` once the
    /// coordinator has given up.
    ConnectionFailed {
        round: u32,
        retry_in: Option<Duration>,
    },
}

#[derive(Debug, Clone)]
pub struct FailoverStatus {
    pub mode: ConnectionMode,
    pub connected: bool,
    pub registered: bool,
    pub rounds: u32,
    pub primary_failed: bool,
    pub fallback_failed: bool,
    pub gave_up: bool,
    pub primary: Option<PeerStatus>,
    pub fallback: Option<PeerStatus>,
}

#[derive(Debug, Default)]
struct Session {
    mode: ConnectionMode,
    registered: bool,
    rounds: u32,
    primary_failed: bool,
    fallback_failed: bool,
    gave_up: bool,
    stopped: bool,
}

impl Session {
    fn failed(&self, mode: ConnectionMode) -> bool {
        match mode {
            ConnectionMode::Primary => self.primary_failed,
            ConnectionMode::Fallback => self.fallback_failed,
            ConnectionMode::None => true,
        }
    }

    fn mark_failed(&mut self, mode: ConnectionMode) {
        match mode {
            ConnectionMode::Primary => self.primary_failed = true,
            ConnectionMode::Fallback => self.fallback_failed = true,
            ConnectionMode::None => {}
        }
    }
}

struct CoordinatorInner {
    peer: PeerId,
    config: FailoverConfig,
    primary: ConnectionSupervisor,
    fallback: ConnectionSupervisor,
    session: Mutex<Session>,
    establish: tokio::sync::Mutex<()>,
    events: EventBus<CoordinatorEvent>,
}

/// One logical connection to `peer` over whichever transport works.
pub struct FailoverCoordinator {
    inner: Arc<CoordinatorInner>,
    pumps: Vec<JoinHandle<()>>,
}

/// A transport together with the address it should dial.
pub struct TransportRoute {
    pub transport: Arc<dyn Transport>,
    pub address: String,
}

impl TransportRoute {
    pub fn new(transport: Arc<dyn Transport>, address: impl Into<String>) -> Self {
        Self {
            transport,
            address: address.into(),
        }
    }
}

impl FailoverCoordinator {
    /// Must be called within a Tokio runtime. The supervisors are built
    /// with automatic reconnection disabled; the coordinator owns recovery.
    pub fn new(
        peer: PeerId,
        config: FailoverConfig,
        supervisor: SupervisorConfig,
        primary: TransportRoute,
        fallback: TransportRoute,
    ) -> Self {
        let supervisor = SupervisorConfig {
            handshake_timeout: config.primary_timeout,
            auto_reconnect: false,
            ..supervisor
        };

        let primary_sup = ConnectionSupervisor::new(supervisor.clone(), primary.transport);
        primary_sup.add_peer(PeerIdentity::new(peer, primary.address));
        let fallback_sup = ConnectionSupervisor::new(supervisor, fallback.transport);
        fallback_sup.add_peer(PeerIdentity::new(peer, fallback.address));

        let session = Session {
            primary_failed: !config.primary_enabled,
            ..Session::default()
        };

        let inner = Arc::new(CoordinatorInner {
            peer,
            config,
            primary: primary_sup,
            fallback: fallback_sup,
            session: Mutex::new(session),
            establish: tokio::sync::Mutex::new(()),
            events: EventBus::new(),
        });

        let pumps = [ConnectionMode::Primary, ConnectionMode::Fallback]
            .into_iter()
            .map(|mode| {
                let events = inner.supervisor(mode).subscribe();
                tokio::spawn(pump(Arc::downgrade(&inner), mode, events))
            })
            .collect();

        Self { inner, pumps }
    }

    pub fn peer(&self) -> PeerId {
        self.inner.peer
    }

    pub fn subscribe(&self) -> Subscription<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    /// Establish the link, trying primary first. Returns once a transport
    /// is connected or every round has failed.
    pub async fn connect(&self) -> Result<ConnectionMode, LinkError> {
        self.inner.establish().await
    }

    /// Forget every failure and give up state, then connect again.
    pub async fn restart(&self) -> Result<ConnectionMode, LinkError> {
        {
            let mut session = self.inner.session();
            *session = Session {
                primary_failed: !self.inner.config.primary_enabled,
                ..Session::default()
            };
        }
        self.inner.primary.disconnect(self.inner.peer, DisconnectReason::Manual);
        self.inner.fallback.disconnect(self.inner.peer, DisconnectReason::Manual);
        self.inner.events.publish(CoordinatorEvent::ModeChanged {
            mode: ConnectionMode::None,
        });
        self.inner.establish().await
    }

    pub fn mode(&self) -> ConnectionMode {
        self.inner.session().mode
    }

    pub fn connected(&self) -> bool {
        let mode = self.mode();
        mode != ConnectionMode::None && self.inner.supervisor(mode).is_connected(self.inner.peer)
    }

    pub fn registered(&self) -> bool {
        self.connected() && self.inner.session().registered
    }

    pub fn mark_registered(&self, registered: bool) {
        let mode = {
            let mut session = self.inner.session();
            session.registered = registered;
            session.mode
        };
        if mode != ConnectionMode::None {
            self.inner
                .supervisor(mode)
                .mark_registered(self.inner.peer, registered);
        }
    }

    /// Send over the active transport.
    pub async fn send(&self, frame: Frame) -> Result<(), LinkError> {
        let mode = self.mode();
        if mode == ConnectionMode::None {
            return Err(LinkError::NotConnected(self.inner.peer));
        }
        self.inner.supervisor(mode).send(self.inner.peer, frame).await
    }

    pub fn supervisor(&self, mode: ConnectionMode) -> Option<&ConnectionSupervisor> {
        match mode {
            ConnectionMode::None => None,
            mode => Some(self.inner.supervisor(mode)),
        }
    }

    /// Liveness sweeps for both transports.
    pub fn spawn_liveness_sweeps(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.inner.primary.spawn_liveness_sweep(shutdown.clone()),
            self.inner.fallback.spawn_liveness_sweep(shutdown),
        ]
    }

    pub fn status(&self) -> FailoverStatus {
        let session = self.inner.session();
        let mode = session.mode;
        FailoverStatus {
            mode,
            connected: mode != ConnectionMode::None
                && self.inner.supervisor(mode).is_connected(self.inner.peer),
            registered: session.registered,
            rounds: session.rounds,
            primary_failed: session.primary_failed,
            fallback_failed: session.fallback_failed,
            gave_up: session.gave_up,
            primary: self.inner.primary.status(self.inner.peer),
            fallback: self.inner.fallback.status(self.inner.peer),
        }
    }

    /// Close both transports and stop recovering.
    pub fn shutdown(&self) {
        {
            let mut session = self.inner.session();
            session.stopped = true;
            session.mode = ConnectionMode::None;
            session.registered = false;
        }
        self.inner.primary.shutdown();
        self.inner.fallback.shutdown();
    }
}

impl Drop for FailoverCoordinator {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

impl CoordinatorInner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn supervisor(&self, mode: ConnectionMode) -> &ConnectionSupervisor {
        match mode {
            ConnectionMode::Fallback => &self.fallback,
            _ => &self.primary,
        }
    }

    fn active_mode(&self) -> Option<ConnectionMode> {
        let mode = self.session().mode;
        (mode != ConnectionMode::None && self.supervisor(mode).is_connected(self.peer))
            .then_some(mode)
    }

    async fn establish(&self) -> Result<ConnectionMode, LinkError> {
        let _guard = self.establish.lock().await;

        loop {
            if let Some(mode) = self.active_mode() {
                return Ok(mode);
            }
            {
                let session = self.session();
                if session.stopped {
                    return Err(LinkError::Closed);
                }
                if session.gave_up {
                    return Err(LinkError::Exhausted {
                        rounds: session.rounds,
                    });
                }
            }

            for mode in [ConnectionMode::Primary, ConnectionMode::Fallback] {
                let (skip, switching) = {
                    let session = self.session();
                    let other = match mode {
                        ConnectionMode::Primary => ConnectionMode::Fallback,
                        _ => ConnectionMode::Primary,
                    };
                    let other_enabled =
                        other != ConnectionMode::Primary || self.config.primary_enabled;
                    (session.failed(mode), other_enabled && session.failed(other))
                };
                if skip {
                    continue;
                }
                if switching {
                    debug!(
                        peer = %self.peer,
                        to = %mode,
                        delay_ms = self.config.fallback_delay.as_millis() as u64,
                        "Settling before switching transport"
                    );
                    tokio::time::sleep(self.config.fallback_delay).await;
                }

                info!(peer = %self.peer, mode = %mode, "Attempting transport");
                match self.supervisor(mode).connect(self.peer).await {
                    Ok(()) => {
                        {
                            let mut session = self.session();
                            if session.stopped {
                                drop(session);
                                self.supervisor(mode)
                                    .disconnect(self.peer, DisconnectReason::Shutdown);
                                return Err(LinkError::Closed);
                            }
                            session.mode = mode;
                            session.rounds = 0;
                            session.registered = false;
                        }
                        info!(peer = %self.peer, mode = %mode, "Link established");
                        self.events.publish(CoordinatorEvent::ModeChanged { mode });
                        return Ok(mode);
                    }
                    Err(e) => {
                        warn!(
                            peer = %self.peer,
                            mode = %mode,
                            error = %e,
                            "Transport failed, disabling for this session"
                        );
                        self.session().mark_failed(mode);
                    }
                }
            }

            let round = {
                let mut session = self.session();
                session.rounds += 1;
                session.rounds
            };

            if round >= self.config.max_rounds {
                error!(
                    peer = %self.peer,
                    rounds = round,
                    "All transports exhausted, giving up until restarted"
                );
                self.session().gave_up = true;
                self.events.publish(CoordinatorEvent::ConnectionFailed {
                    round,
                    retry_in: None,
                });
                return Err(LinkError::Exhausted { rounds: round });
            }

            let delay = self.config.round_backoff.delay(round);
            warn!(
                peer = %self.peer,
                round,
                delay_ms = delay.as_millis() as u64,
                "All transports failed, retrying"
            );
            self.events.publish(CoordinatorEvent::ConnectionFailed {
                round,
                retry_in: Some(delay),
            });
            tokio::time::sleep(delay).await;

            let mut session = self.session();
            session.primary_failed = !self.config.primary_enabled;
            session.fallback_failed = false;
        }
    }

    /// The active transport dropped: disable it and recover on the other.
    fn on_transport_lost(self: &Arc<Self>, mode: ConnectionMode) {
        {
            let mut session = self.session();
            if session.stopped || session.mode != mode {
                return;
            }
            session.mark_failed(mode);
            session.mode = ConnectionMode::None;
            session.registered = false;
        }
        warn!(peer = %self.peer, mode = %mode, "Active transport lost");
        self.events.publish(CoordinatorEvent::ModeChanged {
            mode: ConnectionMode::None,
        });

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.establish().await {
                warn!(peer = %inner.peer, error = %e, "Link recovery stopped");
            }
        });
    }
}

async fn pump(
    inner: Weak<CoordinatorInner>,
    mode: ConnectionMode,
    mut events: Subscription<LinkEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let lost = matches!(
            &event,
            LinkEvent::Disconnected { reason, .. } if !reason.is_terminal()
        );
        inner.events.publish(CoordinatorEvent::Link { mode, event });
        if lost {
            inner.on_transport_lost(mode);
        }
    }
}
