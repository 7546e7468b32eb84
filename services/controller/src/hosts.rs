//! Links from the controller to its host agents.
//!
//! Every host gets its own supervised connection with an independent
//! circuit breaker. Hosts push their state as sequenced sync messages; the
//! controller applies them in order into a [`HostStateCache`] and forwards
//! each applied message upward as a [`HostStateReport`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{HostId, PeerId};
use fleet_link::{
    CommandDispatcher, ConnectionSupervisor, DispatcherConfig, LinkEvent, MonotonicClock,
    PeerIdentity, SupervisorConfig, Transport,
};
use fleet_proto::{Frame, HostStateReport, SyncAckStatus};
use fleet_sync::{
    EngineConfig, OrderingEngine, SyncError, SyncHandler, SyncMessage, SyncMessageType,
};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HostEndpoint;

/// Latest state reported by one host, by message type.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HostState {
    pub state: BTreeMap<SyncMessageType, serde_json::Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct HostStateCache {
    hosts: Arc<RwLock<HashMap<HostId, HostState>>>,
}

impl HostStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(
        &self,
        host_id: HostId,
        message_type: SyncMessageType,
        state: serde_json::Value,
        at: DateTime<Utc>,
    ) {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        let entry = hosts.entry(host_id).or_default();
        entry.state.insert(message_type, state);
        entry.updated_at = Some(at);
    }

    pub fn get(&self, host_id: HostId) -> Option<HostState> {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        hosts.get(&host_id).cloned()
    }
}

/// Host state applied by the ordering engine, on its way to the admin.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedState {
    pub message_type: SyncMessageType,
    pub report: HostStateReport,
}

/// Stores applied host messages and queues them for the admin.
struct HostStateForwarder {
    cache: HostStateCache,
    upstream: mpsc::UnboundedSender<ForwardedState>,
}

#[async_trait]
impl SyncHandler for HostStateForwarder {
    async fn handle(
        &self,
        message: &SyncMessage,
        payload: &serde_json::Value,
    ) -> Result<(), SyncError> {
        let host_id = message.source.as_host().ok_or_else(|| SyncError::Handler {
            message_type: message.message_type.to_string(),
            reason: format!("{} is not a host", message.source),
        })?;

        let received_at = Utc::now();
        self.cache
            .record(host_id, message.message_type, payload.clone(), received_at);

        // The admin link may be down; the next applied message carries
        // fresher state anyway.
        let _ = self.upstream.send(ForwardedState {
            message_type: message.message_type,
            report: HostStateReport {
                host_id,
                received_at,
                state: payload.clone(),
            },
        });
        Ok(())
    }
}

/// Supervisor, dispatcher and ordering engine for the controller's hosts.
#[derive(Clone)]
pub struct HostFleet {
    inner: Arc<HostFleetInner>,
}

struct HostFleetInner {
    supervisor: ConnectionSupervisor,
    dispatcher: CommandDispatcher,
    engine: OrderingEngine,
    cache: HostStateCache,
    hosts: Vec<HostId>,
}

impl HostFleet {
    /// Must be called within a Tokio runtime. Host state applied by the
    /// engine is sent on `upstream`.
    pub fn new(
        config: SupervisorConfig,
        transport: Arc<dyn Transport>,
        hosts: &[HostEndpoint],
        clock: Arc<MonotonicClock>,
        upstream: mpsc::UnboundedSender<ForwardedState>,
    ) -> Self {
        let supervisor = ConnectionSupervisor::new(config, transport);
        for host in hosts {
            supervisor.add_peer(PeerIdentity::new(
                PeerId::Host(host.host_id),
                host.address.clone(),
            ));
        }

        let dispatcher = CommandDispatcher::new(supervisor.clone(), DispatcherConfig::default())
            .with_clock(clock);

        let cache = HostStateCache::new();
        let forwarder = Arc::new(HostStateForwarder {
            cache: cache.clone(),
            upstream,
        });
        let engine = [
            SyncMessageType::Heartbeat,
            SyncMessageType::Status,
            SyncMessageType::Metrics,
            SyncMessageType::Event,
        ]
        .into_iter()
        .fold(OrderingEngine::new(EngineConfig::default()), |engine, kind| {
            engine.with_handler(kind, forwarder.clone())
        });

        Self {
            inner: Arc::new(HostFleetInner {
                supervisor,
                dispatcher,
                engine,
                cache,
                hosts: hosts.iter().map(|h| h.host_id).collect(),
            }),
        }
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.inner.supervisor
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.inner.dispatcher
    }

    pub fn cache(&self) -> &HostStateCache {
        &self.inner.cache
    }

    pub fn host_ids(&self) -> &[HostId] {
        &self.inner.hosts
    }

    pub fn connected_count(&self) -> usize {
        self.inner
            .hosts
            .iter()
            .filter(|id| self.inner.supervisor.is_connected(PeerId::Host(**id)))
            .count()
    }

    /// Start connecting to every host. Failed hosts are retried by the
    /// supervisor's backoff.
    pub fn connect_all(&self) {
        for host_id in &self.inner.hosts {
            let peer = PeerId::Host(*host_id);
            let supervisor = self.inner.supervisor.clone();
            tokio::spawn(async move {
                if let Err(e) = supervisor.connect(peer).await {
                    debug!(peer = %peer, error = %e, "Initial host connect failed");
                }
            });
        }
    }

    /// Handle inbound host frames until shutdown.
    pub fn spawn(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut events = self.inner.supervisor.subscribe();
        let fleet = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        fleet.on_event(event).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn on_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { peer, .. } => {
                // Each connection starts a new sequence from the host.
                self.inner.engine.reset_source(peer);
                info!(peer = %peer, "Host link up");
            }
            LinkEvent::Disconnected { peer, reason, .. } => {
                info!(peer = %peer, reason = %reason, "Host link down");
            }
            LinkEvent::CircuitOpen { peer } => {
                warn!(peer = %peer, "Host circuit open");
            }
            LinkEvent::Frame {
                peer,
                frame: Frame::Sync(message),
                ..
            } => self.on_sync(peer, message).await,
            LinkEvent::Frame { peer, frame, .. } => match frame {
                // Correlated by the dispatcher.
                Frame::CommandResult(_) => {}
                Frame::Error(error) => warn!(
                    peer = %peer,
                    error_code = %error.error_code,
                    error_message = %error.error_message,
                    "Host reported an error"
                ),
                other => debug!(peer = %peer, kind = other.kind(), "Ignoring host frame"),
            },
            _ => {}
        }
    }

    async fn on_sync(&self, peer: PeerId, message: SyncMessage) {
        let message_id = message.id;
        let status = if message.source != peer {
            warn!(peer = %peer, source = %message.source, "Sync source does not match link");
            SyncAckStatus::Rejected
        } else {
            match self.inner.engine.process(message).await {
                Ok(outcome) => SyncAckStatus::from(&outcome),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Host sync rejected");
                    SyncAckStatus::Rejected
                }
            }
        };

        if let Err(e) = self
            .inner
            .supervisor
            .send(peer, Frame::SyncAck { message_id, status })
            .await
        {
            debug!(peer = %peer, error = %e, "Sync ack not delivered");
        }
    }
}
