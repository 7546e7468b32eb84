//! Connection supervisor.
//!
//! Owns one physical connection per peer:
//! - Gates connection attempts on the peer's circuit breaker
//! - Checks new connections with a Ping/Pong round trip before trusting them
//! - Tracks liveness from inbound traffic and closes stale connections
//! - Reconnects with exponential backoff unless the disconnect was terminal

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use fleet_id::PeerId;
use fleet_proto::Frame;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::events::Subscription;
use crate::transport::InboundOnly;
use crate::{
    BreakerConfig, BreakerSnapshot, CircuitBreakers, Connection, DisconnectReason, EventBus,
    LinkError, LinkEvent, PeerDirectory, PeerIdentity, PeerKey, ReconnectPolicy, Transport,
};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Deadline for opening a connection and completing the handshake.
    pub handshake_timeout: Duration,

    /// A connection with no inbound traffic for this long is closed.
    pub liveness_timeout: Duration,

    /// How often the liveness sweep runs.
    pub sweep_interval: Duration,

    pub reconnect: ReconnectPolicy,

    /// Reconnect automatically after non-terminal disconnects.
    pub auto_reconnect: bool,

    pub breaker: BreakerConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            liveness_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            auto_reconnect: true,
            breaker: BreakerConfig::default(),
        }
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Waiting before a reconnect attempt.
    BackoffWait,
}

/// Side-effect free view of one peer.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub identity: PeerIdentity,
    pub state: ConnectionState,
    pub registered: bool,
    pub connected_at: Option<Instant>,
    pub last_heartbeat_at: Option<Instant>,
    pub reconnect_attempts: u32,
    pub breaker: BreakerSnapshot,
}

struct ActiveConnection {
    session: u64,
    outbound: mpsc::Sender<Frame>,
    reader: JoinHandle<()>,
    connected_at: Instant,
    last_heartbeat_at: Instant,
    registered: bool,
}

#[derive(Default)]
struct PeerSlot {
    state: ConnectionState,
    active: Option<ActiveConnection>,
    reconnect_attempts: u32,
    reconnect_task: Option<JoinHandle<()>>,
    connect_lock: Arc<tokio::sync::Mutex<()>>,
}

struct Inner {
    config: SupervisorConfig,
    transport: Arc<dyn Transport>,
    directory: RwLock<PeerDirectory>,
    breakers: CircuitBreakers,
    slots: Mutex<HashMap<PeerId, PeerSlot>>,
    events: EventBus<LinkEvent>,
    next_session: AtomicU64,
    next_nonce: AtomicU64,
}

/// Supervises connections to a set of peers over one transport.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    pub fn new(config: SupervisorConfig, transport: Arc<dyn Transport>) -> Self {
        let breakers = CircuitBreakers::new(config.breaker.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                directory: RwLock::new(PeerDirectory::new()),
                breakers,
                slots: Mutex::new(HashMap::new()),
                events: EventBus::new(),
                next_session: AtomicU64::new(1),
                next_nonce: AtomicU64::new(1),
            }),
        }
    }

    /// A supervisor that never dials out; peers arrive through [`attach`].
    ///
    /// [`attach`]: ConnectionSupervisor::attach
    pub fn accepting(config: SupervisorConfig) -> Self {
        Self::new(
            SupervisorConfig {
                auto_reconnect: false,
                ..config
            },
            Arc::new(InboundOnly),
        )
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.inner.breakers
    }

    pub fn subscribe(&self) -> Subscription<LinkEvent> {
        self.inner.events.subscribe()
    }

    pub fn add_peer(&self, identity: PeerIdentity) -> PeerKey {
        self.inner
            .directory
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .upsert(identity)
    }

    pub fn identity(&self, peer: PeerId) -> Option<PeerIdentity> {
        self.inner.identity(peer)
    }

    /// Open, check and install a connection to `peer`. A no-op if already
    /// connected. Concurrent calls for the same peer are serialized.
    pub async fn connect(&self, peer: PeerId) -> Result<(), LinkError> {
        self.inner.connect(peer).await
    }

    /// Install a connection the remote side opened. Replaces any existing
    /// connection to the same peer.
    pub fn attach(&self, identity: PeerIdentity, connection: Connection) {
        let peer = identity.id;
        self.add_peer(identity);
        self.inner.breakers.record_success(peer);
        self.inner.install(peer, connection, Vec::new());
    }

    /// Close the connection to `peer` and cancel any pending reconnect.
    /// Reconnects afterwards only if `reason` is not terminal.
    pub fn disconnect(&self, peer: PeerId, reason: DisconnectReason) {
        self.inner.disconnect(peer, reason);
    }

    pub async fn send(&self, peer: PeerId, frame: Frame) -> Result<(), LinkError> {
        let (_, outbound) = self.outbound(peer).ok_or(LinkError::NotConnected(peer))?;
        outbound.send(frame).await.map_err(|_| LinkError::Closed)
    }

    /// Send on connection `session` only. Fails with `NotConnected` once
    /// that connection has been closed or replaced.
    pub async fn send_on(&self, peer: PeerId, session: u64, frame: Frame) -> Result<(), LinkError> {
        let outbound = self
            .outbound(peer)
            .filter(|(current, _)| *current == session)
            .map(|(_, outbound)| outbound)
            .ok_or(LinkError::NotConnected(peer))?;
        outbound.send(frame).await.map_err(|_| LinkError::Closed)
    }

    /// Session of the current connection to `peer`.
    pub fn session(&self, peer: PeerId) -> Option<u64> {
        self.inner
            .slots()
            .get(&peer)
            .and_then(|slot| slot.active.as_ref())
            .map(|active| active.session)
    }

    pub(crate) fn outbound(&self, peer: PeerId) -> Option<(u64, mpsc::Sender<Frame>)> {
        self.inner
            .slots()
            .get(&peer)
            .and_then(|slot| slot.active.as_ref())
            .map(|active| (active.session, active.outbound.clone()))
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.inner
            .slots()
            .get(&peer)
            .is_some_and(|slot| slot.active.is_some())
    }

    pub fn is_registered(&self, peer: PeerId) -> bool {
        self.inner
            .slots()
            .get(&peer)
            .and_then(|slot| slot.active.as_ref())
            .is_some_and(|active| active.registered)
    }

    pub fn is_registered_on(&self, peer: PeerId, session: u64) -> bool {
        self.inner
            .slots()
            .get(&peer)
            .and_then(|slot| slot.active.as_ref())
            .is_some_and(|active| active.session == session && active.registered)
    }

    /// Record the registration state of the current connection. Returns
    /// false if there is no connection to `peer`.
    pub fn mark_registered(&self, peer: PeerId, registered: bool) -> bool {
        self.inner.set_registered(peer, None, registered)
    }

    /// Like [`mark_registered`](Self::mark_registered), but only while
    /// `session` is still the current connection.
    pub fn mark_registered_on(&self, peer: PeerId, session: u64, registered: bool) -> bool {
        self.inner.set_registered(peer, Some(session), registered)
    }

    /// Treat now as the last sign of life from `peer`.
    pub fn touch(&self, peer: PeerId) {
        let mut slots = self.inner.slots();
        if let Some(slot) = slots.get_mut(&peer) {
            if let Some(active) = slot.active.as_mut() {
                active.last_heartbeat_at = Instant::now();
                slot.reconnect_attempts = 0;
            }
        }
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .slots()
            .iter()
            .filter(|(_, slot)| slot.active.is_some())
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn status(&self, peer: PeerId) -> Option<PeerStatus> {
        let identity = self.identity(peer)?;
        Some(self.inner.status_of(identity))
    }

    /// Status of every peer in the directory.
    pub fn peers(&self) -> Vec<PeerStatus> {
        let identities: Vec<PeerIdentity> = self
            .inner
            .directory
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        identities
            .into_iter()
            .map(|identity| self.inner.status_of(identity))
            .collect()
    }

    /// Close every connection that has been silent longer than the
    /// liveness timeout. Returns the peers that were closed.
    pub fn sweep(&self) -> Vec<PeerId> {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> Vec<PeerId> {
        let timeout = self.inner.config.liveness_timeout;
        let stale: Vec<(PeerId, u64, Duration)> = self
            .inner
            .slots()
            .iter()
            .filter_map(|(peer, slot)| {
                let active = slot.active.as_ref()?;
                let silent = now.saturating_duration_since(active.last_heartbeat_at);
                (silent > timeout).then_some((*peer, active.session, silent))
            })
            .collect();

        for (peer, session, silent) in &stale {
            warn!(
                peer = %peer,
                silent_secs = silent.as_secs(),
                "Peer missed liveness deadline, closing connection"
            );
            self.inner.lost(*peer, *session, DisconnectReason::Stale);
        }

        stale.into_iter().map(|(peer, _, _)| peer).collect()
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until shutdown.
    pub fn spawn_liveness_sweep(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(supervisor.inner.config.sweep_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        supervisor.sweep();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Liveness sweep stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Disconnect every peer with the terminal `Shutdown` reason.
    pub fn shutdown(&self) {
        let peers: Vec<PeerId> = self.inner.slots().keys().copied().collect();
        for peer in peers {
            self.inner.disconnect(peer, DisconnectReason::Shutdown);
        }
    }
}

// =============================================================================
// Internals
// =============================================================================

/// Resets a slot left in `Connecting` if the connect future is dropped.
struct ConnectAttempt<'a> {
    inner: &'a Inner,
    peer: PeerId,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        let mut slots = self.inner.slots();
        if let Some(slot) = slots.get_mut(&self.peer) {
            if slot.state == ConnectionState::Connecting && slot.active.is_none() {
                slot.state = ConnectionState::Disconnected;
            }
        }
    }
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<PeerId, PeerSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn identity(&self, peer: PeerId) -> Option<PeerIdentity> {
        self.directory
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolve(peer)
            .cloned()
    }

    fn set_state(&self, peer: PeerId, state: ConnectionState) {
        let mut slots = self.slots();
        let slot = slots.entry(peer).or_default();
        if slot.active.is_none() {
            slot.state = state;
        }
    }

    fn status_of(&self, identity: PeerIdentity) -> PeerStatus {
        let breaker = self.breakers.snapshot(identity.id);
        let slots = self.slots();
        let slot = slots.get(&identity.id);
        let active = slot.and_then(|s| s.active.as_ref());
        PeerStatus {
            state: slot.map(|s| s.state).unwrap_or_default(),
            registered: active.is_some_and(|a| a.registered),
            connected_at: active.map(|a| a.connected_at),
            last_heartbeat_at: active.map(|a| a.last_heartbeat_at),
            reconnect_attempts: slot.map(|s| s.reconnect_attempts).unwrap_or_default(),
            breaker,
            identity,
        }
    }

    async fn connect(self: &Arc<Self>, peer: PeerId) -> Result<(), LinkError> {
        let identity = self.identity(peer).ok_or(LinkError::UnknownPeer(peer))?;

        let lock = Arc::clone(&self.slots().entry(peer).or_default().connect_lock);
        let _guard = lock.lock().await;

        {
            let mut slots = self.slots();
            let slot = slots.entry(peer).or_default();
            if slot.active.is_some() {
                return Ok(());
            }
            if let Some(task) = slot.reconnect_task.take() {
                debug!(peer = %peer, "Cancelling scheduled reconnect for explicit connect");
                task.abort();
            }
        }

        if !self.breakers.can_attempt(peer) {
            debug!(peer = %peer, "Circuit open, skipping connect");
            self.set_state(peer, ConnectionState::Disconnected);
            self.events.publish(LinkEvent::CircuitOpen { peer });
            if self.config.auto_reconnect {
                self.schedule_reconnect(peer);
            }
            return Err(LinkError::CircuitOpen(peer));
        }

        self.set_state(peer, ConnectionState::Connecting);
        let _attempt = ConnectAttempt { inner: self, peer };

        info!(
            peer = %peer,
            address = %identity.address,
            transport = self.transport.name(),
            "Connecting to peer"
        );

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let deadline = self.config.handshake_timeout;
        let handshake = self.open_and_handshake(&identity, nonce);
        let result = match tokio::time::timeout(deadline, handshake).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout {
                operation: "connect",
                timeout_ms: deadline.as_millis() as u64,
            }),
        };

        match result {
            Ok((connection, early)) => {
                self.breakers.record_success(peer);
                self.install(peer, connection, early);
                Ok(())
            }
            Err(e) => {
                warn!(
                    peer = %peer,
                    transport = self.transport.name(),
                    error = %e,
                    "Connection attempt failed"
                );
                self.breakers.record_failure(peer);
                self.set_state(peer, ConnectionState::Disconnected);
                self.events.publish(LinkEvent::ConnectFailed {
                    peer,
                    error: e.to_string(),
                });
                if self.config.auto_reconnect {
                    self.schedule_reconnect(peer);
                }
                Err(e)
            }
        }
    }

    /// Open the transport and wait for the Pong matching our Ping. Frames
    /// that arrive before the Pong are returned for delivery after connect.
    async fn open_and_handshake(
        &self,
        identity: &PeerIdentity,
        nonce: u64,
    ) -> Result<(Connection, Vec<Frame>), LinkError> {
        let mut connection = self.transport.open(identity).await?;

        connection
            .outbound
            .send(Frame::Ping { nonce })
            .await
            .map_err(|_| LinkError::Closed)?;

        let mut early = Vec::new();
        loop {
            match connection.inbound.recv().await {
                Some(Frame::Pong { nonce: n }) if n == nonce => return Ok((connection, early)),
                Some(Frame::Ping { nonce: n }) => {
                    let _ = connection.outbound.send(Frame::Pong { nonce: n }).await;
                }
                Some(Frame::Pong { .. }) => {}
                Some(frame) => early.push(frame),
                None => return Err(LinkError::Closed),
            }
        }
    }

    fn install(self: &Arc<Self>, peer: PeerId, connection: Connection, early: Vec<Frame>) {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let Connection { outbound, inbound } = connection;
        let now = Instant::now();

        // Events are published under the slot lock so that subscribers never
        // see a stale session's events interleaved with a newer one's.
        let mut slots = self.slots();
        let slot = slots.entry(peer).or_default();

        if let Some(task) = slot.reconnect_task.take() {
            task.abort();
        }
        if let Some(previous) = slot.active.take() {
            previous.reader.abort();
            self.events.publish(LinkEvent::Disconnected {
                peer,
                session: previous.session,
                reason: DisconnectReason::Replaced,
            });
        }

        info!(peer = %peer, session, transport = self.transport.name(), "Peer connected");
        self.events.publish(LinkEvent::Connected { peer, session });
        for frame in early {
            self.events.publish(LinkEvent::Frame {
                peer,
                session,
                frame,
            });
        }

        let reader = tokio::spawn(read_loop(
            Arc::downgrade(self),
            peer,
            session,
            inbound,
            outbound.clone(),
        ));

        slot.state = ConnectionState::Connected;
        slot.reconnect_attempts = 0;
        slot.active = Some(ActiveConnection {
            session,
            outbound,
            reader,
            connected_at: now,
            last_heartbeat_at: now,
            registered: false,
        });
    }

    fn set_registered(&self, peer: PeerId, session: Option<u64>, registered: bool) -> bool {
        let mut slots = self.slots();
        let active = slots
            .get_mut(&peer)
            .and_then(|slot| slot.active.as_mut())
            .filter(|active| session.map_or(true, |s| s == active.session));
        match active {
            Some(active) => {
                active.registered = registered;
                true
            }
            None => false,
        }
    }

    fn touch_session(&self, peer: PeerId, session: u64) {
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(&peer) {
            if let Some(active) = slot.active.as_mut().filter(|a| a.session == session) {
                active.last_heartbeat_at = Instant::now();
                slot.reconnect_attempts = 0;
            }
        }
    }

    /// The connection identified by `session` ended on its own.
    fn lost(self: &Arc<Self>, peer: PeerId, session: u64, reason: DisconnectReason) {
        {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(&peer) else {
                return;
            };
            if slot.active.as_ref().map(|a| a.session) != Some(session) {
                return;
            }
            if let Some(active) = slot.active.take() {
                active.reader.abort();
            }
            slot.state = ConnectionState::Disconnected;
            info!(peer = %peer, session, reason = %reason, "Peer disconnected");
            self.events.publish(LinkEvent::Disconnected {
                peer,
                session,
                reason: reason.clone(),
            });
        }

        if !reason.is_terminal() && self.config.auto_reconnect {
            self.schedule_reconnect(peer);
        }
    }

    fn disconnect(self: &Arc<Self>, peer: PeerId, reason: DisconnectReason) {
        {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(&peer) else {
                return;
            };
            if let Some(task) = slot.reconnect_task.take() {
                debug!(peer = %peer, "Cancelled pending reconnect");
                task.abort();
            }
            slot.state = ConnectionState::Disconnected;
            if let Some(active) = slot.active.take() {
                active.reader.abort();
                info!(peer = %peer, reason = %reason, "Disconnecting peer");
                self.events.publish(LinkEvent::Disconnected {
                    peer,
                    session: active.session,
                    reason: reason.clone(),
                });
            }
        }

        if !reason.is_terminal() && self.config.auto_reconnect {
            self.schedule_reconnect(peer);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, peer: PeerId) {
        let retry_in = self
            .breakers
            .snapshot(peer)
            .retry_in(Instant::now())
            .unwrap_or_default();

        let mut slots = self.slots();
        let slot = slots.entry(peer).or_default();
        if slot.active.is_some() || slot.reconnect_task.is_some() {
            return;
        }

        let attempt = slot.reconnect_attempts + 1;
        let Some(delay) = self.config.reconnect.next_delay(attempt) else {
            warn!(
                peer = %peer,
                attempts = slot.reconnect_attempts,
                "Reconnect attempts exhausted"
            );
            slot.state = ConnectionState::Disconnected;
            self.events.publish(LinkEvent::GaveUp {
                peer,
                attempts: slot.reconnect_attempts,
            });
            return;
        };
        let delay = delay.max(retry_in);

        slot.reconnect_attempts = attempt;
        slot.state = ConnectionState::BackoffWait;
        info!(
            peer = %peer,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.events.publish(LinkEvent::ReconnectScheduled {
            peer,
            attempt,
            delay,
        });

        let weak = Arc::downgrade(self);
        slot.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Detach our own handle so connect does not abort this task.
            if let Some(slot) = inner.slots().get_mut(&peer) {
                slot.reconnect_task.take();
            }
            let _ = inner.connect(peer).await;
        }));
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    peer: PeerId,
    session: u64,
    mut inbound: mpsc::Receiver<Frame>,
    outbound: mpsc::Sender<Frame>,
) {
    while let Some(frame) = inbound.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.touch_session(peer, session);

        match frame {
            Frame::Ping { nonce } => {
                if outbound.send(Frame::Pong { nonce }).await.is_err() {
                    break;
                }
            }
            Frame::Pong { .. } => {}
            frame => {
                debug!(peer = %peer, kind = frame.kind(), "Inbound frame");
                inner.events.publish(LinkEvent::Frame {
                    peer,
                    session,
                    frame,
                });
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.lost(peer, session, DisconnectReason::TransportClosed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BackoffPolicy, MemoryTransport};
    use fleet_id::HostId;

    fn host() -> PeerId {
        PeerId::Host(HostId::new())
    }

    /// Answers pings on every accepted connection until the peer hangs up.
    fn spawn_responder(mut listener: crate::MemoryListener) {
        tokio::spawn(async move {
            while let Some(mut conn) = listener.accept().await {
                tokio::spawn(async move {
                    while let Some(frame) = conn.inbound.recv().await {
                        if let Frame::Ping { nonce } = frame {
                            let _ = conn.outbound.send(Frame::Pong { nonce }).await;
                        }
                    }
                });
            }
        });
    }

    fn supervisor(transport: &MemoryTransport, config: SupervisorConfig) -> ConnectionSupervisor {
        ConnectionSupervisor::new(config, Arc::new(transport.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_handshakes_and_marks_connected() {
        let transport = MemoryTransport::new();
        spawn_responder(transport.listen("host-a"));
        let sup = supervisor(&transport, SupervisorConfig::default());
        let peer = host();
        sup.add_peer(PeerIdentity::new(peer, "host-a"));
        let mut events = sup.subscribe();

        sup.connect(peer).await.unwrap();

        assert!(sup.is_connected(peer));
        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Connected { peer, session: 1 })
        );
        let status = sup.status(peer).unwrap();
        assert_eq!(status.state, ConnectionState::Connected);
        assert_eq!(status.breaker.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_peer() {
        let transport = MemoryTransport::new();
        let sup = supervisor(&transport, SupervisorConfig::default());
        assert!(matches!(
            sup.connect(host()).await,
            Err(LinkError::UnknownPeer(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_records_failure() {
        let transport = MemoryTransport::new();
        // Accepts but never answers the handshake.
        let mut listener = transport.listen("mute");
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Some(conn) = listener.accept().await {
                held.push(conn);
            }
        });

        let sup = supervisor(
            &transport,
            SupervisorConfig {
                auto_reconnect: false,
                ..SupervisorConfig::default()
            },
        );
        let peer = host();
        sup.add_peer(PeerIdentity::new(peer, "mute"));

        let started = Instant::now();
        let err = sup.connect(peer).await.unwrap_err();

        assert!(matches!(err, LinkError::Timeout { .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
        assert_eq!(sup.breakers().snapshot(peer).failure_count, 1);
        assert_eq!(sup.status(peer).unwrap().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_backoff_after_transport_close() {
        let transport = MemoryTransport::new();
        let mut listener = transport.listen("flaky");
        let sup = supervisor(&transport, SupervisorConfig::default());
        let peer = host();
        sup.add_peer(PeerIdentity::new(peer, "flaky"));
        let mut events = sup.subscribe();

        // First connection: answer the handshake, then hang up.
        let first = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            if let Some(Frame::Ping { nonce }) = conn.inbound.recv().await {
                conn.outbound.send(Frame::Pong { nonce }).await.unwrap();
            }
            listener
        });
        sup.connect(peer).await.unwrap();
        let listener = first.await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Connected { peer, session: 1 })
        );

        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Disconnected {
                peer,
                session: 1,
                reason: DisconnectReason::TransportClosed
            })
        );
        assert_eq!(
            events.recv().await,
            Some(LinkEvent::ReconnectScheduled {
                peer,
                attempt: 1,
                delay: Duration::from_secs(1)
            })
        );

        spawn_responder(listener);
        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Connected { peer, session: 2 })
        );
        assert_eq!(sup.status(peer).unwrap().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_disconnect_cancels_reconnect() {
        let transport = MemoryTransport::new();
        let sup = supervisor(&transport, SupervisorConfig::default());
        let peer = host();
        sup.add_peer(PeerIdentity::new(peer, "down"));
        let mut events = sup.subscribe();

        assert!(sup.connect(peer).await.is_err());
        assert!(matches!(
            events.recv().await,
            Some(LinkEvent::ConnectFailed { .. })
        ));
        assert!(matches!(
            events.recv().await,
            Some(LinkEvent::ReconnectScheduled { attempt: 1, .. })
        ));

        sup.disconnect(peer, DisconnectReason::Manual);
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(events.try_recv().is_none());
        assert_eq!(sup.breakers().snapshot(peer).failure_count, 1);
        assert_eq!(sup.status(peer).unwrap().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let transport = MemoryTransport::new();
        let sup = supervisor(
            &transport,
            SupervisorConfig {
                reconnect: ReconnectPolicy {
                    backoff: BackoffPolicy::default(),
                    max_attempts: Some(2),
                },
                ..SupervisorConfig::default()
            },
        );
        let peer = host();
        sup.add_peer(PeerIdentity::new(peer, "down"));
        let mut events = sup.subscribe();

        let _ = sup.connect(peer).await;
        loop {
            match events.recv().await {
                Some(LinkEvent::GaveUp { attempts, .. }) => {
                    assert_eq!(attempts, 2);
                    break;
                }
                Some(_) => continue,
                None => panic!("bus closed"),
            }
        }
        assert_eq!(sup.breakers().snapshot(peer).failure_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_open_skips_attempt() {
        let transport = MemoryTransport::new();
        let sup = supervisor(
            &transport,
            SupervisorConfig {
                auto_reconnect: false,
                ..SupervisorConfig::default()
            },
        );
        let peer = host();
        sup.add_peer(PeerIdentity::new(peer, "down"));

        for _ in 0..5 {
            assert!(matches!(
                sup.connect(peer).await,
                Err(LinkError::Unavailable(_))
            ));
        }
        assert!(matches!(
            sup.connect(peer).await,
            Err(LinkError::CircuitOpen(_))
        ));

        spawn_responder(transport.listen("down"));
        tokio::time::advance(Duration::from_secs(60)).await;
        sup.connect(peer).await.unwrap();
        assert_eq!(
            sup.breakers().snapshot(peer).state,
            crate::CircuitState::Closed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connection_swept() {
        let transport = MemoryTransport::new();
        spawn_responder(transport.listen("quiet"));
        let sup = supervisor(
            &transport,
            SupervisorConfig {
                auto_reconnect: false,
                ..SupervisorConfig::default()
            },
        );
        let peer = host();
        sup.add_peer(PeerIdentity::new(peer, "quiet"));
        sup.connect(peer).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(sup.sweep().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(sup.sweep(), vec![peer]);
        assert!(!sup.is_connected(peer));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_and_replace() {
        let sup = ConnectionSupervisor::accepting(SupervisorConfig::default());
        let peer = host();
        let mut events = sup.subscribe();

        let (ours, mut theirs) = Connection::pair(8);
        sup.attach(PeerIdentity::new(peer, "inbound"), ours);
        assert!(sup.is_connected(peer));
        assert!(sup.mark_registered(peer, true));

        theirs.outbound.send(Frame::Ping { nonce: 9 }).await.unwrap();
        assert_eq!(theirs.inbound.recv().await, Some(Frame::Pong { nonce: 9 }));

        let (ours2, _theirs2) = Connection::pair(8);
        sup.attach(PeerIdentity::new(peer, "inbound"), ours2);

        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Connected { peer, session: 1 })
        );
        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Disconnected {
                peer,
                session: 1,
                reason: DisconnectReason::Replaced
            })
        );
        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Connected { peer, session: 2 })
        );
        assert!(!sup.is_registered(peer));

        // The replaced connection is closed from our side.
        assert_eq!(theirs.inbound.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_scoped_operations_ignore_replaced_connection() {
        let sup = ConnectionSupervisor::accepting(SupervisorConfig::default());
        let peer = host();

        let (ours, _theirs) = Connection::pair(8);
        sup.attach(PeerIdentity::new(peer, "inbound"), ours);
        let old = sup.session(peer).unwrap();

        let (ours2, mut theirs2) = Connection::pair(8);
        sup.attach(PeerIdentity::new(peer, "inbound"), ours2);
        let current = sup.session(peer).unwrap();
        assert_ne!(old, current);

        assert!(!sup.mark_registered_on(peer, old, true));
        assert!(!sup.is_registered(peer));
        assert!(matches!(
            sup.send_on(peer, old, Frame::Pong { nonce: 1 }).await,
            Err(LinkError::NotConnected(_))
        ));

        assert!(sup.mark_registered_on(peer, current, true));
        assert!(sup.is_registered_on(peer, current));
        assert!(!sup.is_registered_on(peer, old));
        sup.send_on(peer, current, Frame::Pong { nonce: 2 })
            .await
            .unwrap();
        assert_eq!(theirs2.inbound.recv().await, Some(Frame::Pong { nonce: 2 }));
    }
}
