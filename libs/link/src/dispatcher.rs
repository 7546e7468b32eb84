//! Correlated request/response commands over a supervised connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_id::{CommandId, PeerId};
use fleet_proto::{Command, CommandEnvelope, CommandResponse, Frame};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{ConnectionSupervisor, DispatchError, LinkError, LinkEvent, MonotonicClock};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Deadline used when the caller does not pass one.
    pub default_timeout: Duration,

    /// Bound on the on-demand connect attempt for a disconnected peer.
    pub connect_wait: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            connect_wait: Duration::from_secs(10),
        }
    }
}

struct PendingCommand {
    peer: PeerId,
    /// Connection the command went out on.
    session: u64,
    command_type: &'static str,
    deadline: Instant,
    tx: oneshot::Sender<CommandResponse>,
}

/// A command awaiting its response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSummary {
    pub command_id: CommandId,
    pub peer: PeerId,
    pub command_type: &'static str,
    pub deadline: Instant,
}

type PendingMap = Arc<Mutex<HashMap<CommandId, PendingCommand>>>;

/// Removes the pending entry when `execute` returns or is cancelled.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    command_id: CommandId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.command_id);
    }
}

/// Issues commands to peers of one supervisor and matches their responses.
///
/// Every call is independent: concurrent commands to the same peer may be
/// in flight together, and nothing is retried.
pub struct CommandDispatcher {
    supervisor: ConnectionSupervisor,
    config: DispatcherConfig,
    clock: Arc<MonotonicClock>,
    pending: PendingMap,
    pump: JoinHandle<()>,
}

impl CommandDispatcher {
    /// Must be called within a Tokio runtime; spawns the response pump.
    pub fn new(supervisor: ConnectionSupervisor, config: DispatcherConfig) -> Self {
        let pending: PendingMap = Arc::default();
        let mut events = supervisor.subscribe();
        let pump_pending = Arc::clone(&pending);

        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    LinkEvent::Frame {
                        peer,
                        frame: Frame::CommandResult(response),
                        ..
                    } => complete(&pump_pending, peer, response),
                    LinkEvent::Disconnected { peer, session, .. } => {
                        cancel_session(&pump_pending, peer, session)
                    }
                    _ => {}
                }
            }
        });

        Self {
            supervisor,
            config,
            clock: Arc::new(MonotonicClock::new()),
            pending,
            pump,
        }
    }

    pub fn with_clock(mut self, clock: Arc<MonotonicClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Send `command` to `peer` and wait for its response.
    ///
    /// A disconnected peer gets exactly one bounded connect attempt. A
    /// response with `success: false` is returned as
    /// [`DispatchError::Failed`].
    pub async fn execute(
        &self,
        peer: PeerId,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<CommandResponse, DispatchError> {
        self.execute_for(peer, peer, command, timeout).await
    }

    /// Like [`execute`](Self::execute), but addressed to `target` behind
    /// `peer`. The peer relays the command and answers for the target.
    pub async fn execute_for(
        &self,
        peer: PeerId,
        target: PeerId,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<CommandResponse, DispatchError> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        self.ensure_connected(peer).await?;

        let (session, outbound) = self
            .supervisor
            .outbound(peer)
            .ok_or(DispatchError::NotConnected(peer))?;

        let command_id = CommandId::new();
        let command_type = command.command_type();
        let (tx, rx) = oneshot::channel();

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                command_id,
                PendingCommand {
                    peer,
                    session,
                    command_type,
                    deadline: Instant::now() + timeout,
                    tx,
                },
            );
        let _guard = PendingGuard {
            pending: &self.pending,
            command_id,
        };

        let envelope = CommandEnvelope {
            command_id,
            target,
            timestamp: self.clock.now_millis(),
            command,
        };
        outbound
            .send(Frame::Command(envelope))
            .await
            .map_err(|_| DispatchError::Send(LinkError::Closed))?;

        debug!(
            peer = %peer,
            session,
            target = %target,
            command_id = %command_id,
            command_type,
            timeout_ms = timeout.as_millis() as u64,
            "Command sent"
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) if response.success => Ok(response),
            Ok(Ok(response)) => Err(DispatchError::Failed {
                command_id,
                message: response
                    .error_message
                    .unwrap_or_else(|| "command failed".to_string()),
            }),
            Ok(Err(_)) => Err(DispatchError::Cancelled { command_id }),
            Err(_) => {
                warn!(
                    peer = %peer,
                    command_id = %command_id,
                    command_type,
                    "Command timed out"
                );
                Err(DispatchError::Timeout {
                    command_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn ensure_connected(&self, peer: PeerId) -> Result<(), DispatchError> {
        if self.supervisor.is_connected(peer) {
            return Ok(());
        }

        info!(peer = %peer, "Peer not connected, attempting on-demand connect");
        match tokio::time::timeout(self.config.connect_wait, self.supervisor.connect(peer)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "On-demand connect failed");
                Err(DispatchError::NotConnected(peer))
            }
            Err(_) => {
                warn!(peer = %peer, "On-demand connect timed out");
                Err(DispatchError::NotConnected(peer))
            }
        }
    }

    pub fn pending(&self) -> Vec<PendingSummary> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, p)| PendingSummary {
                command_id: *id,
                peer: p.peer,
                command_type: p.command_type,
                deadline: p.deadline,
            })
            .collect()
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn complete(pending: &PendingMap, peer: PeerId, response: CommandResponse) {
    let mut map = pending.lock().unwrap_or_else(|e| e.into_inner());
    match map.get(&response.command_id) {
        Some(entry) if entry.peer == peer => {
            if let Some(entry) = map.remove(&response.command_id) {
                let _ = entry.tx.send(response);
            }
        }
        Some(entry) => warn!(
            peer = %peer,
            expected = %entry.peer,
            command_id = %response.command_id,
            "Command response from unexpected peer, ignoring"
        ),
        None => debug!(
            peer = %peer,
            command_id = %response.command_id,
            "Discarding response for unknown or expired command"
        ),
    }
}

/// Drop every pending command sent on connection `session` to `peer`; their
/// callers see `Cancelled`. Commands on a newer connection are untouched.
fn cancel_session(pending: &PendingMap, peer: PeerId, session: u64) {
    let mut map = pending.lock().unwrap_or_else(|e| e.into_inner());
    let before = map.len();
    map.retain(|_, p| p.peer != peer || p.session != session);
    let cancelled = before - map.len();
    if cancelled > 0 {
        info!(peer = %peer, session, cancelled, "Cancelled in-flight commands on disconnect");
    }
}
