//! Link and dispatch errors.

use fleet_id::{CommandId, PeerId};
use thiserror::Error;

/// Errors raised by transports and the connection supervisor.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    #[error("peer {0} is not in the directory")]
    UnknownPeer(PeerId),

    #[error("circuit open for peer {0}")]
    CircuitOpen(PeerId),

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    #[error("connection closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("rejected by peer: {0}")]
    Rejected(String),

    #[error("gave up after {rounds} failover rounds")]
    Exhausted { rounds: u32 },
}

impl LinkError {
    /// Transport-class failures are retryable; protocol and application
    /// failures are surfaced without retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LinkError::CircuitOpen(_)
                | LinkError::Unavailable(_)
                | LinkError::Timeout { .. }
                | LinkError::NotConnected(_)
                | LinkError::Closed
        )
    }
}

/// Errors surfaced to the caller of [`crate::CommandDispatcher::execute`].
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    #[error("command {command_id} timed out after {timeout_ms}ms")]
    Timeout {
        command_id: CommandId,
        timeout_ms: u64,
    },

    #[error("command {command_id} cancelled: connection to peer was closed")]
    Cancelled { command_id: CommandId },

    #[error("command {command_id} failed on target: {message}")]
    Failed {
        command_id: CommandId,
        message: String,
    },

    #[error("failed to send command: {0}")]
    Send(#[source] LinkError),
}
