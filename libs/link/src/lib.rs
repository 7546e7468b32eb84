//! # fleet-link
//!
//! Resilient duplex links between fleet tiers.
//!
//! The layers, leaves first:
//!
//! - [`CircuitBreakers`]: per-peer failure accounting that throttles
//!   reconnection to peers that stay down.
//! - [`ConnectionSupervisor`]: one physical connection per peer, checked
//!   before use, swept for liveness, and reconnected with [`BackoffPolicy`].
//! - [`CommandDispatcher`]: correlated request/response commands with
//!   per-call deadlines.
//! - [`FailoverCoordinator`]: primary/fallback transport selection behind a
//!   single logical link.
//!
//! Transports implement [`Transport`]; this crate ships a WebSocket client
//! and an in-process transport.

mod backoff;
mod breaker;
mod clock;
mod dispatcher;
mod error;
mod events;
mod failover;
mod memory;
mod peer;
mod supervisor;
mod transport;
mod ws;

pub use backoff::{BackoffPolicy, ReconnectPolicy};
pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreakers, CircuitState};
pub use clock::MonotonicClock;
pub use dispatcher::{CommandDispatcher, DispatcherConfig, PendingSummary};
pub use error::{DispatchError, LinkError};
pub use events::{DisconnectReason, EventBus, LinkEvent, Subscription};
pub use failover::{
    ConnectionMode, CoordinatorEvent, FailoverConfig, FailoverCoordinator, FailoverStatus,
    TransportRoute,
};
pub use memory::{MemoryListener, MemoryTransport};
pub use peer::{PeerDirectory, PeerIdentity, PeerKey};
pub use supervisor::{ConnectionState, ConnectionSupervisor, PeerStatus, SupervisorConfig};
pub use transport::{Connection, InboundOnly, Transport, DEFAULT_CHANNEL_CAPACITY};
pub use ws::WebSocketTransport;
