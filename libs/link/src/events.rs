//! Connectivity events and the subscription bus that carries them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use fleet_id::PeerId;
use fleet_proto::Frame;
use serde::Serialize;
use tokio::sync::mpsc;

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Explicit disconnect by the owner. No reconnection.
    Manual,
    /// Process shutdown. No reconnection.
    Shutdown,
    /// No inbound traffic within the liveness timeout.
    Stale,
    /// The transport closed underneath us.
    TransportClosed,
    /// A newer connection for the same peer took over.
    Replaced,
}

impl DisconnectReason {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DisconnectReason::Manual | DisconnectReason::Shutdown)
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DisconnectReason::Manual => "manual",
            DisconnectReason::Shutdown => "shutdown",
            DisconnectReason::Stale => "stale",
            DisconnectReason::TransportClosed => "transport_closed",
            DisconnectReason::Replaced => "replaced",
        };
        f.write_str(s)
    }
}

/// Something that happened on a supervised link.
///
/// Connection-scoped events carry the `session` of the connection they
/// belong to. Sessions are unique per supervisor, so a replaced connection's
/// late events can be told apart from the current one's.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected {
        peer: PeerId,
        session: u64,
    },
    Disconnected {
        peer: PeerId,
        session: u64,
        reason: DisconnectReason,
    },
    /// An application frame arrived. Ping and Pong frames are consumed by the
    /// supervisor and never surface here.
    Frame {
        peer: PeerId,
        session: u64,
        frame: Frame,
    },
    ConnectFailed {
        peer: PeerId,
        error: String,
    },
    ReconnectScheduled {
        peer: PeerId,
        attempt: u32,
        delay: Duration,
    },
    CircuitOpen {
        peer: PeerId,
    },
    /// The reconnect budget is spent; nothing further is scheduled.
    GaveUp {
        peer: PeerId,
        attempts: u32,
    },
}

impl LinkEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            LinkEvent::Connected { peer, .. }
            | LinkEvent::Disconnected { peer, .. }
            | LinkEvent::Frame { peer, .. }
            | LinkEvent::ConnectFailed { peer, .. }
            | LinkEvent::ReconnectScheduled { peer, .. }
            | LinkEvent::CircuitOpen { peer }
            | LinkEvent::GaveUp { peer, .. } => *peer,
        }
    }
}

struct Subscriber<E> {
    id: u64,
    tx: mpsc::UnboundedSender<E>,
}

struct BusInner<E> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber<E>>>,
}

/// Fan-out of events to every live subscriber.
///
/// Publishing holds the subscriber list lock for the whole fan-out, so all
/// subscribers observe events in one global order. In particular events for
/// a single peer arrive in the order they were published.
pub struct EventBus<E> {
    inner: Arc<BusInner<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber { id, tx });
        Subscription {
            id,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    pub fn publish(&self, event: E) {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| s.tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Receiving end of an [`EventBus`] subscription. Dropping it unsubscribes.
pub struct Subscription<E> {
    id: u64,
    rx: mpsc::UnboundedReceiver<E>,
    bus: Weak<BusInner<E>>,
}

impl<E> Subscription<E> {
    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|s| s.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_id::HostId;

    #[tokio::test]
    async fn test_fifo_per_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let peer = PeerId::Host(HostId::new());

        bus.publish(LinkEvent::Connected { peer, session: 1 });
        for nonce in 0..3 {
            bus.publish(LinkEvent::Frame {
                peer,
                session: 1,
                frame: Frame::Pong { nonce },
            });
        }

        assert_eq!(
            sub.recv().await,
            Some(LinkEvent::Connected { peer, session: 1 })
        );
        for nonce in 0..3 {
            assert_eq!(
                sub.recv().await,
                Some(LinkEvent::Frame {
                    peer,
                    session: 1,
                    frame: Frame::Pong { nonce }
                })
            );
        }
    }

    #[test]
    fn test_unsubscribe_on_drop() {
        let bus: EventBus<LinkEvent> = EventBus::new();
        let first = bus.subscribe();
        let second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        first.unsubscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(second);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_terminal_reasons() {
        assert!(DisconnectReason::Manual.is_terminal());
        assert!(DisconnectReason::Shutdown.is_terminal());
        assert!(!DisconnectReason::Stale.is_terminal());
        assert!(!DisconnectReason::TransportClosed.is_terminal());
    }
}
