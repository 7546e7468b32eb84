//! Transport abstraction.

use async_trait::async_trait;
use fleet_proto::Frame;
use tokio::sync::mpsc;

use crate::{LinkError, PeerIdentity};

/// Frames buffered in each direction of a connection.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// One open duplex channel.
///
/// The connection is closed when `inbound` yields `None`. Dropping
/// `outbound` closes it from this side.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

impl Connection {
    /// Two connected in-process ends.
    pub fn pair(capacity: usize) -> (Connection, Connection) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            Connection {
                outbound: a_tx,
                inbound: a_rx,
            },
            Connection {
                outbound: b_tx,
                inbound: b_rx,
            },
        )
    }
}

/// Opens connections to peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn open(&self, peer: &PeerIdentity) -> Result<Connection, LinkError>;
}

/// Transport for sides that only accept inbound connections.
#[derive(Debug, Default)]
pub struct InboundOnly;

#[async_trait]
impl Transport for InboundOnly {
    fn name(&self) -> &'static str {
        "inbound"
    }

    async fn open(&self, peer: &PeerIdentity) -> Result<Connection, LinkError> {
        Err(LinkError::Unavailable(format!(
            "{} connects inbound only",
            peer.id
        )))
    }
}
