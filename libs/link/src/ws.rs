//! WebSocket client transport: one JSON text message per frame.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use fleet_proto::Frame;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::transport::DEFAULT_CHANNEL_CAPACITY;
use crate::{Connection, LinkError, PeerIdentity, Transport};

/// Dials `ws://` or `wss://` peer addresses.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn open(&self, peer: &PeerIdentity) -> Result<Connection, LinkError> {
        let (stream, _) = tokio_tungstenite::connect_async(peer.address.as_str())
            .await
            .map_err(|e| LinkError::Unavailable(format!("{}: {e}", peer.address)))?;

        let (mut ws_write, mut ws_read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Frame>(DEFAULT_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(DEFAULT_CHANNEL_CAPACITY);
        let peer_id = peer.id;

        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(peer = %peer_id, error = %e, "Dropping unencodable frame");
                        continue;
                    }
                };
                if ws_write.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                        Ok(frame) => {
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(peer = %peer_id, error = %e, "Malformed frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(peer = %peer_id, error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
