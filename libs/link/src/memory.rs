//! In-process transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::transport::DEFAULT_CHANNEL_CAPACITY;
use crate::{Connection, LinkError, PeerIdentity, Transport};

/// Routes `open` calls to listeners registered under an address.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    listeners: Arc<Mutex<HashMap<String, mpsc::Sender<Connection>>>>,
}

/// Accept side of a [`MemoryTransport`] address.
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::Receiver<Connection>,
}

impl MemoryListener {
    pub async fn accept(&mut self) -> Option<Connection> {
        self.incoming.recv().await
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `address`, replacing any previous listener.
    pub fn listen(&self, address: impl Into<String>) -> MemoryListener {
        let (tx, rx) = mpsc::channel(16);
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.into(), tx);
        MemoryListener { incoming: rx }
    }

    /// Stop accepting on `address`. Existing connections stay open.
    pub fn unlisten(&self, address: &str) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn open(&self, peer: &PeerIdentity) -> Result<Connection, LinkError> {
        let listener = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&peer.address)
            .cloned()
            .ok_or_else(|| {
                LinkError::Unavailable(format!("nothing listening on {}", peer.address))
            })?;

        let (local, remote) = Connection::pair(DEFAULT_CHANNEL_CAPACITY);
        listener
            .send(remote)
            .await
            .map_err(|_| LinkError::Unavailable(format!("listener on {} closed", peer.address)))?;
        Ok(local)
    }
}
