//! Peer directory.
//!
//! Identities live in an arena; a [`PeerId`] is only a key into it. Nothing
//! in the link layer derives an address from an id.

use std::collections::HashMap;

use fleet_id::{PeerId, PeerRole};

/// Where and what a peer is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub id: PeerId,
    pub role: PeerRole,
    /// Transport-specific address, e.g. a `ws://` URL.
    pub address: String,
}

impl PeerIdentity {
    pub fn new(id: PeerId, address: impl Into<String>) -> Self {
        Self {
            id,
            role: id.role(),
            address: address.into(),
        }
    }
}

/// Index into a [`PeerDirectory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey(usize);

#[derive(Debug, Default)]
pub struct PeerDirectory {
    entries: Vec<PeerIdentity>,
    index: HashMap<PeerId, PeerKey>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a peer. Keys are stable across updates.
    pub fn upsert(&mut self, identity: PeerIdentity) -> PeerKey {
        if let Some(&key) = self.index.get(&identity.id) {
            self.entries[key.0] = identity;
            return key;
        }
        let key = PeerKey(self.entries.len());
        self.index.insert(identity.id, key);
        self.entries.push(identity);
        key
    }

    pub fn key(&self, id: PeerId) -> Option<PeerKey> {
        self.index.get(&id).copied()
    }

    pub fn get(&self, key: PeerKey) -> Option<&PeerIdentity> {
        self.entries.get(key.0)
    }

    pub fn resolve(&self, id: PeerId) -> Option<&PeerIdentity> {
        self.key(id).and_then(|key| self.get(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerIdentity> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
