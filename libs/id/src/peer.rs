//! Peer identifiers.

use serde::{Deserialize, Serialize};

use crate::{ControllerId, HostId, IdError};

/// Tier a peer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Admin,
    Controller,
    Host,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Admin => write!(f, "admin"),
            PeerRole::Controller => write!(f, "controller"),
            PeerRole::Host => write!(f, "host"),
        }
    }
}

/// Identifier of the node at the other end of a link.
///
/// There is exactly one admin per fleet, so it carries no ULID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeerId {
    Admin,
    Controller(ControllerId),
    Host(HostId),
}

impl PeerId {
    /// The literal used for the admin peer.
    pub const ADMIN: &'static str = "admin";

    #[must_use]
    pub fn role(&self) -> PeerRole {
        match self {
            PeerId::Admin => PeerRole::Admin,
            PeerId::Controller(_) => PeerRole::Controller,
            PeerId::Host(_) => PeerRole::Host,
        }
    }

    #[must_use]
    pub fn as_controller(&self) -> Option<ControllerId> {
        match self {
            PeerId::Controller(id) => Some(*id),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_host(&self) -> Option<HostId> {
        match self {
            PeerId::Host(id) => Some(*id),
            _ => None,
        }
    }

    /// Parses a peer id from its display form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s == Self::ADMIN {
            return Ok(PeerId::Admin);
        }
        match s.split_once('_') {
            Some((ControllerId::PREFIX, _)) => ControllerId::parse(s).map(PeerId::Controller),
            Some((HostId::PREFIX, _)) => HostId::parse(s).map(PeerId::Host),
            _ => Err(IdError::UnknownPeer(s.to_string())),
        }
    }
}

impl From<ControllerId> for PeerId {
    fn from(id: ControllerId) -> Self {
        PeerId::Controller(id)
    }
}

impl From<HostId> for PeerId {
    fn from(id: HostId) -> Self {
        PeerId::Host(id)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerId::Admin => f.write_str(Self::ADMIN),
            PeerId::Controller(id) => write!(f, "{id}"),
            PeerId::Host(id) => write!(f, "{id}"),
        }
    }
}

impl std::str::FromStr for PeerId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for PeerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_parse_each_role() {
        let ctl = ControllerId::new();
        let host = HostId::new();

        assert_eq!(PeerId::parse("admin").unwrap(), PeerId::Admin);
        assert_eq!(
            PeerId::parse(&ctl.to_string()).unwrap(),
            PeerId::Controller(ctl)
        );
        assert_eq!(PeerId::parse(&host.to_string()).unwrap(), PeerId::Host(host));
    }

    #[test]
    fn test_peer_id_unknown() {
        assert!(matches!(
            PeerId::parse("site_01HV4Z2WQXKJNM8GPQY6VBKC3D").unwrap_err(),
            IdError::UnknownPeer(_)
        ));
        assert!(matches!(
            PeerId::parse("192.168.1.4:50051").unwrap_err(),
            IdError::UnknownPeer(_)
        ));
    }

    #[test]
    fn test_peer_id_role_and_json() {
        let peer = PeerId::from(HostId::new());
        assert_eq!(peer.role(), PeerRole::Host);
        assert!(peer.as_controller().is_none());

        let json = serde_json::to_string(&peer).unwrap();
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer);
    }
}
