//! Directory of controllers known to the admin.
//!
//! A record is created on first registration and updated on every later
//! registration and status update. Records are never removed while the
//! process runs; going offline only flips `online`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use fleet_id::{ControllerId, PeerId, SiteId};
use fleet_proto::{
    NodeStatus, RegistrationRequest, ResourceMetrics, ServiceStatus, StatusUpdate, SystemInfo,
};
use fleet_sync::SyncMessageType;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct NodeRecord {
    pub controller_id: ControllerId,
    pub hostname: String,
    pub mac_address: String,
    pub local_network: String,
    pub version: String,
    pub location: Option<String>,
    pub site_id: Option<SiteId>,
    pub mdns_service: String,
    pub web_admin_url: String,
    pub system_info: SystemInfo,
    pub capabilities: Vec<String>,

    pub online: bool,
    pub status: Option<NodeStatus>,
    pub metrics: ResourceMetrics,
    pub services: Vec<ServiceStatus>,
    pub last_error: Option<String>,

    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,

    /// Latest host state forwarded by this controller, keyed by host then
    /// message type.
    pub hosts: BTreeMap<PeerId, BTreeMap<SyncMessageType, serde_json::Value>>,
}

impl NodeRecord {
    fn from_registration(request: &RegistrationRequest, site_id: Option<SiteId>) -> Self {
        let now = Utc::now();
        Self {
            controller_id: request.controller_id,
            hostname: request.hostname.clone(),
            mac_address: request.mac_address.clone(),
            local_network: request.local_network.clone(),
            version: request.version.clone(),
            location: request.location.clone(),
            site_id,
            mdns_service: request.mdns_service.clone(),
            web_admin_url: request.web_admin_url.clone(),
            system_info: request.system_info.clone(),
            capabilities: request.capabilities.clone(),
            online: true,
            status: None,
            metrics: ResourceMetrics::default(),
            services: Vec::new(),
            last_error: None,
            registered_at: now,
            last_seen_at: now,
            hosts: BTreeMap::new(),
        }
    }
}

/// Outcome of applying a registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub site_id: Option<SiteId>,
    pub created: bool,
}

/// Shared, in-process node directory.
#[derive(Clone, Default)]
pub struct NodeStore {
    inner: Arc<RwLock<HashMap<ControllerId, NodeRecord>>>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ControllerId, NodeRecord>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ControllerId, NodeRecord>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create or update the record for `request.controller_id`.
    ///
    /// The site binding is taken from the request when present, otherwise
    /// an existing binding is kept, otherwise `default_site` is used.
    pub fn register(
        &self,
        request: &RegistrationRequest,
        default_site: Option<SiteId>,
    ) -> Registered {
        let mut nodes = self.write();
        match nodes.get_mut(&request.controller_id) {
            Some(record) => {
                let site_id = request.site_id.or(record.site_id).or(default_site);
                let hosts = std::mem::take(&mut record.hosts);
                let registered_at = record.registered_at;
                *record = NodeRecord {
                    registered_at,
                    hosts,
                    ..NodeRecord::from_registration(request, site_id)
                };
                Registered {
                    site_id,
                    created: false,
                }
            }
            None => {
                let site_id = request.site_id.or(default_site);
                nodes.insert(
                    request.controller_id,
                    NodeRecord::from_registration(request, site_id),
                );
                Registered {
                    site_id,
                    created: true,
                }
            }
        }
    }

    /// Apply a status update. Returns false for unknown controllers.
    pub fn apply_status(&self, update: &StatusUpdate) -> bool {
        let mut nodes = self.write();
        let Some(record) = nodes.get_mut(&update.controller_id) else {
            return false;
        };
        record.online = update.status == NodeStatus::Online;
        record.status = Some(update.status);
        record.metrics = update.metrics.clone();
        record.services = update.services.clone();
        record.last_error = update.last_error.clone();
        record.last_seen_at = Utc::now();
        true
    }

    /// Store the latest state a controller forwarded for one of its hosts.
    pub fn record_host_state(
        &self,
        controller_id: ControllerId,
        host: PeerId,
        message_type: SyncMessageType,
        state: serde_json::Value,
    ) -> bool {
        let mut nodes = self.write();
        let Some(record) = nodes.get_mut(&controller_id) else {
            return false;
        };
        record
            .hosts
            .entry(host)
            .or_default()
            .insert(message_type, state);
        record.last_seen_at = Utc::now();
        true
    }

    pub fn mark_offline(&self, controller_id: ControllerId) {
        if let Some(record) = self.write().get_mut(&controller_id) {
            record.online = false;
        }
    }

    pub fn get(&self, controller_id: ControllerId) -> Option<NodeRecord> {
        self.read().get(&controller_id).cloned()
    }

    /// Every known controller, sorted by id.
    pub fn controller_ids(&self) -> Vec<ControllerId> {
        let mut ids: Vec<ControllerId> = self.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn list(&self) -> Vec<NodeRecord> {
        let mut records: Vec<NodeRecord> = self.read().values().cloned().collect();
        records.sort_by_key(|r| r.controller_id);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(controller_id: ControllerId, site_id: Option<SiteId>) -> RegistrationRequest {
        RegistrationRequest {
            controller_id,
            hostname: "lobby-controller".to_string(),
            mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
            local_network: "10.0.0.0/24".to_string(),
            version: "1.4.0".to_string(),
            location: None,
            site_id,
            mdns_service: "_fleet._tcp.local".to_string(),
            web_admin_url: "http://10.0.0.2:7401".to_string(),
            system_info: SystemInfo::default(),
            capabilities: vec!["dashboards".to_string()],
            timestamp: 1,
        }
    }

    #[test]
    fn test_register_creates_then_updates() {
        let store = NodeStore::new();
        let id = ControllerId::new();

        let first = store.register(&request(id, None), None);
        assert!(first.created);

        let mut again = request(id, None);
        again.version = "1.5.0".to_string();
        let second = store.register(&again, None);
        assert!(!second.created);
        assert_eq!(store.get(id).unwrap().version, "1.5.0");
        assert_eq!(store.controller_ids(), vec![id]);
    }

    #[test]
    fn test_site_binding_precedence() {
        let store = NodeStore::new();
        let id = ControllerId::new();
        let default_site = SiteId::new();
        let declared = SiteId::new();

        assert_eq!(
            store.register(&request(id, None), Some(default_site)).site_id,
            Some(default_site)
        );
        // A later registration without a site keeps the existing binding.
        assert_eq!(
            store.register(&request(id, None), None).site_id,
            Some(default_site)
        );
        assert_eq!(
            store.register(&request(id, Some(declared)), Some(default_site)).site_id,
            Some(declared)
        );
    }

    #[test]
    fn test_status_for_unknown_controller_is_ignored() {
        let store = NodeStore::new();
        let update = StatusUpdate {
            controller_id: ControllerId::new(),
            timestamp: 1,
            status: NodeStatus::Online,
            metrics: ResourceMetrics::default(),
            services: Vec::new(),
            last_error: None,
        };
        assert!(!store.apply_status(&update));
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_host_state_survives_reregistration() {
        let store = NodeStore::new();
        let id = ControllerId::new();
        let host = PeerId::Host(fleet_id::HostId::new());
        store.register(&request(id, None), None);
        store.record_host_state(
            id,
            host,
            SyncMessageType::Metrics,
            serde_json::json!({ "cpu": 12 }),
        );

        store.register(&request(id, None), None);

        let record = store.get(id).unwrap();
        assert_eq!(
            record.hosts[&host][&SyncMessageType::Metrics],
            serde_json::json!({ "cpu": 12 })
        );
    }
}
