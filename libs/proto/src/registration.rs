//! REGISTRATION exchange.

use fleet_id::{ControllerId, SiteId};
use serde::{Deserialize, Serialize};

use crate::ProtoError;

/// Host facts reported at registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    #[serde(default)]
    pub cpu_cores: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub uptime_secs: u64,
}

/// Self-declared identity sent once per connection, right after the
/// liveness check succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub controller_id: ControllerId,
    pub hostname: String,
    pub mac_address: String,
    pub local_network: String,
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<SiteId>,

    /// mDNS-style service descriptor, e.g. `_fleet._tcp.local`.
    pub mdns_service: String,
    pub web_admin_url: String,
    pub system_info: SystemInfo,

    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Sender's monotonic clock, milliseconds.
    pub timestamp: i64,
}

impl RegistrationRequest {
    /// Structural checks. A request failing these is rejected without a
    /// retry suggestion.
    pub fn validate(&self) -> Result<(), ProtoError> {
        if self.hostname.trim().is_empty() {
            return Err(ProtoError::MissingField("hostname"));
        }
        if self.version.trim().is_empty() {
            return Err(ProtoError::MissingField("version"));
        }
        if !self.mac_address.is_empty() && !is_mac(&self.mac_address) {
            return Err(ProtoError::InvalidField {
                field: "mac_address",
                reason: format!("'{}' is not a MAC address", self.mac_address),
            });
        }
        if self.timestamp < 0 {
            return Err(ProtoError::InvalidField {
                field: "timestamp",
                reason: "must not be negative".to_string(),
            });
        }
        Ok(())
    }
}

fn is_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split([':', '-']).collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_controller_id: Option<ControllerId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_site_id: Option<SiteId>,

    /// Only meaningful on rejection. When false the sender must not
    /// register again on this connection.
    #[serde(default)]
    pub retry_suggested: bool,
}

impl RegistrationResponse {
    pub fn accepted(controller_id: ControllerId, site_id: Option<SiteId>) -> Self {
        Self {
            success: true,
            message: None,
            assigned_controller_id: Some(controller_id),
            assigned_site_id: site_id,
            retry_suggested: false,
        }
    }

    pub fn rejected(message: impl Into<String>, retry_suggested: bool) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            assigned_controller_id: None,
            assigned_site_id: None,
            retry_suggested,
        }
    }
}
