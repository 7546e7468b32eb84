//! STATUS_UPDATE exchange.

use chrono::{DateTime, Utc};
use fleet_id::{ControllerId, HostId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    #[serde(default)]
    pub connected_hosts: u32,
    #[serde(default)]
    pub total_hosts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub status_message: String,
}

/// Periodic liveness report sent once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub controller_id: ControllerId,
    /// Sender's monotonic clock, milliseconds.
    pub timestamp: i64,
    pub status: NodeStatus,
    pub metrics: ResourceMetrics,
    #[serde(default)]
    pub services: Vec<ServiceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusAck {
    pub received: bool,
    pub server_time: DateTime<Utc>,
}

impl StatusAck {
    pub fn now() -> Self {
        Self {
            received: true,
            server_time: Utc::now(),
        }
    }
}

/// Host state a controller forwards upward as a sync message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStateReport {
    pub host_id: HostId,
    /// When the controller applied the host's message.
    pub received_at: DateTime<Utc>,
    pub state: serde_json::Value,
}
