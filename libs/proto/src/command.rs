//! Command envelopes and responses.

use fleet_id::{CommandId, PeerId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Full,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dashboard {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_interval_secs: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CookieDomain {
    pub domain: String,
    /// Cookie objects as exported by the browser.
    #[serde(default)]
    pub cookies: Vec<serde_json::Value>,
}

/// Work a peer is asked to perform.
///
/// Serialized as `{"type": "DASHBOARD_SYNC", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    DashboardSync {
        dashboards: Vec<Dashboard>,
        sync_timestamp: i64,
        sync_type: SyncType,
    },
    CookieSync {
        cookie_domains: Vec<CookieDomain>,
        sync_timestamp: i64,
        sync_type: SyncType,
    },
    TakeScreenshot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_id: Option<String>,
    },
    IdentifyDisplays {
        duration_secs: u32,
    },
    RestartBrowser {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_id: Option<String>,
    },
}

impl Command {
    pub fn command_type(&self) -> &'static str {
        match self {
            Command::DashboardSync { .. } => "DASHBOARD_SYNC",
            Command::CookieSync { .. } => "COOKIE_SYNC",
            Command::TakeScreenshot { .. } => "TAKE_SCREENSHOT",
            Command::IdentifyDisplays { .. } => "IDENTIFY_DISPLAYS",
            Command::RestartBrowser { .. } => "RESTART_BROWSER",
        }
    }

    /// Fleet-wide sync commands are handled by the controller itself;
    /// everything else is forwarded to a host.
    pub fn is_fleet_sync(&self) -> bool {
        matches!(self, Command::DashboardSync { .. } | Command::CookieSync { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_id: CommandId,
    /// Peer expected to execute the command.
    pub target: PeerId,
    /// Sender's monotonic clock, milliseconds.
    pub timestamp: i64,
    #[serde(flatten)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: CommandId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub timestamp: i64,
}

impl CommandResponse {
    pub fn ok(command_id: CommandId, result: Option<serde_json::Value>, timestamp: i64) -> Self {
        Self {
            command_id,
            success: true,
            error_message: None,
            result,
            timestamp,
        }
    }

    pub fn failed(command_id: CommandId, error_message: impl Into<String>, timestamp: i64) -> Self {
        Self {
            command_id,
            success: false,
            error_message: Some(error_message.into()),
            result: None,
            timestamp,
        }
    }
}
