use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_id::SiteId;
use fleet_link::SupervisorConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,

    /// Controllers silent for longer than this are treated as gone.
    pub presence_timeout: Duration,
    pub liveness_sweep_interval: Duration,
    pub command_timeout: Duration,

    /// Where durable pending-sync flags live. In memory when unset.
    pub pending_sync_path: Option<PathBuf>,

    /// Upper bound on how long a poll request is held open.
    pub poll_wait: Duration,

    /// Site bound to controllers that register without one.
    pub default_site_id: Option<SiteId>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7400)),
            log_level: "info".to_string(),
            presence_timeout: Duration::from_secs(120),
            liveness_sweep_interval: Duration::from_secs(30),
            command_timeout: Duration::from_millis(30_000),
            pending_sync_path: None,
            poll_wait: Duration::from_millis(5_000),
            default_site_id: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("FLEET_ADMIN_LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:7400".to_string())
            .parse()
            .context("FLEET_ADMIN_LISTEN_ADDR")?;

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let presence_timeout_secs: u64 = std::env::var("FLEET_PRESENCE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .context("FLEET_PRESENCE_TIMEOUT_SECS")?;

        let sweep_secs: u64 = std::env::var("FLEET_LIVENESS_SWEEP_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .context("FLEET_LIVENESS_SWEEP_SECS")?;

        let command_timeout_ms: u64 = std::env::var("FLEET_COMMAND_TIMEOUT_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse()
            .context("FLEET_COMMAND_TIMEOUT_MS")?;

        let pending_sync_path = std::env::var("FLEET_PENDING_SYNC_PATH")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let poll_wait_ms: u64 = std::env::var("FLEET_POLL_WAIT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .context("FLEET_POLL_WAIT_MS")?;

        let default_site_id = match std::env::var("FLEET_DEFAULT_SITE_ID") {
            Ok(v) if !v.is_empty() => Some(v.parse().context("FLEET_DEFAULT_SITE_ID")?),
            _ => None,
        };

        Ok(Self {
            listen_addr,
            log_level,
            presence_timeout: Duration::from_secs(presence_timeout_secs),
            liveness_sweep_interval: Duration::from_secs(sweep_secs),
            command_timeout: Duration::from_millis(command_timeout_ms),
            pending_sync_path,
            poll_wait: Duration::from_millis(poll_wait_ms),
            default_site_id,
        })
    }

    /// Supervisor settings for inbound controller links.
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            liveness_timeout: self.presence_timeout,
            sweep_interval: self.liveness_sweep_interval,
            ..SupervisorConfig::default()
        }
    }
}
