//! Configuration for the controller.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleet_id::{ControllerId, HostId, SiteId};
use fleet_link::{BackoffPolicy, BreakerConfig, FailoverConfig, ReconnectPolicy, SupervisorConfig};

/// A host agent this controller keeps a link to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEndpoint {
    pub host_id: HostId,
    /// `ws://` or `wss://` URL of the host agent.
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub controller_id: ControllerId,

    /// Base URL of the admin, e.g. `http://admin.local:7400`.
    pub admin_url: String,

    /// Port of this controller's local web admin, advertised at registration.
    pub listen_port: u16,

    pub hostname: String,
    pub site_id: Option<SiteId>,
    pub location: Option<String>,

    /// When false only the polling transport is used.
    pub stream_enabled: bool,

    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub breaker: BreakerConfig,

    pub primary_timeout: Duration,
    pub fallback_delay: Duration,
    pub failover_max_rounds: u32,

    /// Pause between polls that returned nothing.
    pub poll_interval: Duration,

    /// The admin link is closed after this long without traffic.
    pub presence_timeout: Duration,

    /// A host link is closed after this long without traffic.
    pub host_timeout: Duration,

    pub hosts: Vec<HostEndpoint>,

    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_id: ControllerId::new(),
            admin_url: "http://127.0.0.1:7400".to_string(),
            listen_port: 7401,
            hostname: "localhost".to_string(),
            site_id: None,
            location: None,
            stream_enabled: true,
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            breaker: BreakerConfig::default(),
            primary_timeout: Duration::from_secs(10),
            fallback_delay: Duration::from_millis(2_000),
            failover_max_rounds: 5,
            poll_interval: Duration::from_millis(1_000),
            presence_timeout: Duration::from_secs(120),
            host_timeout: Duration::from_secs(60),
            hosts: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

fn env_or<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .with_context(|| format!("invalid {key}"))
}

impl Config {
    /// Load configuration from `FLEET_*` environment variables.
    pub fn from_env() -> Result<Self> {
        // A fixed id keeps the node record stable across restarts.
        let controller_id = match std::env::var("FLEET_CONTROLLER_ID") {
            Ok(raw) => raw.parse().context("invalid FLEET_CONTROLLER_ID")?,
            Err(_) => ControllerId::new(),
        };

        let admin_url = std::env::var("FLEET_ADMIN_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:7400".to_string())
            .trim_end_matches('/')
            .to_string();

        let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

        let site_id: Option<SiteId> = std::env::var("FLEET_SITE_ID")
            .ok()
            .map(|raw| raw.parse())
            .transpose()
            .context("invalid FLEET_SITE_ID")?;

        let max_attempts: u32 = env_or("FLEET_MAX_RECONNECT_ATTEMPTS", "0")?;

        let hosts = parse_hosts(&std::env::var("FLEET_HOSTS").unwrap_or_default())?;

        Ok(Self {
            controller_id,
            admin_url,
            listen_port: env_or("FLEET_CONTROLLER_LISTEN_PORT", "7401")?,
            hostname,
            site_id,
            location: std::env::var("FLEET_LOCATION").ok(),
            stream_enabled: env_or("FLEET_STREAM_ENABLED", "true")?,
            heartbeat_interval: Duration::from_secs(env_or("FLEET_HEARTBEAT_INTERVAL_SECS", "30")?),
            reconnect: ReconnectPolicy {
                backoff: BackoffPolicy {
                    base: Duration::from_millis(env_or("FLEET_RECONNECT_BASE_MS", "1000")?),
                    max: Duration::from_millis(env_or("FLEET_RECONNECT_MAX_MS", "30000")?),
                },
                max_attempts: (max_attempts > 0).then_some(max_attempts),
            },
            breaker: BreakerConfig {
                failure_threshold: env_or("FLEET_BREAKER_THRESHOLD", "5")?,
                cooldown: Duration::from_secs(env_or("FLEET_BREAKER_COOLDOWN_SECS", "60")?),
                half_open_max_calls: env_or("FLEET_BREAKER_HALF_OPEN_CALLS", "3")?,
            },
            primary_timeout: Duration::from_secs(env_or("FLEET_PRIMARY_TIMEOUT_SECS", "10")?),
            fallback_delay: Duration::from_millis(env_or("FLEET_FALLBACK_DELAY_MS", "2000")?),
            failover_max_rounds: env_or("FLEET_FAILOVER_MAX_ROUNDS", "5")?,
            poll_interval: Duration::from_millis(env_or("FLEET_POLL_INTERVAL_MS", "1000")?),
            presence_timeout: Duration::from_secs(env_or("FLEET_PRESENCE_TIMEOUT_SECS", "120")?),
            host_timeout: Duration::from_secs(env_or("FLEET_HOST_TIMEOUT_SECS", "60")?),
            hosts,
            log_level: std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// WebSocket endpoint of the admin for this controller.
    pub fn stream_url(&self) -> String {
        let base = if let Some(rest) = self.admin_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.admin_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.admin_url.clone()
        };
        format!("{base}/v1/link/stream?controller_id={}", self.controller_id)
    }

    pub fn poll_url(&self) -> String {
        format!("{}/v1/link/poll", self.admin_url)
    }

    pub fn web_admin_url(&self) -> String {
        format!("http://{}:{}", self.hostname, self.listen_port)
    }

    pub fn failover(&self) -> FailoverConfig {
        FailoverConfig {
            primary_timeout: self.primary_timeout,
            fallback_delay: self.fallback_delay,
            max_rounds: self.failover_max_rounds,
            round_backoff: self.reconnect.backoff.clone(),
            primary_enabled: self.stream_enabled,
        }
    }

    /// Supervisor settings for the admin link. The failover coordinator
    /// owns reconnection, so only liveness and breaker settings matter.
    pub fn admin_supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            liveness_timeout: self.presence_timeout,
            breaker: self.breaker.clone(),
            ..SupervisorConfig::default()
        }
    }

    pub fn host_supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            liveness_timeout: self.host_timeout,
            reconnect: self.reconnect.clone(),
            breaker: self.breaker.clone(),
            ..SupervisorConfig::default()
        }
    }
}

/// Parse `host_id=ws://addr` entries separated by commas.
pub fn parse_hosts(raw: &str) -> Result<Vec<HostEndpoint>> {
    let mut hosts = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((id, address)) = entry.split_once('=') else {
            bail!("host entry '{entry}' is not of the form host_id=url");
        };
        let host_id: HostId = id
            .trim()
            .parse()
            .with_context(|| format!("invalid host id in '{entry}'"))?;
        let address = address.trim();
        if !(address.starts_with("ws://") || address.starts_with("wss://")) {
            bail!("host address '{address}' must be a ws:// or wss:// URL");
        }
        if hosts.iter().any(|h: &HostEndpoint| h.host_id == host_id) {
            bail!("host {host_id} listed twice");
        }
        hosts.push(HostEndpoint {
            host_id,
            address: address.to_string(),
        });
    }
    Ok(hosts)
}
