//! Dashboard and cookie state pushed down by the admin.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use fleet_proto::{Command, CookieDomain, Dashboard, SyncType};
use serde::Serialize;
use tracing::{debug, info};

/// Result of applying one fleet sync command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncApplied {
    /// False when the command was older than what is already applied.
    pub applied: bool,
    /// Entries held after the command.
    pub total: usize,
}

#[derive(Debug, Default)]
struct Inner {
    dashboards: BTreeMap<String, Dashboard>,
    dashboards_synced_at: Option<i64>,
    cookie_domains: BTreeMap<String, CookieDomain>,
    cookies_synced_at: Option<i64>,
}

/// Latest fleet-wide dashboards and cookies, keyed by dashboard id and
/// cookie domain.
#[derive(Debug, Clone, Default)]
pub struct FleetState {
    inner: Arc<RwLock<Inner>>,
}

impl FleetState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a fleet sync command. A full sync replaces the set, an
    /// incremental one upserts into it. Syncs older than the last applied
    /// one of the same kind are ignored. Returns `None` for commands that
    /// are not fleet syncs.
    pub fn apply(&self, command: &Command) -> Option<SyncApplied> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *guard;
        match command {
            Command::DashboardSync {
                dashboards,
                sync_timestamp,
                sync_type,
            } => {
                let applied = merge(
                    &mut inner.dashboards,
                    &mut inner.dashboards_synced_at,
                    dashboards.iter().map(|d| (d.id.clone(), d.clone())),
                    *sync_timestamp,
                    *sync_type,
                );
                log_sync("dashboards", applied, inner.dashboards.len(), *sync_timestamp);
                Some(SyncApplied {
                    applied,
                    total: inner.dashboards.len(),
                })
            }
            Command::CookieSync {
                cookie_domains,
                sync_timestamp,
                sync_type,
            } => {
                let applied = merge(
                    &mut inner.cookie_domains,
                    &mut inner.cookies_synced_at,
                    cookie_domains.iter().map(|c| (c.domain.clone(), c.clone())),
                    *sync_timestamp,
                    *sync_type,
                );
                log_sync("cookies", applied, inner.cookie_domains.len(), *sync_timestamp);
                Some(SyncApplied {
                    applied,
                    total: inner.cookie_domains.len(),
                })
            }
            _ => None,
        }
    }

    pub fn dashboards(&self) -> Vec<Dashboard> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.dashboards.values().cloned().collect()
    }

    pub fn cookie_domains(&self) -> Vec<CookieDomain> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.cookie_domains.values().cloned().collect()
    }
}

fn merge<T>(
    current: &mut BTreeMap<String, T>,
    synced_at: &mut Option<i64>,
    incoming: impl Iterator<Item = (String, T)>,
    sync_timestamp: i64,
    sync_type: SyncType,
) -> bool {
    if synced_at.is_some_and(|at| sync_timestamp < at) {
        return false;
    }
    if sync_type == SyncType::Full {
        current.clear();
    }
    current.extend(incoming);
    *synced_at = Some(sync_timestamp);
    true
}

fn log_sync(kind: &'static str, applied: bool, total: usize, sync_timestamp: i64) {
    if applied {
        info!(kind, total, sync_timestamp, "Fleet sync applied");
    } else {
        debug!(kind, sync_timestamp, "Ignoring stale fleet sync");
    }
}
