//! Durable pending-sync flags.
//!
//! A flag says "this controller missed a broadcast of this kind and must get
//! a full sync when it next registers". Flags are set when a controller is
//! offline at broadcast time or the send fails, and cleared only after the
//! controller acknowledges a sync of that kind.
//!
//! The store also keeps a snapshot of each kind: every broadcast folded
//! together, so a full sync of it brings a controller level with the fleet
//! no matter which broadcasts it missed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::ControllerId;
use fleet_proto::{Command, SyncType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Version of the on-disk format.
const STATE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("pending-sync store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("pending-sync store is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Which broadcast a flag refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Dashboards,
    Cookies,
}

impl SyncKind {
    pub fn of(command: &Command) -> Option<SyncKind> {
        match command {
            Command::DashboardSync { .. } => Some(SyncKind::Dashboards),
            Command::CookieSync { .. } => Some(SyncKind::Cookies),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncKind::Dashboards => write!(f, "dashboards"),
            SyncKind::Cookies => write!(f, "cookies"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSyncFlag {
    pub kinds: BTreeSet<SyncKind>,
    /// When the oldest outstanding kind was flagged.
    pub flagged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingState {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub flags: BTreeMap<ControllerId, PendingSyncFlag>,
    #[serde(default, alias = "latest")]
    pub snapshots: BTreeMap<SyncKind, Command>,
}

impl PendingState {
    fn new() -> Self {
        Self {
            version: STATE_VERSION,
            ..Self::default()
        }
    }

    fn mark(&mut self, controller_id: ControllerId, kind: SyncKind) -> bool {
        let flag = self
            .flags
            .entry(controller_id)
            .or_insert_with(|| PendingSyncFlag {
                kinds: BTreeSet::new(),
                flagged_at: Utc::now(),
            });
        flag.kinds.insert(kind)
    }

    fn record(&mut self, kind: SyncKind, command: &Command) {
        let snapshot = fold(self.snapshots.remove(&kind), command);
        self.snapshots.insert(kind, snapshot);
    }

    fn clear(&mut self, controller_id: ControllerId, kind: SyncKind) -> bool {
        let Some(flag) = self.flags.get_mut(&controller_id) else {
            return false;
        };
        let removed = flag.kinds.remove(&kind);
        if flag.kinds.is_empty() {
            self.flags.remove(&controller_id);
        }
        removed
    }
}

/// Fold `command` into the snapshot of its kind. A full broadcast replaces the
/// snapshot; an incremental one upserts into it by dashboard id or cookie
/// domain. The result is always a full sync.
pub fn fold(snapshot: Option<Command>, command: &Command) -> Command {
    match (snapshot, command) {
        (
            Some(Command::DashboardSync {
                dashboards: mut current,
                ..
            }),
            Command::DashboardSync {
                dashboards,
                sync_timestamp,
                sync_type: SyncType::Incremental,
            },
        ) => {
            upsert(&mut current, dashboards, |d| d.id.as_str());
            Command::DashboardSync {
                dashboards: current,
                sync_timestamp: *sync_timestamp,
                sync_type: SyncType::Full,
            }
        }
        (
            Some(Command::CookieSync {
                cookie_domains: mut current,
                ..
            }),
            Command::CookieSync {
                cookie_domains,
                sync_timestamp,
                sync_type: SyncType::Incremental,
            },
        ) => {
            upsert(&mut current, cookie_domains, |c| c.domain.as_str());
            Command::CookieSync {
                cookie_domains: current,
                sync_timestamp: *sync_timestamp,
                sync_type: SyncType::Full,
            }
        }
        (
            _,
            Command::DashboardSync {
                dashboards,
                sync_timestamp,
                ..
            },
        ) => Command::DashboardSync {
            dashboards: dashboards.clone(),
            sync_timestamp: *sync_timestamp,
            sync_type: SyncType::Full,
        },
        (
            _,
            Command::CookieSync {
                cookie_domains,
                sync_timestamp,
                ..
            },
        ) => Command::CookieSync {
            cookie_domains: cookie_domains.clone(),
            sync_timestamp: *sync_timestamp,
            sync_type: SyncType::Full,
        },
        (_, other) => other.clone(),
    }
}

fn upsert<T: Clone>(current: &mut Vec<T>, incoming: &[T], key: impl Fn(&T) -> &str) {
    for item in incoming {
        match current.iter_mut().find(|c| key(&**c) == key(item)) {
            Some(slot) => *slot = item.clone(),
            None => current.push(item.clone()),
        }
    }
}

/// Storage for pending-sync flags and the broadcast snapshots.
#[async_trait]
pub trait PendingSyncStore: Send + Sync {
    /// Flag `controller_id` as missing `kind`.
    async fn mark(&self, controller_id: ControllerId, kind: SyncKind) -> Result<(), StoreError>;

    async fn clear(&self, controller_id: ControllerId, kind: SyncKind) -> Result<(), StoreError>;

    async fn flag(&self, controller_id: ControllerId)
        -> Result<Option<PendingSyncFlag>, StoreError>;

    async fn flags(&self) -> Result<BTreeMap<ControllerId, PendingSyncFlag>, StoreError>;

    /// Fold a broadcast into the snapshot of `kind`.
    async fn record_broadcast(&self, kind: SyncKind, command: &Command)
        -> Result<(), StoreError>;

    /// Full sync of everything broadcast for `kind` so far.
    async fn snapshot(&self, kind: SyncKind) -> Result<Option<Command>, StoreError>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// Flags that last only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryPendingStore {
    state: Mutex<PendingState>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PendingState::new()),
        }
    }
}

#[async_trait]
impl PendingSyncStore for MemoryPendingStore {
    async fn mark(&self, controller_id: ControllerId, kind: SyncKind) -> Result<(), StoreError> {
        self.state.lock().await.mark(controller_id, kind);
        Ok(())
    }

    async fn clear(&self, controller_id: ControllerId, kind: SyncKind) -> Result<(), StoreError> {
        self.state.lock().await.clear(controller_id, kind);
        Ok(())
    }

    async fn flag(
        &self,
        controller_id: ControllerId,
    ) -> Result<Option<PendingSyncFlag>, StoreError> {
        Ok(self.state.lock().await.flags.get(&controller_id).cloned())
    }

    async fn flags(&self) -> Result<BTreeMap<ControllerId, PendingSyncFlag>, StoreError> {
        Ok(self.state.lock().await.flags.clone())
    }

    async fn record_broadcast(
        &self,
        kind: SyncKind,
        command: &Command,
    ) -> Result<(), StoreError> {
        self.state.lock().await.record(kind, command);
        Ok(())
    }

    async fn snapshot(&self, kind: SyncKind) -> Result<Option<Command>, StoreError> {
        Ok(self.state.lock().await.snapshots.get(&kind).cloned())
    }
}

// =============================================================================
// JSON file store
// =============================================================================

/// Flags persisted to a JSON file. Every change rewrites the file through a
/// temp file and a rename, so a crash leaves either the old or new state.
#[derive(Debug)]
pub struct JsonFilePendingStore {
    path: PathBuf,
    state: Mutex<PendingState>,
}

impl JsonFilePendingStore {
    /// Load `path`, or start empty if it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let state: PendingState = serde_json::from_str(&content)?;
                if state.version != STATE_VERSION {
                    warn!(
                        file_version = state.version,
                        current_version = STATE_VERSION,
                        "Pending-sync file version mismatch, starting fresh"
                    );
                    PendingState::new()
                } else {
                    info!(
                        path = %path.display(),
                        flagged = state.flags.len(),
                        "Loaded pending-sync flags"
                    );
                    state
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No pending-sync file, starting fresh");
                PendingState::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn persist(&self, state: &PendingState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("tmp");
        let content = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&tmp_path, content).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    /// Apply `change` and write the result. The in-memory state is only
    /// updated if the write succeeds.
    async fn update<F>(&self, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut PendingState) + Send,
    {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        change(&mut next);
        if next == *state {
            return Ok(());
        }
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }
}

#[async_trait]
impl PendingSyncStore for JsonFilePendingStore {
    async fn mark(&self, controller_id: ControllerId, kind: SyncKind) -> Result<(), StoreError> {
        self.update(|state| {
            state.mark(controller_id, kind);
        })
        .await
    }

    async fn clear(&self, controller_id: ControllerId, kind: SyncKind) -> Result<(), StoreError> {
        self.update(|state| {
            state.clear(controller_id, kind);
        })
        .await
    }

    async fn flag(
        &self,
        controller_id: ControllerId,
    ) -> Result<Option<PendingSyncFlag>, StoreError> {
        Ok(self.state.lock().await.flags.get(&controller_id).cloned())
    }

    async fn flags(&self) -> Result<BTreeMap<ControllerId, PendingSyncFlag>, StoreError> {
        Ok(self.state.lock().await.flags.clone())
    }

    async fn record_broadcast(
        &self,
        kind: SyncKind,
        command: &Command,
    ) -> Result<(), StoreError> {
        self.update(|state| state.record(kind, command)).await
    }

    async fn snapshot(&self, kind: SyncKind) -> Result<Option<Command>, StoreError> {
        Ok(self.state.lock().await.snapshots.get(&kind).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_proto::{CookieDomain, Dashboard};

    fn dashboard(id: &str, url: &str) -> Dashboard {
        Dashboard {
            id: id.to_string(),
            url: url.to_string(),
            title: None,
            display_id: None,
            refresh_interval_secs: None,
        }
    }

    fn dashboard_sync(dashboards: Vec<Dashboard>, at: i64, sync_type: SyncType) -> Command {
        Command::DashboardSync {
            dashboards,
            sync_timestamp: at,
            sync_type,
        }
    }

    fn dashboards() -> Command {
        Command::DashboardSync {
            dashboards: vec![Dashboard {
                id: "d1".to_string(),
                url: "https://x".to_string(),
                title: None,
                display_id: None,
                refresh_interval_secs: None,
            }],
            sync_timestamp: 7,
            sync_type: SyncType::Full,
        }
    }

    #[tokio::test]
    async fn test_memory_store_flag_lifecycle() {
        let store = MemoryPendingStore::new();
        let id = ControllerId::new();

        store.mark(id, SyncKind::Dashboards).await.unwrap();
        store.mark(id, SyncKind::Cookies).await.unwrap();
        store.clear(id, SyncKind::Dashboards).await.unwrap();

        let flag = store.flag(id).await.unwrap().unwrap();
        assert_eq!(flag.kinds, BTreeSet::from([SyncKind::Cookies]));

        store.clear(id, SyncKind::Cookies).await.unwrap();
        assert!(store.flag(id).await.unwrap().is_none());
        assert!(store.flags().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_keeps_original_timestamp() {
        let store = MemoryPendingStore::new();
        let id = ControllerId::new();

        store.mark(id, SyncKind::Dashboards).await.unwrap();
        let first = store.flag(id).await.unwrap().unwrap().flagged_at;
        store.mark(id, SyncKind::Cookies).await.unwrap();
        assert_eq!(store.flag(id).await.unwrap().unwrap().flagged_at, first);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("pending.json");
        let id = ControllerId::new();

        {
            let store = JsonFilePendingStore::open(&path).await.unwrap();
            store.mark(id, SyncKind::Dashboards).await.unwrap();
            store
                .record_broadcast(SyncKind::Dashboards, &dashboards())
                .await
                .unwrap();
        }

        let reopened = JsonFilePendingStore::open(&path).await.unwrap();
        let flag = reopened.flag(id).await.unwrap().unwrap();
        assert!(flag.kinds.contains(&SyncKind::Dashboards));
        assert_eq!(
            reopened.snapshot(SyncKind::Dashboards).await.unwrap(),
            Some(dashboards())
        );
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_incremental_broadcast_upserts_into_snapshot() {
        let full = dashboard_sync(
            vec![dashboard("d1", "https://a"), dashboard("d2", "https://b")],
            1,
            SyncType::Full,
        );
        let increment = dashboard_sync(
            vec![dashboard("d2", "https://b2"), dashboard("d3", "https://c")],
            2,
            SyncType::Incremental,
        );

        let snapshot = fold(Some(fold(None, &full)), &increment);

        assert_eq!(
            snapshot,
            dashboard_sync(
                vec![
                    dashboard("d1", "https://a"),
                    dashboard("d2", "https://b2"),
                    dashboard("d3", "https://c"),
                ],
                2,
                SyncType::Full,
            )
        );
    }

    #[test]
    fn test_full_broadcast_replaces_snapshot() {
        let earlier = dashboard_sync(vec![dashboard("d1", "https://a")], 1, SyncType::Full);
        let full = dashboard_sync(vec![dashboard("d9", "https://z")], 2, SyncType::Full);

        assert_eq!(fold(Some(earlier), &full), full);
    }

    #[test]
    fn test_cookie_increment_upserts_by_domain() {
        let cookies = |domains: &[&str], at: i64, sync_type: SyncType| Command::CookieSync {
            cookie_domains: domains
                .iter()
                .map(|domain| CookieDomain {
                    domain: domain.to_string(),
                    cookies: Vec::new(),
                })
                .collect(),
            sync_timestamp: at,
            sync_type,
        };

        let snapshot = fold(
            Some(cookies(&["a.example"], 1, SyncType::Incremental)),
            &cookies(&["b.example", "a.example"], 2, SyncType::Incremental),
        );

        assert_eq!(
            snapshot,
            cookies(&["a.example", "b.example"], 2, SyncType::Full)
        );
    }

    #[tokio::test]
    async fn test_store_folds_recorded_broadcasts() {
        let store = MemoryPendingStore::new();
        store
            .record_broadcast(SyncKind::Dashboards, &dashboards())
            .await
            .unwrap();
        store
            .record_broadcast(
                SyncKind::Dashboards,
                &dashboard_sync(vec![dashboard("d2", "https://y")], 8, SyncType::Incremental),
            )
            .await
            .unwrap();

        assert_eq!(
            store.snapshot(SyncKind::Dashboards).await.unwrap(),
            Some(dashboard_sync(
                vec![dashboard("d1", "https://x"), dashboard("d2", "https://y")],
                8,
                SyncType::Full,
            ))
        );
        assert_eq!(store.snapshot(SyncKind::Cookies).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let err = JsonFilePendingStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_file_store_version_mismatch_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending.json");
        tokio::fs::write(&path, r#"{"version": 99, "flags": {}}"#)
            .await
            .unwrap();

        let store = JsonFilePendingStore::open(&path).await.unwrap();
        assert!(store.flags().await.unwrap().is_empty());
    }
}
