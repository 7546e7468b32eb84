//! Fleet command broadcaster.
//!
//! Pushes dashboard and cookie syncs to every known controller. Every target
//! is flagged in the [`PendingSyncStore`] before its registration is checked,
//! and the flag is cleared only once the controller acknowledges. A flagged
//! controller receives a full sync of the folded snapshot the next time it
//! registers.

use std::sync::Arc;
use std::time::Duration;

use fleet_id::{ControllerId, PeerId};
use fleet_link::{CommandDispatcher, MonotonicClock};
use fleet_proto::{Command, CookieDomain, Dashboard, SyncType};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::nodes::NodeStore;
use crate::pending::{PendingSyncStore, StoreError, SyncKind};

/// Per-controller result of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    pub command_type: &'static str,
    pub sync_timestamp: i64,
    /// Controllers that acknowledged the sync.
    pub delivered: Vec<ControllerId>,
    /// Controllers flagged for catch-up.
    pub pending: Vec<ControllerId>,
}

#[derive(Clone)]
pub struct FleetBroadcaster {
    inner: Arc<BroadcasterInner>,
}

struct BroadcasterInner {
    dispatcher: Arc<CommandDispatcher>,
    nodes: NodeStore,
    store: Arc<dyn PendingSyncStore>,
    clock: Arc<MonotonicClock>,
    timeout: Duration,
}

impl FleetBroadcaster {
    pub fn new(
        dispatcher: Arc<CommandDispatcher>,
        nodes: NodeStore,
        store: Arc<dyn PendingSyncStore>,
        clock: Arc<MonotonicClock>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(BroadcasterInner {
                dispatcher,
                nodes,
                store,
                clock,
                timeout,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn PendingSyncStore> {
        &self.inner.store
    }

    pub async fn broadcast_dashboards(
        &self,
        dashboards: Vec<Dashboard>,
        sync_type: SyncType,
    ) -> Result<BroadcastReport, StoreError> {
        let command = Command::DashboardSync {
            dashboards,
            sync_timestamp: self.inner.clock.now_millis(),
            sync_type,
        };
        self.broadcast(SyncKind::Dashboards, command).await
    }

    pub async fn broadcast_cookies(
        &self,
        cookie_domains: Vec<CookieDomain>,
        sync_type: SyncType,
    ) -> Result<BroadcastReport, StoreError> {
        let command = Command::CookieSync {
            cookie_domains,
            sync_timestamp: self.inner.clock.now_millis(),
            sync_type,
        };
        self.broadcast(SyncKind::Cookies, command).await
    }

    async fn broadcast(
        &self,
        kind: SyncKind,
        command: Command,
    ) -> Result<BroadcastReport, StoreError> {
        self.inner.store.record_broadcast(kind, &command).await?;
        let behind = self.inner.store.flags().await?;

        let supervisor = self.inner.dispatcher.supervisor();
        let mut targets = self.inner.nodes.controller_ids();
        for peer in supervisor.connected_peers() {
            if let Some(id) = peer.as_controller() {
                if !targets.contains(&id) {
                    targets.push(id);
                }
            }
        }

        let mut report = BroadcastReport {
            command_type: command.command_type(),
            sync_timestamp: sync_timestamp(&command),
            ..BroadcastReport::default()
        };

        // A controller that registers while the flags are written either
        // finds its flag in catch-up or is seen as registered below.
        for id in &targets {
            self.inner.store.mark(*id, kind).await?;
        }

        let (online, offline): (Vec<ControllerId>, Vec<ControllerId>) = targets
            .into_iter()
            .partition(|id| supervisor.is_registered(PeerId::Controller(*id)));

        for id in offline {
            info!(controller_id = %id, kind = %kind, "Controller offline, pending sync flagged");
            report.pending.push(id);
        }

        // A controller still behind on an earlier broadcast of this kind gets
        // the snapshot; the increment alone would not bring it level.
        let snapshot = self.inner.store.snapshot(kind).await?;
        let sends = online.into_iter().map(|id| {
            let already_behind = behind
                .get(&id)
                .is_some_and(|flag| flag.kinds.contains(&kind));
            let command = match (&snapshot, already_behind) {
                (Some(snapshot), true) => snapshot.clone(),
                _ => command.clone(),
            };
            async move { (id, self.send(id, command).await) }
        });
        for (id, delivered) in join_all(sends).await {
            if delivered {
                self.inner.store.clear(id, kind).await?;
                report.delivered.push(id);
            } else {
                report.pending.push(id);
            }
        }

        report.delivered.sort();
        report.pending.sort();
        info!(
            command_type = report.command_type,
            delivered = report.delivered.len(),
            pending = report.pending.len(),
            "Broadcast complete"
        );
        Ok(report)
    }

    /// Send every flagged sync to a controller that just registered. Returns
    /// the kinds that were delivered.
    pub async fn catch_up(&self, controller_id: ControllerId) -> Result<Vec<SyncKind>, StoreError> {
        let Some(flag) = self.inner.store.flag(controller_id).await? else {
            return Ok(Vec::new());
        };

        let mut delivered = Vec::new();
        for kind in flag.kinds {
            let Some(snapshot) = self.inner.store.snapshot(kind).await? else {
                // Nothing was ever broadcast; there is nothing to catch up on.
                self.inner.store.clear(controller_id, kind).await?;
                continue;
            };

            info!(controller_id = %controller_id, kind = %kind, "Sending catch-up sync");
            if self.send(controller_id, snapshot).await {
                self.inner.store.clear(controller_id, kind).await?;
                delivered.push(kind);
            }
        }
        Ok(delivered)
    }

    async fn send(&self, controller_id: ControllerId, command: Command) -> bool {
        let command_type = command.command_type();
        match self
            .inner
            .dispatcher
            .execute(
                PeerId::Controller(controller_id),
                command,
                Some(self.inner.timeout),
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    controller_id = %controller_id,
                    command_type,
                    error = %e,
                    "Sync not acknowledged, flagging pending sync"
                );
                false
            }
        }
    }
}

fn sync_timestamp(command: &Command) -> i64 {
    match command {
        Command::DashboardSync { sync_timestamp, .. }
        | Command::CookieSync { sync_timestamp, .. } => *sync_timestamp,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{MemoryPendingStore, PendingSyncFlag};
    use async_trait::async_trait;
    use fleet_link::{
        Connection, ConnectionSupervisor, DispatcherConfig, PeerIdentity, SupervisorConfig,
    };
    use fleet_proto::{CommandResponse, Frame};
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    struct Fixture {
        broadcaster: FleetBroadcaster,
        supervisor: ConnectionSupervisor,
        store: Arc<MemoryPendingStore>,
    }

    fn broadcaster(
        supervisor: &ConnectionSupervisor,
        store: Arc<dyn PendingSyncStore>,
    ) -> FleetBroadcaster {
        let dispatcher = Arc::new(CommandDispatcher::new(
            supervisor.clone(),
            DispatcherConfig::default(),
        ));
        FleetBroadcaster::new(
            dispatcher,
            NodeStore::new(),
            store,
            Arc::new(MonotonicClock::new()),
            Duration::from_secs(2),
        )
    }

    fn fixture() -> Fixture {
        let supervisor = ConnectionSupervisor::accepting(SupervisorConfig::default());
        let store = Arc::new(MemoryPendingStore::new());
        Fixture {
            broadcaster: broadcaster(&supervisor, store.clone()),
            supervisor,
            store,
        }
    }

    /// Attach a registered controller that answers every command with
    /// `success`.
    fn attach_controller(supervisor: &ConnectionSupervisor, success: bool) -> ControllerId {
        let id = ControllerId::new();
        let (local, mut remote) = Connection::pair(16);
        supervisor.attach(PeerIdentity::new(PeerId::Controller(id), "test"), local);
        supervisor.mark_registered(PeerId::Controller(id), true);

        tokio::spawn(async move {
            while let Some(frame) = remote.inbound.recv().await {
                if let Frame::Command(envelope) = frame {
                    let response = if success {
                        CommandResponse::ok(envelope.command_id, None, 0)
                    } else {
                        CommandResponse::failed(envelope.command_id, "disk full", 0)
                    };
                    let _ = remote.outbound.send(Frame::CommandResult(response)).await;
                }
            }
        });
        id
    }

    /// Attach a registered controller that acknowledges every command and
    /// reports what it received.
    fn attach_recording_controller(
        supervisor: &ConnectionSupervisor,
    ) -> (ControllerId, mpsc::UnboundedReceiver<Command>) {
        let id = ControllerId::new();
        let (local, mut remote) = Connection::pair(16);
        supervisor.attach(PeerIdentity::new(PeerId::Controller(id), "test"), local);
        supervisor.mark_registered(PeerId::Controller(id), true);

        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(frame) = remote.inbound.recv().await {
                if let Frame::Command(envelope) = frame {
                    let _ = seen_tx.send(envelope.command);
                    let response = CommandResponse::ok(envelope.command_id, None, 0);
                    let _ = remote.outbound.send(Frame::CommandResult(response)).await;
                }
            }
        });
        (id, seen_rx)
    }

    fn dashboard() -> Dashboard {
        named_dashboard("d1")
    }

    fn named_dashboard(id: &str) -> Dashboard {
        Dashboard {
            id: id.to_string(),
            url: format!("https://{id}.example"),
            title: None,
            display_id: None,
            refresh_interval_secs: None,
        }
    }

    fn dashboard_ids(command: &Command) -> Vec<String> {
        match command {
            Command::DashboardSync { dashboards, .. } => {
                dashboards.iter().map(|d| d.id.clone()).collect()
            }
            other => panic!("expected a dashboard sync, got {other:?}"),
        }
    }

    /// A store whose flag writes are slow enough for a registration to land
    /// while they are in progress.
    struct RegistersDuringMark {
        inner: MemoryPendingStore,
        supervisor: ConnectionSupervisor,
        peer: PeerId,
    }

    #[async_trait]
    impl PendingSyncStore for RegistersDuringMark {
        async fn mark(
            &self,
            controller_id: ControllerId,
            kind: SyncKind,
        ) -> Result<(), StoreError> {
            self.inner.mark(controller_id, kind).await?;
            self.supervisor.mark_registered(self.peer, true);
            Ok(())
        }

        async fn clear(
            &self,
            controller_id: ControllerId,
            kind: SyncKind,
        ) -> Result<(), StoreError> {
            self.inner.clear(controller_id, kind).await
        }

        async fn flag(
            &self,
            controller_id: ControllerId,
        ) -> Result<Option<PendingSyncFlag>, StoreError> {
            self.inner.flag(controller_id).await
        }

        async fn flags(&self) -> Result<BTreeMap<ControllerId, PendingSyncFlag>, StoreError> {
            self.inner.flags().await
        }

        async fn record_broadcast(
            &self,
            kind: SyncKind,
            command: &Command,
        ) -> Result<(), StoreError> {
            self.inner.record_broadcast(kind, command).await
        }

        async fn snapshot(&self, kind: SyncKind) -> Result<Option<Command>, StoreError> {
            self.inner.snapshot(kind).await
        }
    }

    #[tokio::test]
    async fn test_broadcast_to_live_controller_clears_flag() {
        let fx = fixture();
        let id = attach_controller(&fx.supervisor, true);
        fx.store.mark(id, SyncKind::Dashboards).await.unwrap();

        let report = fx
            .broadcaster
            .broadcast_dashboards(vec![dashboard()], SyncType::Full)
            .await
            .unwrap();

        assert_eq!(report.delivered, vec![id]);
        assert!(report.pending.is_empty());
        assert!(fx.store.flag(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_ack_sets_flag() {
        let fx = fixture();
        let id = attach_controller(&fx.supervisor, false);

        let report = fx
            .broadcaster
            .broadcast_cookies(Vec::new(), SyncType::Incremental)
            .await
            .unwrap();

        assert_eq!(report.command_type, "COOKIE_SYNC");
        assert_eq!(report.pending, vec![id]);
        let flag = fx.store.flag(id).await.unwrap().unwrap();
        assert!(flag.kinds.contains(&SyncKind::Cookies));
    }

    #[tokio::test]
    async fn test_unregistered_controller_is_flagged_not_sent() {
        let fx = fixture();
        let id = attach_controller(&fx.supervisor, true);
        fx.supervisor.mark_registered(PeerId::Controller(id), false);

        let report = fx
            .broadcaster
            .broadcast_dashboards(vec![dashboard()], SyncType::Full)
            .await
            .unwrap();

        assert_eq!(report.pending, vec![id]);
        assert!(fx.broadcaster.inner.dispatcher.pending().is_empty());
    }

    #[tokio::test]
    async fn test_catch_up_sends_snapshot_as_full_sync() {
        let fx = fixture();
        let id = ControllerId::new();
        fx.store.mark(id, SyncKind::Dashboards).await.unwrap();
        fx.store
            .record_broadcast(
                SyncKind::Dashboards,
                &Command::DashboardSync {
                    dashboards: vec![dashboard()],
                    sync_timestamp: 3,
                    sync_type: SyncType::Incremental,
                },
            )
            .await
            .unwrap();

        let (local, mut remote) = Connection::pair(16);
        fx.supervisor
            .attach(PeerIdentity::new(PeerId::Controller(id), "test"), local);
        let seen = tokio::spawn(async move {
            while let Some(frame) = remote.inbound.recv().await {
                if let Frame::Command(envelope) = frame {
                    let command = envelope.command.clone();
                    let _ = remote
                        .outbound
                        .send(Frame::CommandResult(CommandResponse::ok(
                            envelope.command_id,
                            None,
                            0,
                        )))
                        .await;
                    return command;
                }
            }
            panic!("connection closed before catch-up");
        });

        let delivered = fx.broadcaster.catch_up(id).await.unwrap();

        assert_eq!(delivered, vec![SyncKind::Dashboards]);
        assert_eq!(
            seen.await.unwrap(),
            Command::DashboardSync {
                dashboards: vec![dashboard()],
                sync_timestamp: 3,
                sync_type: SyncType::Full,
            }
        );
        assert!(fx.store.flag(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_catch_up_after_missed_increment_keeps_earlier_state() {
        let fx = fixture();
        let (id, mut seen) = attach_recording_controller(&fx.supervisor);
        let peer = PeerId::Controller(id);

        let report = fx
            .broadcaster
            .broadcast_dashboards(
                vec![named_dashboard("d1"), named_dashboard("d2")],
                SyncType::Full,
            )
            .await
            .unwrap();
        assert_eq!(report.delivered, vec![id]);
        assert_eq!(dashboard_ids(&seen.recv().await.unwrap()), ["d1", "d2"]);

        fx.supervisor.mark_registered(peer, false);
        let report = fx
            .broadcaster
            .broadcast_dashboards(vec![named_dashboard("d3")], SyncType::Incremental)
            .await
            .unwrap();
        assert_eq!(report.pending, vec![id]);

        fx.supervisor.mark_registered(peer, true);
        let delivered = fx.broadcaster.catch_up(id).await.unwrap();

        assert_eq!(delivered, vec![SyncKind::Dashboards]);
        let catch_up = seen.recv().await.unwrap();
        assert_eq!(dashboard_ids(&catch_up), ["d1", "d2", "d3"]);
        assert!(matches!(
            catch_up,
            Command::DashboardSync {
                sync_type: SyncType::Full,
                ..
            }
        ));
        assert!(fx.store.flag(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_controller_still_behind_gets_snapshot_not_increment() {
        let fx = fixture();
        let (id, mut seen) = attach_recording_controller(&fx.supervisor);
        let peer = PeerId::Controller(id);

        fx.supervisor.mark_registered(peer, false);
        fx.broadcaster
            .broadcast_dashboards(vec![named_dashboard("d1")], SyncType::Incremental)
            .await
            .unwrap();

        // Back online, but its catch-up has not run yet.
        fx.supervisor.mark_registered(peer, true);
        let report = fx
            .broadcaster
            .broadcast_dashboards(vec![named_dashboard("d2")], SyncType::Incremental)
            .await
            .unwrap();

        assert_eq!(report.delivered, vec![id]);
        assert_eq!(dashboard_ids(&seen.recv().await.unwrap()), ["d1", "d2"]);
        assert!(fx.store.flag(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_registration_during_flag_write_still_delivers() {
        let supervisor = ConnectionSupervisor::accepting(SupervisorConfig::default());
        let (id, mut seen) = attach_recording_controller(&supervisor);
        let peer = PeerId::Controller(id);
        supervisor.mark_registered(peer, false);

        let store = Arc::new(RegistersDuringMark {
            inner: MemoryPendingStore::new(),
            supervisor: supervisor.clone(),
            peer,
        });
        let broadcaster = broadcaster(&supervisor, store.clone());

        let report = broadcaster
            .broadcast_dashboards(vec![dashboard()], SyncType::Full)
            .await
            .unwrap();

        assert_eq!(report.delivered, vec![id]);
        assert!(report.pending.is_empty());
        assert_eq!(dashboard_ids(&seen.recv().await.unwrap()), ["d1"]);
        assert!(store.flag(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_catch_up_without_broadcast_clears_flag() {
        let fx = fixture();
        let id = ControllerId::new();
        fx.store.mark(id, SyncKind::Cookies).await.unwrap();

        assert!(fx.broadcaster.catch_up(id).await.unwrap().is_empty());
        assert!(fx.store.flag(id).await.unwrap().is_none());
    }
}
