//! End-to-end happy path test.
//!
//! Runs a real admin server and one or more controller runtimes over
//! loopback sockets, verifying:
//!
//! 1. Registration over the WebSocket stream
//! 2. Dashboard broadcast delivery
//! 3. Pending-sync catch-up after a controller was offline
//! 4. Failover to HTTP polling when the stream is unreachable
//! 5. Command relay from the admin API through a controller to a host
//!
//! ## Running
//!
//! ```bash
//! cargo test -p fleet-e2e --test happy_path
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleet_admin::{
    api,
    config::Config as AdminConfig,
    pending::{JsonFilePendingStore, MemoryPendingStore, PendingSyncStore},
    protocol,
    state::AppState,
};
use fleet_controller::config::{Config as ControllerConfig, HostEndpoint};
use fleet_controller::poll::PollTransport;
use fleet_controller::runtime::{ControllerRuntime, LinkRoutes};
use fleet_id::{ControllerId, HostId, PeerId};
use fleet_link::{
    ConnectionMode, MemoryTransport, Transport, TransportRoute, WebSocketTransport,
};
use fleet_proto::{Command, CommandResponse, Frame};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

struct Admin {
    addr: SocketAddr,
    state: AppState,
    shutdown_tx: watch::Sender<bool>,
}

impl Admin {
    async fn spawn(store: Arc<dyn PendingSyncStore>) -> Self {
        let config = AdminConfig {
            command_timeout: Duration::from_secs(3),
            poll_wait: Duration::from_secs(1),
            ..AdminConfig::default()
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = AppState::new(config, store);
        protocol::spawn(state.clone(), shutdown_rx.clone());

        let app = api::create_router(state.clone());
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown_rx;
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await;
        });

        Self {
            addr,
            state,
            shutdown_tx,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn controller_config(&self, controller_id: ControllerId) -> ControllerConfig {
        ControllerConfig {
            controller_id,
            admin_url: format!("http://{}", self.addr),
            hostname: "site-controller".to_string(),
            primary_timeout: Duration::from_secs(2),
            fallback_delay: Duration::from_millis(100),
            poll_interval: Duration::from_millis(50),
            ..ControllerConfig::default()
        }
    }

    async fn broadcast_d1(&self) -> serde_json::Value {
        let response = reqwest::Client::new()
            .post(self.url("/v1/fleet/dashboards"))
            .json(&json!({"dashboards": [{"id": "d1", "url": "https://x"}]}))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success(), "broadcast failed");
        response.json().await.unwrap()
    }
}

impl Drop for Admin {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.state.supervisor().shutdown();
    }
}

/// Poll `check` until it holds or ten seconds pass.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn dashboard_ids(runtime: &ControllerRuntime) -> Vec<String> {
    runtime
        .fleet_state()
        .dashboards()
        .into_iter()
        .map(|d| d.id)
        .collect()
}

#[tokio::test]
async fn test_controller_registers_and_receives_broadcast() {
    let admin = Admin::spawn(Arc::new(MemoryPendingStore::new())).await;
    let controller_id = ControllerId::new();
    let config = admin.controller_config(controller_id);
    let runtime = ControllerRuntime::start(config.clone(), LinkRoutes::from_config(&config));

    eventually("registration", || runtime.status().registered).await;
    assert_eq!(runtime.status().mode, ConnectionMode::Primary);
    let peer = PeerId::Controller(controller_id);
    eventually("admin view", || admin.state.supervisor().is_registered(peer)).await;

    let peers: serde_json::Value = reqwest::get(admin.url("/v1/peers"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(peers["peers"][0]["peer_id"], peer.to_string());
    assert_eq!(peers["peers"][0]["registered"], true);

    let report = admin.broadcast_d1().await;
    assert_eq!(report["delivered"], json!([controller_id.to_string()]));
    assert_eq!(dashboard_ids(&runtime), vec!["d1"]);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_offline_controller_catches_up_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFilePendingStore::open(dir.path().join("pending.json"))
        .await
        .unwrap();
    let admin = Admin::spawn(Arc::new(store)).await;
    let controller_id = ControllerId::new();
    let peer = PeerId::Controller(controller_id);
    let config = admin.controller_config(controller_id);

    let first = ControllerRuntime::start(config.clone(), LinkRoutes::from_config(&config));
    eventually("first registration", || first.status().registered).await;
    first.shutdown().await;
    eventually("admin to see the controller leave", || {
        !admin.state.supervisor().is_connected(peer)
    })
    .await;

    let report = admin.broadcast_d1().await;
    assert_eq!(report["pending"], json!([controller_id.to_string()]));
    let pending: serde_json::Value = reqwest::get(admin.url("/v1/fleet/pending"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(
        pending["pending"][controller_id.to_string()]["kinds"],
        json!(["dashboards"])
    );

    let second = ControllerRuntime::start(config.clone(), LinkRoutes::from_config(&config));
    eventually("catch-up sync", || dashboard_ids(&second) == vec!["d1"]).await;

    let store = admin.state.broadcaster().store().clone();
    tokio::time::timeout(Duration::from_secs(10), async {
        while store.flag(controller_id).await.unwrap().is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("pending flag did not clear");

    second.shutdown().await;
}

#[tokio::test]
async fn test_controller_falls_back_to_polling() {
    let admin = Admin::spawn(Arc::new(MemoryPendingStore::new())).await;
    let controller_id = ControllerId::new();
    let config = admin.controller_config(controller_id);

    // A port with nothing listening stands in for a blocked stream.
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let ws: Arc<dyn Transport> = Arc::new(WebSocketTransport::new());
    let poll = PollTransport::new(controller_id, config.poll_interval);
    let routes = LinkRoutes {
        primary: TransportRoute::new(ws.clone(), format!("ws://{dead_addr}/v1/link/stream")),
        fallback: TransportRoute::new(Arc::new(poll), config.poll_url()),
        hosts: ws,
    };
    let runtime = ControllerRuntime::start(config, routes);

    eventually("registration over polling", || {
        let status = runtime.status();
        status.registered && status.mode == ConnectionMode::Fallback
    })
    .await;
    assert!(runtime.status().primary_failed);
    assert_eq!(admin.state.polls().len(), 1);

    let report = admin.broadcast_d1().await;
    assert_eq!(report["delivered"], json!([controller_id.to_string()]));
    assert_eq!(dashboard_ids(&runtime), vec!["d1"]);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_admin_command_reaches_host() {
    let admin = Admin::spawn(Arc::new(MemoryPendingStore::new())).await;
    let controller_id = ControllerId::new();
    let host_id = HostId::new();
    let config = ControllerConfig {
        hosts: vec![HostEndpoint {
            host_id,
            address: "host-a".to_string(),
        }],
        ..admin.controller_config(controller_id)
    };

    let hosts = MemoryTransport::new();
    let mut listener = hosts.listen("host-a");
    let routes = LinkRoutes {
        hosts: Arc::new(hosts),
        ..LinkRoutes::from_config(&config)
    };
    let runtime = ControllerRuntime::start(config, routes);

    // A host agent that reports two displays.
    tokio::spawn(async move {
        let Some(mut host) = listener.accept().await else {
            return;
        };
        while let Some(frame) = host.inbound.recv().await {
            let reply = match frame {
                Frame::Ping { nonce } => Frame::Pong { nonce },
                Frame::Command(envelope) => Frame::CommandResult(CommandResponse::ok(
                    envelope.command_id,
                    Some(json!({"displays": 2})),
                    envelope.timestamp,
                )),
                _ => continue,
            };
            if host.outbound.send(reply).await.is_err() {
                break;
            }
        }
    });

    eventually("registration", || runtime.status().registered).await;
    eventually("host link", || runtime.hosts().connected_count() == 1).await;

    let response = reqwest::Client::new()
        .post(admin.url(&format!("/v1/peers/{controller_id}/commands")))
        .json(&json!({
            "command": Command::IdentifyDisplays { duration_secs: 5 },
            "host_id": host_id,
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: CommandResponse = response.json().await.unwrap();
    assert!(body.success);
    assert_eq!(body.result, Some(json!({"displays": 2})));

    runtime.shutdown().await;
}
