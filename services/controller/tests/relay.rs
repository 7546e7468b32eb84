//! Commands and host state crossing the controller between an in-memory
//! admin and an in-memory host agent.

use std::sync::Arc;
use std::time::Duration;

use fleet_controller::config::{Config, HostEndpoint};
use fleet_controller::runtime::{ControllerRuntime, LinkRoutes};
use fleet_id::{CommandId, HostId, PeerId};
use fleet_link::{Connection, MemoryTransport, Transport, TransportRoute};
use fleet_proto::{
    Command, CommandEnvelope, CommandResponse, Frame, HostStateReport, RegistrationResponse,
    SyncAckStatus,
};
use fleet_sync::{Priority, SyncEmitter, SyncMessageType};
use serde_json::json;

struct Site {
    runtime: ControllerRuntime,
    admin: Connection,
    host: Connection,
    host_id: HostId,
}

async fn answer_handshake(connection: &mut Connection) {
    if let Some(Frame::Ping { nonce }) = connection.inbound.recv().await {
        connection.outbound.send(Frame::Pong { nonce }).await.unwrap();
    }
}

/// Frames from `connection` until one matches, skipping the rest.
async fn expect<T>(connection: &mut Connection, mut pick: impl FnMut(Frame) -> Option<T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let frame = connection.inbound.recv().await.expect("link closed");
            if let Some(found) = pick(frame) {
                return found;
            }
        }
    })
    .await
    .expect("expected frame did not arrive")
}

async fn registered_site() -> Site {
    let transport = MemoryTransport::new();
    let mut admin_listener = transport.listen("admin");
    let mut host_listener = transport.listen("host-a");
    let transport: Arc<dyn Transport> = Arc::new(transport);
    let host_id = HostId::new();

    let runtime = ControllerRuntime::start(
        Config {
            hosts: vec![HostEndpoint {
                host_id,
                address: "host-a".to_string(),
            }],
            ..Config::default()
        },
        LinkRoutes {
            primary: TransportRoute::new(transport.clone(), "admin"),
            fallback: TransportRoute::new(transport.clone(), "admin-poll"),
            hosts: transport,
        },
    );

    let mut host = host_listener.accept().await.unwrap();
    answer_handshake(&mut host).await;
    let mut admin = admin_listener.accept().await.unwrap();
    answer_handshake(&mut admin).await;

    let controller_id = expect(&mut admin, |frame| match frame {
        Frame::Register(request) => Some(request.controller_id),
        _ => None,
    })
    .await;
    admin
        .outbound
        .send(Frame::RegisterAck(RegistrationResponse::accepted(controller_id, None)))
        .await
        .unwrap();
    expect(&mut admin, |frame| matches!(frame, Frame::Status(_)).then_some(())).await;

    // Host link up before anything is relayed.
    tokio::time::timeout(Duration::from_secs(5), async {
        while runtime.hosts().connected_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    Site {
        runtime,
        admin,
        host,
        host_id,
    }
}

#[tokio::test]
async fn test_host_command_is_relayed_under_admin_command_id() {
    let mut site = registered_site().await;
    let admin_command_id = CommandId::new();

    site.admin
        .outbound
        .send(Frame::Command(CommandEnvelope {
            command_id: admin_command_id,
            target: PeerId::Host(site.host_id),
            timestamp: 1,
            command: Command::TakeScreenshot { display_id: None },
        }))
        .await
        .unwrap();

    let relayed = expect(&mut site.host, |frame| match frame {
        Frame::Command(envelope) => Some(envelope),
        _ => None,
    })
    .await;
    assert_eq!(relayed.target, PeerId::Host(site.host_id));
    assert_ne!(relayed.command_id, admin_command_id);
    site.host
        .outbound
        .send(Frame::CommandResult(CommandResponse::ok(
            relayed.command_id,
            Some(json!({"image": "base64"})),
            2,
        )))
        .await
        .unwrap();

    let response = expect(&mut site.admin, |frame| match frame {
        Frame::CommandResult(response) => Some(response),
        _ => None,
    })
    .await;
    assert_eq!(response.command_id, admin_command_id);
    assert!(response.success);
    assert_eq!(response.result, Some(json!({"image": "base64"})));

    site.runtime.shutdown().await;
}

#[tokio::test]
async fn test_host_failure_is_reported_to_admin() {
    let mut site = registered_site().await;

    site.admin
        .outbound
        .send(Frame::Command(CommandEnvelope {
            command_id: CommandId::new(),
            target: PeerId::Host(site.host_id),
            timestamp: 1,
            command: Command::RestartBrowser { display_id: None },
        }))
        .await
        .unwrap();

    let relayed = expect(&mut site.host, |frame| match frame {
        Frame::Command(envelope) => Some(envelope),
        _ => None,
    })
    .await;
    site.host
        .outbound
        .send(Frame::CommandResult(CommandResponse::failed(
            relayed.command_id,
            "browser not running",
            2,
        )))
        .await
        .unwrap();

    let response = expect(&mut site.admin, |frame| match frame {
        Frame::CommandResult(response) => Some(response),
        _ => None,
    })
    .await;
    assert!(!response.success);
    assert_eq!(response.error_message.as_deref(), Some("browser not running"));
}

#[tokio::test]
async fn test_host_state_is_forwarded_to_admin() {
    let mut site = registered_site().await;
    let emitter = SyncEmitter::new(PeerId::Host(site.host_id));
    let message = emitter
        .emit(
            SyncMessageType::Metrics,
            json!({"cpu": 42}),
            None,
            Priority::Normal,
        )
        .unwrap();

    site.host.outbound.send(Frame::Sync(message)).await.unwrap();
    let ack = expect(&mut site.host, |frame| match frame {
        Frame::SyncAck { status, .. } => Some(status),
        _ => None,
    })
    .await;
    assert_eq!(ack, SyncAckStatus::Applied);

    let forwarded = expect(&mut site.admin, |frame| match frame {
        Frame::Sync(message) => Some(message),
        _ => None,
    })
    .await;
    assert_eq!(forwarded.source, PeerId::Controller(site.runtime.controller_id()));
    assert_eq!(forwarded.sequence_number, Some(1));
    let report: HostStateReport = serde_json::from_value(forwarded.open().unwrap()).unwrap();
    assert_eq!(report.host_id, site.host_id);
    assert_eq!(report.state, json!({"cpu": 42}));
}
