//! WebSocket endpoint for the streaming transport.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use fleet_id::{ControllerId, PeerId};
use fleet_link::{Connection, PeerIdentity, DEFAULT_CHANNEL_CAPACITY};
use fleet_proto::Frame;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub controller_id: ControllerId,
}

pub async fn connect(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run(state, query.controller_id, socket))
}

/// Bridge one WebSocket into the supervisor until either side closes.
async fn run(state: AppState, controller_id: ControllerId, socket: WebSocket) {
    let peer = PeerId::Controller(controller_id);
    let (local, remote) = Connection::pair(DEFAULT_CHANNEL_CAPACITY);
    state
        .supervisor()
        .attach(PeerIdentity::new(peer, "websocket"), local);
    info!(controller_id = %controller_id, "Controller stream opened");

    let Connection {
        outbound,
        mut inbound,
    } = remote;
    let (mut sink, mut stream) = socket.split();

    let to_controller = async move {
        while let Some(frame) = inbound.recv().await {
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(controller_id = %controller_id, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    };

    let from_controller = async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match Frame::decode(text.as_str()) {
                    Ok(frame) => {
                        if outbound.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            controller_id = %controller_id,
                            error = %e,
                            "Dropping malformed frame"
                        );
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(controller_id = %controller_id, error = %e, "Stream read failed");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = to_controller => {}
        _ = from_controller => {}
    }
    info!(controller_id = %controller_id, "Controller stream closed");
}
