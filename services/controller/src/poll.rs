//! HTTP polling transport: the fallback link to the admin.
//!
//! Each `open` starts a polling session under a fresh session id. Two loops
//! share the session: one posts outbound frames as soon as they are queued,
//! the other keeps a long poll open to collect frames from the admin. The
//! connection closes when either loop stops, e.g. because the admin ended
//! the session or became unreachable.

use std::time::Duration;

use async_trait::async_trait;
use fleet_id::{ControllerId, RequestId};
use fleet_link::{Connection, LinkError, PeerIdentity, Transport, DEFAULT_CHANNEL_CAPACITY};
use fleet_proto::{Frame, PollRequest, PollResponse};
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long a receive poll asks the admin to hold the request. The admin
/// applies its own, usually lower, cap.
const LONG_POLL_WAIT: Duration = Duration::from_secs(25);

/// Slack on top of the long-poll wait before the HTTP request times out.
const REQUEST_SLACK: Duration = Duration::from_secs(10);

/// Most frames posted in one request.
const MAX_BATCH: usize = 64;

/// Dials the admin's `/v1/link/poll` endpoint. The peer address is the
/// endpoint URL.
#[derive(Debug, Clone)]
pub struct PollTransport {
    client: reqwest::Client,
    controller_id: ControllerId,
    poll_interval: Duration,
    long_poll_wait: Duration,
}

impl PollTransport {
    pub fn new(controller_id: ControllerId, poll_interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            controller_id,
            poll_interval,
            long_poll_wait: LONG_POLL_WAIT,
        }
    }

    pub fn with_long_poll_wait(mut self, wait: Duration) -> Self {
        self.long_poll_wait = wait;
        self
    }
}

#[derive(Debug, Clone)]
struct PollSession {
    client: reqwest::Client,
    url: String,
    controller_id: ControllerId,
    session_id: String,
}

impl PollSession {
    async fn exchange(&self, frames: Vec<Frame>, wait: Duration) -> Result<Vec<Frame>, LinkError> {
        let request = PollRequest {
            controller_id: self.controller_id,
            session_id: self.session_id.clone(),
            frames,
            wait_ms: wait.as_millis() as u64,
        };

        let response = self
            .client
            .post(&self.url)
            .timeout(wait + REQUEST_SLACK)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LinkError::Timeout {
                        operation: "poll",
                        timeout_ms: (wait + REQUEST_SLACK).as_millis() as u64,
                    }
                } else {
                    LinkError::Unavailable(format!("{}: {e}", self.url))
                }
            })?;

        match response.status() {
            status if status.is_success() => {
                let body: PollResponse = response
                    .json()
                    .await
                    .map_err(|e| LinkError::Protocol(format!("poll response: {e}")))?;
                Ok(body.frames)
            }
            StatusCode::GONE => Err(LinkError::Closed),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(LinkError::Unavailable(format!("{}: {status} {body}", self.url)))
            }
        }
    }
}

#[async_trait]
impl Transport for PollTransport {
    fn name(&self) -> &'static str {
        "poll"
    }

    async fn open(&self, peer: &PeerIdentity) -> Result<Connection, LinkError> {
        let session = PollSession {
            client: self.client.clone(),
            url: peer.address.clone(),
            controller_id: self.controller_id,
            session_id: RequestId::new().to_string(),
        };

        // Creates the session on the admin; nothing is held open.
        let initial = session.exchange(Vec::new(), Duration::ZERO).await?;
        info!(
            controller_id = %self.controller_id,
            session_id = %session.session_id,
            "Polling session opened"
        );

        let (out_tx, out_rx) = mpsc::channel::<Frame>(DEFAULT_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<Frame>(DEFAULT_CHANNEL_CAPACITY);
        for frame in initial {
            // Capacity exceeds any single poll response.
            let _ = in_tx.try_send(frame);
        }

        tokio::spawn(drive(
            session,
            out_rx,
            in_tx,
            self.poll_interval,
            self.long_poll_wait,
        ));

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

async fn drive(
    session: PollSession,
    mut out_rx: mpsc::Receiver<Frame>,
    in_tx: mpsc::Sender<Frame>,
    poll_interval: Duration,
    long_poll_wait: Duration,
) {
    let sender = {
        let session = session.clone();
        let in_tx = in_tx.clone();
        async move {
            while let Some(first) = out_rx.recv().await {
                let mut batch = vec![first];
                while batch.len() < MAX_BATCH {
                    match out_rx.try_recv() {
                        Ok(frame) => batch.push(frame),
                        Err(_) => break,
                    }
                }
                match session.exchange(batch, Duration::ZERO).await {
                    Ok(frames) => {
                        if !deliver(&in_tx, frames).await {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(session_id = %session.session_id, error = %e, "Poll send failed");
                        return;
                    }
                }
            }
            debug!(session_id = %session.session_id, "Outbound side closed");
        }
    };

    let receiver = {
        let session = session.clone();
        async move {
            loop {
                match session.exchange(Vec::new(), long_poll_wait).await {
                    Ok(frames) if frames.is_empty() => {
                        tokio::time::sleep(poll_interval).await;
                    }
                    Ok(frames) => {
                        if !deliver(&in_tx, frames).await {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(session_id = %session.session_id, error = %e, "Poll receive failed");
                        return;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = sender => {}
        _ = receiver => {}
    }
    info!(session_id = %session.session_id, "Polling session closed");
}

/// Hand frames to the supervisor. Returns false once it has gone away.
async fn deliver(in_tx: &mpsc::Sender<Frame>, frames: Vec<Frame>) -> bool {
    for frame in frames {
        if in_tx.send(frame).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use axum::{extract::State, http::StatusCode as HttpStatus, routing::post, Json, Router};
    use fleet_id::PeerId;

    /// Minimal stand-in for the admin poll endpoint: answers every `Ping`
    /// with a `Pong` on the next poll, and ends the session on request.
    #[derive(Clone, Default)]
    struct FakeAdmin {
        queue: Arc<Mutex<VecDeque<Frame>>>,
        requests: Arc<Mutex<Vec<PollRequest>>>,
        gone: Arc<Mutex<bool>>,
    }

    async fn handle(
        State(admin): State<FakeAdmin>,
        Json(request): Json<PollRequest>,
    ) -> Result<Json<PollResponse>, HttpStatus> {
        if *admin.gone.lock().unwrap() {
            return Err(HttpStatus::GONE);
        }
        {
            let mut queue = admin.queue.lock().unwrap();
            for frame in &request.frames {
                if let Frame::Ping { nonce } = frame {
                    queue.push_back(Frame::Pong { nonce: *nonce });
                }
            }
        }
        admin.requests.lock().unwrap().push(request);
        let frames = admin.queue.lock().unwrap().drain(..).collect();
        Ok(Json(PollResponse { frames }))
    }

    async fn serve(admin: FakeAdmin) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/v1/link/poll", post(handle)).with_state(admin);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/v1/link/poll")
    }

    fn transport(id: ControllerId) -> PollTransport {
        PollTransport::new(id, Duration::from_millis(10)).with_long_poll_wait(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_frames_round_trip_through_session() {
        let admin = FakeAdmin::default();
        let url = serve(admin.clone()).await;
        let id = ControllerId::new();

        let mut connection = transport(id)
            .open(&PeerIdentity::new(PeerId::Admin, url))
            .await
            .unwrap();
        connection
            .outbound
            .send(Frame::Ping { nonce: 42 })
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), connection.inbound.recv())
            .await
            .unwrap();
        assert_eq!(frame, Some(Frame::Pong { nonce: 42 }));

        let requests = admin.requests.lock().unwrap();
        assert!(requests.iter().all(|r| r.controller_id == id));
        let session_id = &requests[0].session_id;
        assert!(requests.iter().all(|r| &r.session_id == session_id));
    }

    #[tokio::test]
    async fn test_each_open_uses_a_new_session() {
        let admin = FakeAdmin::default();
        let url = serve(admin.clone()).await;
        let transport = transport(ControllerId::new());
        let identity = PeerIdentity::new(PeerId::Admin, url);

        let _first = transport.open(&identity).await.unwrap();
        let _second = transport.open(&identity).await.unwrap();

        let requests = admin.requests.lock().unwrap();
        let first_session = &requests[0].session_id;
        assert!(requests.iter().any(|r| &r.session_id != first_session));
    }

    #[tokio::test]
    async fn test_gone_session_closes_connection() {
        let admin = FakeAdmin::default();
        let url = serve(admin.clone()).await;

        let mut connection = transport(ControllerId::new())
            .open(&PeerIdentity::new(PeerId::Admin, url))
            .await
            .unwrap();
        *admin.gone.lock().unwrap() = true;

        let closed = tokio::time::timeout(Duration::from_secs(5), connection.inbound.recv())
            .await
            .unwrap();
        assert_eq!(closed, None);
    }

    #[tokio::test]
    async fn test_unreachable_admin_fails_open() {
        // Bind then drop to get a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = transport(ControllerId::new())
            .open(&PeerIdentity::new(
                PeerId::Admin,
                format!("http://{addr}/v1/link/poll"),
            ))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
