//! HTTP polling endpoint for the fallback transport.
//!
//! A polling controller names its session with a `session_id` of its own
//! choosing. The first request carrying a new id creates a virtual
//! connection and attaches it to the supervisor, replacing any previous one
//! for that controller. Requests deliver frames to the admin and, when asked
//! to wait, are held until the admin has frames to return or the wait runs
//! out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::{extract::State, Json};
use fleet_id::{ControllerId, PeerId};
use fleet_link::{Connection, ConnectionSupervisor, PeerIdentity, DEFAULT_CHANNEL_CAPACITY};
use fleet_proto::{Frame, PollRequest, PollResponse};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info};

use crate::api::error::AdminApiError;
use crate::state::AppState;

/// Most frames returned by one poll.
const MAX_FRAMES_PER_POLL: usize = 64;

#[derive(Clone)]
struct PollSession {
    session_id: String,
    to_admin: mpsc::Sender<Frame>,
    from_admin: Arc<tokio::sync::Mutex<mpsc::Receiver<Frame>>>,
}

/// The admin ended the virtual connection behind a session.
#[derive(Debug)]
struct SessionClosed;

impl PollSession {
    /// Collect queued frames, waiting up to `wait` for the first one.
    /// A request that cannot take the queue because another request is
    /// already waiting on it returns nothing.
    async fn drain(&self, wait: Duration) -> Result<Vec<Frame>, SessionClosed> {
        let mut rx = if wait.is_zero() {
            match self.from_admin.try_lock() {
                Ok(rx) => rx,
                Err(_) => return Ok(Vec::new()),
            }
        } else {
            self.from_admin.lock().await
        };

        let mut frames = Vec::new();
        if wait.is_zero() {
            match rx.try_recv() {
                Ok(frame) => frames.push(frame),
                Err(TryRecvError::Empty) => return Ok(frames),
                Err(TryRecvError::Disconnected) => return Err(SessionClosed),
            }
        } else {
            match tokio::time::timeout(wait, rx.recv()).await {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => return Err(SessionClosed),
                Err(_) => return Ok(frames),
            }
        }

        while frames.len() < MAX_FRAMES_PER_POLL {
            match rx.try_recv() {
                Ok(frame) => frames.push(frame),
                Err(_) => break,
            }
        }
        Ok(frames)
    }
}

/// Polling sessions, one per controller.
#[derive(Clone, Default)]
pub struct PollSessions {
    sessions: Arc<Mutex<HashMap<ControllerId, PollSession>>>,
}

impl PollSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<ControllerId, PollSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The session named `session_id`, creating and attaching it if the
    /// controller's current session has a different id.
    fn open(
        &self,
        supervisor: &ConnectionSupervisor,
        controller_id: ControllerId,
        session_id: &str,
    ) -> Result<PollSession, SessionClosed> {
        let mut sessions = self.sessions();
        if let Some(session) = sessions.get(&controller_id) {
            if session.session_id == session_id {
                if session.to_admin.is_closed() {
                    sessions.remove(&controller_id);
                    return Err(SessionClosed);
                }
                return Ok(session.clone());
            }
        }

        let (local, remote) = Connection::pair(DEFAULT_CHANNEL_CAPACITY);
        let session = PollSession {
            session_id: session_id.to_string(),
            to_admin: remote.outbound,
            from_admin: Arc::new(tokio::sync::Mutex::new(remote.inbound)),
        };
        sessions.insert(controller_id, session.clone());
        supervisor.attach(
            PeerIdentity::new(PeerId::Controller(controller_id), "poll"),
            local,
        );
        info!(controller_id = %controller_id, session_id, "Polling session opened");
        Ok(session)
    }

    fn close(&self, controller_id: ControllerId, session_id: &str) {
        let mut sessions = self.sessions();
        if sessions
            .get(&controller_id)
            .is_some_and(|s| s.session_id == session_id)
        {
            sessions.remove(&controller_id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub async fn poll(
    State(state): State<AppState>,
    Json(request): Json<PollRequest>,
) -> Result<Json<PollResponse>, AdminApiError> {
    let PollRequest {
        controller_id,
        session_id,
        frames,
        wait_ms,
    } = request;
    let closed = || {
        AdminApiError::gone(
            "poll_session_closed",
            format!("polling session {session_id} is closed; open a new one"),
        )
    };

    let session = state
        .polls()
        .open(state.supervisor(), controller_id, &session_id)
        .map_err(|_| closed())?;

    for frame in frames {
        if session.to_admin.send(frame).await.is_err() {
            state.polls().close(controller_id, &session_id);
            return Err(closed());
        }
    }

    let wait = Duration::from_millis(wait_ms).min(state.config().poll_wait);
    match session.drain(wait).await {
        Ok(frames) => {
            if !frames.is_empty() {
                debug!(
                    controller_id = %controller_id,
                    count = frames.len(),
                    "Returning polled frames"
                );
            }
            Ok(Json(PollResponse { frames }))
        }
        Err(SessionClosed) => {
            state.polls().close(controller_id, &session_id);
            Err(closed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pending::MemoryPendingStore;

    fn state() -> AppState {
        AppState::new(
            Config {
                poll_wait: Duration::from_secs(5),
                ..Config::default()
            },
            Arc::new(MemoryPendingStore::new()),
        )
    }

    fn request(
        controller_id: ControllerId,
        session_id: &str,
        frames: Vec<Frame>,
        wait_ms: u64,
    ) -> PollRequest {
        PollRequest {
            controller_id,
            session_id: session_id.to_string(),
            frames,
            wait_ms,
        }
    }

    #[tokio::test]
    async fn test_ping_is_answered_within_the_same_poll() {
        let state = state();
        let id = ControllerId::new();

        let Json(response) = poll(
            State(state.clone()),
            Json(request(id, "s1", vec![Frame::Ping { nonce: 9 }], 1_000)),
        )
        .await
        .unwrap();

        assert_eq!(response.frames, vec![Frame::Pong { nonce: 9 }]);
        assert!(state.supervisor().is_connected(PeerId::Controller(id)));
        assert_eq!(state.polls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_poll_waits_then_returns_empty() {
        let state = state();
        let id = ControllerId::new();
        let started = tokio::time::Instant::now();

        let Json(response) = poll(State(state), Json(request(id, "s1", Vec::new(), 60_000)))
            .await
            .unwrap();

        assert!(response.frames.is_empty());
        // Capped at the configured wait.
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_new_session_replaces_old_connection() {
        let state = state();
        let id = ControllerId::new();
        let peer = PeerId::Controller(id);
        let mut events = state.supervisor().subscribe();

        poll(State(state.clone()), Json(request(id, "s1", Vec::new(), 0)))
            .await
            .unwrap();
        poll(State(state.clone()), Json(request(id, "s2", Vec::new(), 0)))
            .await
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(fleet_link::LinkEvent::Connected { peer, session: 1 })
        );
        assert_eq!(
            events.recv().await,
            Some(fleet_link::LinkEvent::Disconnected {
                peer,
                session: 1,
                reason: fleet_link::DisconnectReason::Replaced
            })
        );
        assert_eq!(
            events.recv().await,
            Some(fleet_link::LinkEvent::Connected { peer, session: 2 })
        );
        assert_eq!(state.polls().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_on_closed_session_is_gone() {
        let state = state();
        let id = ControllerId::new();

        poll(State(state.clone()), Json(request(id, "s1", Vec::new(), 0)))
            .await
            .unwrap();
        state
            .supervisor()
            .disconnect(PeerId::Controller(id), fleet_link::DisconnectReason::Stale);
        // Let the aborted reader release its end of the connection.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = poll(State(state.clone()), Json(request(id, "s1", Vec::new(), 0)))
            .await
            .unwrap_err();

        assert_eq!(err.status, axum::http::StatusCode::GONE);
        assert!(state.polls().is_empty());
    }
}
