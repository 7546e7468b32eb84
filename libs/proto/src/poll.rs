//! Request/response bodies for the HTTP polling transport.

use fleet_id::ControllerId;
use serde::{Deserialize, Serialize};

use crate::Frame;

/// Body of `POST /v1/link/poll`: frames from the controller, plus the
/// identity of its polling session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollRequest {
    pub controller_id: ControllerId,

    /// Chosen by the controller when it opens the transport. A new value
    /// tells the admin to start a fresh virtual connection.
    pub session_id: String,

    #[serde(default)]
    pub frames: Vec<Frame>,

    /// How long the admin may hold the request open waiting for frames to
    /// return. Zero answers immediately. The admin applies its own cap.
    #[serde(default)]
    pub wait_ms: u64,
}

/// Frames queued for the controller since its last poll.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub frames: Vec<Frame>,
}
