//! Inbound controller links.
//!
//! Controllers reach the admin over either transport; both end up as a
//! connection attached to the admin's supervisor:
//!
//! - `GET /v1/link/stream?controller_id=...` upgrades to a WebSocket
//!   carrying one JSON frame per text message.
//! - `POST /v1/link/poll` exchanges frame batches over plain HTTP. Each
//!   polling session is bridged into a virtual duplex connection.

mod poll;
mod stream;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub use poll::PollSessions;

/// Create link routes, nested under `/v1/link`.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/stream", get(stream::connect))
        .route("/poll", post(poll::poll))
}
