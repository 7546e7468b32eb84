//! API v1 routes.

mod fleet;
mod peers;

use axum::Router;

use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/peers", peers::routes())
        .nest("/fleet", fleet::routes())
        // Controller links: WebSocket stream and HTTP poll
        .nest("/link", crate::link::routes())
}
