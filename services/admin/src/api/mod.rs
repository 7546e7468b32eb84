//! HTTP API handlers and routing.

pub mod error;
mod health;
mod v1;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the admin router: health checks, the operational API, and the
/// controller link endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .merge(health::routes())
        // Operational API and controller links
        .nest("/v1", v1::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header::CONTENT_TYPE, Request, StatusCode},
    };
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::pending::MemoryPendingStore;

    fn router() -> Router {
        create_router(AppState::new(
            Config::default(),
            Arc::new(MemoryPendingStore::new()),
        ))
    }

    #[tokio::test]
    async fn test_routes_are_mounted() {
        let response = router()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router()
            .oneshot(Request::get("/v1/peers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["peers"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_unknown_peer_is_problem_json() {
        let uri = format!("/v1/peers/{}", fleet_id::ControllerId::new());
        let response = router()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }

    #[tokio::test]
    async fn test_poll_endpoint_opens_session() {
        let body = serde_json::json!({
            "controller_id": fleet_id::ControllerId::new(),
            "session_id": "s1",
            "frames": [],
        });
        let response = router()
            .oneshot(
                Request::post("/v1/link/poll")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["frames"], serde_json::json!([]));
    }
}
