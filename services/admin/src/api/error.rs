use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use fleet_id::RequestId;
use fleet_link::DispatchError;
use serde::Serialize;

use crate::pending::StoreError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://fleetlink.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            request_id: RequestId::new().to_string(),
            retryable: false,
        }
    }
}

/// Error returned by the admin HTTP API as `application/problem+json`.
#[derive(Debug)]
pub struct AdminApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl AdminApiError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    /// The resource existed but is gone for good, e.g. a closed poll session.
    pub fn gone(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::GONE, code, message)
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, code, message)
    }

    pub fn service_unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message).retryable()
    }

    pub fn gateway_timeout(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn retryable(mut self) -> Self {
        self.problem.retryable = true;
        self
    }
}

impl From<DispatchError> for AdminApiError {
    fn from(err: DispatchError) -> Self {
        let message = err.to_string();
        match err {
            DispatchError::NotConnected(_) => {
                Self::conflict("peer_not_connected", message).retryable()
            }
            DispatchError::Timeout { .. } => Self::gateway_timeout("command_timeout", message),
            DispatchError::Cancelled { .. } | DispatchError::Send(_) => {
                Self::service_unavailable("link_lost", message)
            }
            DispatchError::Failed { .. } => Self::bad_gateway("command_failed", message),
        }
    }
}

impl From<StoreError> for AdminApiError {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "Pending-sync store failure");
        Self::internal("internal_error", "pending-sync store unavailable")
    }
}

impl IntoResponse for AdminApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_id::{CommandId, ControllerId, PeerId};
    use rstest::rstest;

    #[rstest]
    #[case::not_connected(
        DispatchError::NotConnected(PeerId::Controller(ControllerId::new())),
        StatusCode::CONFLICT,
        true
    )]
    #[case::timeout(
        DispatchError::Timeout { command_id: CommandId::new(), timeout_ms: 10 },
        StatusCode::GATEWAY_TIMEOUT,
        false
    )]
    #[case::cancelled(
        DispatchError::Cancelled { command_id: CommandId::new() },
        StatusCode::SERVICE_UNAVAILABLE,
        true
    )]
    #[case::failed(
        DispatchError::Failed { command_id: CommandId::new(), message: "no display".into() },
        StatusCode::BAD_GATEWAY,
        false
    )]
    fn test_dispatch_error_mapping(
        #[case] err: DispatchError,
        #[case] status: StatusCode,
        #[case] retryable: bool,
    ) {
        let api: AdminApiError = err.into();
        assert_eq!(api.status, status);
        assert_eq!(api.problem.retryable, retryable);
    }

    #[test]
    fn test_problem_json_content_type() {
        let response = AdminApiError::gone("poll_session_closed", "closed").into_response();
        assert_eq!(response.status(), StatusCode::GONE);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }
}
