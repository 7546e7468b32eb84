//! Error frames and decode errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while encoding, decoding or validating wire messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Machine-readable error code carried in an [`ErrorResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotRegistered,
    InvalidMessage,
    RegistrationRejected,
    UnknownCommand,
    PeerNotConnected,
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::NotRegistered => "NOT_REGISTERED",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::RegistrationRejected => "REGISTRATION_REJECTED",
            ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            ErrorCode::PeerNotConnected => "PEER_NOT_CONNECTED",
            ErrorCode::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// Error reply usable by any tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: ErrorCode,
    pub error_message: String,
    pub retry_suggested: bool,
}

impl ErrorResponse {
    pub fn new(error_code: ErrorCode, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            error_message: error_message.into(),
            retry_suggested: false,
        }
    }

    pub fn not_registered() -> Self {
        Self {
            error_code: ErrorCode::NotRegistered,
            error_message: "status update received before registration".to_string(),
            retry_suggested: true,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retry_suggested = true;
        self
    }
}

impl From<&ProtoError> for ErrorResponse {
    fn from(err: &ProtoError) -> Self {
        ErrorResponse::new(ErrorCode::InvalidMessage, err.to_string())
    }
}
