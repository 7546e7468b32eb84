//! Error types for sync message handling.

use thiserror::Error;

/// Reasons a sync message is rejected.
///
/// These are protocol errors: the receiver logs and drops the message and
/// never retries on its own. An out-of-order message is not an error; see
/// [`crate::SyncOutcome::Queued`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("checksum mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("failed to decompress payload: {0}")]
    Decompress(String),

    #[error("message expired: age {age_ms}ms exceeds ttl {ttl_ms}ms")]
    Expired { age_ms: i64, ttl_ms: u64 },

    /// The source has already delivered sequenced messages, so an
    /// unsequenced one could overtake a buffered message.
    #[error("message from sequenced source {source_id} carries no sequence number")]
    MissingSequence { source_id: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{message_type} handler failed: {reason}")]
    Handler {
        message_type: String,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}
