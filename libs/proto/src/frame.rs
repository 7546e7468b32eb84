//! The duplex frame envelope.

use fleet_id::MessageId;
use fleet_sync::{SyncMessage, SyncOutcome};
use serde::{Deserialize, Serialize};

use crate::{
    CommandEnvelope, CommandResponse, ErrorResponse, ProtoError, RegistrationRequest,
    RegistrationResponse, StatusAck, StatusUpdate,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAckStatus {
    Applied,
    Queued,
    Duplicate,
    Rejected,
}

impl From<&SyncOutcome> for SyncAckStatus {
    fn from(outcome: &SyncOutcome) -> Self {
        match outcome {
            SyncOutcome::Applied { .. } => SyncAckStatus::Applied,
            SyncOutcome::Queued { .. } => SyncAckStatus::Queued,
            SyncOutcome::Duplicate { .. } => SyncAckStatus::Duplicate,
        }
    }
}

/// One message on a duplex link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Frame {
    /// Liveness check; the receiving reader answers with `Pong`.
    Ping { nonce: u64 },
    Pong { nonce: u64 },
    Register(RegistrationRequest),
    RegisterAck(RegistrationResponse),
    Status(StatusUpdate),
    StatusAck(StatusAck),
    Command(CommandEnvelope),
    CommandResult(CommandResponse),
    Sync(SyncMessage),
    SyncAck {
        message_id: MessageId,
        status: SyncAckStatus,
    },
    Error(ErrorResponse),
}

impl Frame {
    pub fn encode(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Ping { .. } => "ping",
            Frame::Pong { .. } => "pong",
            Frame::Register(_) => "register",
            Frame::RegisterAck(_) => "register_ack",
            Frame::Status(_) => "status",
            Frame::StatusAck(_) => "status_ack",
            Frame::Command(_) => "command",
            Frame::CommandResult(_) => "command_result",
            Frame::Sync(_) => "sync",
            Frame::SyncAck { .. } => "sync_ack",
            Frame::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;
    use rstest::rstest;

    #[rstest]
    #[case(Frame::Ping { nonce: 7 }, "ping")]
    #[case(Frame::StatusAck(StatusAck::now()), "status_ack")]
    #[case(Frame::Error(ErrorResponse::not_registered()), "error")]
    fn test_kind_matches_wire_tag(#[case] frame: Frame, #[case] kind: &str) {
        let text = frame.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["kind"], kind);
        assert_eq!(frame.kind(), kind);
        assert_eq!(Frame::decode(&text).unwrap(), frame);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            Frame::decode("{\"kind\":\"teleport\"}"),
            Err(ProtoError::Malformed(_))
        ));
        assert!(Frame::decode("not json").is_err());
    }

    #[test]
    fn test_not_registered_error_shape() {
        let value = serde_json::to_value(Frame::Error(ErrorResponse::not_registered())).unwrap();
        assert_eq!(value["body"]["error_code"], "NOT_REGISTERED");
        assert_eq!(
            ErrorResponse::not_registered().error_code,
            ErrorCode::NotRegistered
        );
    }
}
