//! # fleet-proto
//!
//! Messages exchanged between fleet tiers over a supervised connection.
//!
//! Every message travels inside a [`Frame`], which is serialized as a JSON
//! object `{"kind": "...", "body": {...}}`. Payload shapes are tagged unions
//! so each command or message kind carries exactly the fields it needs.

mod command;
mod error;
mod frame;
mod poll;
mod registration;
mod status;

pub use command::{
    Command, CommandEnvelope, CommandResponse, CookieDomain, Dashboard, SyncType,
};
pub use error::{ErrorCode, ErrorResponse, ProtoError};
pub use frame::{Frame, SyncAckStatus};
pub use poll::{PollRequest, PollResponse};
pub use registration::{RegistrationRequest, RegistrationResponse, SystemInfo};
pub use status::{
    HostStateReport, NodeStatus, ResourceMetrics, ServiceStatus, StatusAck, StatusUpdate,
};
