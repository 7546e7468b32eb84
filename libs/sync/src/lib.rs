//! # fleet-sync
//!
//! Causally ordered state propagation between fleet tiers.
//!
//! A [`SyncMessage`] carries a JSON payload, a checksum over that payload,
//! a per-source sequence number and a vector clock. The [`OrderingEngine`]
//! on the receiving side verifies each message and applies it in sequence
//! order per source, buffering early arrivals until the gap closes.
//!
//! ## Invariants
//!
//! - A message whose checksum does not match its payload is never applied
//!   or buffered.
//! - For a given source, handlers observe strictly increasing sequence
//!   numbers with no gaps.
//! - Out-of-order arrival is a deferred success ([`SyncOutcome::Queued`]),
//!   not an error.

mod checksum;
mod clock;
mod compression;
mod engine;
mod error;
mod message;

pub use checksum::{canonical_json, checksum};
pub use clock::{CausalOrder, VectorClock};
pub use compression::{CompressionAlgorithm, CompressionInfo};
pub use engine::{EngineConfig, LogEntry, OrderingEngine, SourceSnapshot, SyncHandler, SyncOutcome};
pub use error::SyncError;
pub use message::{Priority, SyncEmitter, SyncMessage, SyncMessageType};
