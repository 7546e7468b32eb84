//! Sync message envelope and the sending-side emitter.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fleet_id::{MessageId, PeerId};
use serde::{Deserialize, Serialize};

use crate::checksum::{canonical_json, checksum};
use crate::compression::{decode_b64, encode_b64, gunzip, gzip};
use crate::{CompressionAlgorithm, CompressionInfo, SyncError, VectorClock};

/// Kind of state carried by a sync message; selects the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMessageType {
    Heartbeat,
    Status,
    Config,
    Metrics,
    Event,
}

impl std::fmt::Display for SyncMessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncMessageType::Heartbeat => "HEARTBEAT",
            SyncMessageType::Status => "STATUS",
            SyncMessageType::Config => "CONFIG",
            SyncMessageType::Metrics => "METRICS",
            SyncMessageType::Event => "EVENT",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// An ordered state-propagation unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub id: MessageId,

    #[serde(rename = "type")]
    pub message_type: SyncMessageType,

    pub source: PeerId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PeerId>,

    /// JSON payload, or a base64 string of gzip bytes when `compression`
    /// is enabled.
    pub payload: serde_json::Value,

    pub checksum: String,

    #[serde(default)]
    pub priority: Priority,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,

    /// Monotonic per source. Absent only for synthetic messages from
    /// sources that never sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_clock: Option<VectorClock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionInfo>,
}

impl SyncMessage {
    /// Build an unsequenced message. Used for synthetic messages from
    /// sources that never participate in sequencing.
    pub fn unsequenced(
        source: PeerId,
        message_type: SyncMessageType,
        payload: serde_json::Value,
    ) -> Self {
        let sum = checksum(canonical_json(&payload).as_bytes());
        Self {
            id: MessageId::new(),
            message_type,
            source,
            target: None,
            payload,
            checksum: sum,
            priority: Priority::Normal,
            timestamp: Utc::now(),
            ttl_ms: None,
            sequence_number: None,
            ordering_key: None,
            vector_clock: None,
            compression: None,
        }
    }

    fn is_compressed(&self) -> bool {
        self.compression.as_ref().is_some_and(|c| c.enabled)
    }

    /// Verify the checksum and return the decoded JSON payload.
    pub fn open(&self) -> Result<serde_json::Value, SyncError> {
        if self.is_compressed() {
            let encoded = self.payload.as_str().ok_or_else(|| {
                SyncError::InvalidPayload("compressed payload must be a string".to_string())
            })?;
            let bytes = decode_b64(encoded)?;
            self.verify(&bytes)?;
            let raw = gunzip(&bytes)?;
            return serde_json::from_slice(&raw).map_err(SyncError::from);
        }

        self.verify(canonical_json(&self.payload).as_bytes())?;
        Ok(self.payload.clone())
    }

    fn verify(&self, bytes: &[u8]) -> Result<(), SyncError> {
        let actual = checksum(bytes);
        if actual != self.checksum {
            return Err(SyncError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Returns `Some(age)` if the message outlived its ttl at `now`.
    pub fn expired_at(&self, now: DateTime<Utc>) -> Option<i64> {
        let ttl = self.ttl_ms?;
        let age_ms = (now - self.timestamp).num_milliseconds();
        (age_ms > ttl as i64).then_some(age_ms)
    }
}

#[derive(Debug, Default)]
struct EmitterState {
    next_seq: u64,
    clock: VectorClock,
}

/// Stamps outbound messages for one source: sequence number, vector clock,
/// checksum and optional compression.
#[derive(Debug)]
pub struct SyncEmitter {
    source: PeerId,
    source_key: String,
    compress_above: Option<usize>,
    default_ttl_ms: Option<u64>,
    state: Mutex<EmitterState>,
}

impl SyncEmitter {
    pub fn new(source: PeerId) -> Self {
        Self {
            source,
            source_key: source.to_string(),
            compress_above: None,
            default_ttl_ms: None,
            state: Mutex::new(EmitterState::default()),
        }
    }

    /// Compress payloads whose canonical form is at least `bytes` long.
    pub fn with_compression_threshold(mut self, bytes: usize) -> Self {
        self.compress_above = Some(bytes);
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.default_ttl_ms = Some(ttl_ms);
        self
    }

    pub fn source(&self) -> PeerId {
        self.source
    }

    /// Restart sequencing at 1. Called when a new session with the receiver
    /// begins, since the receiver resets its view of this source as well.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = EmitterState::default();
    }

    /// Merge a clock observed from another source into this emitter's view.
    pub fn observe(&self, clock: &VectorClock) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.clock.merge(clock);
    }

    pub fn emit(
        &self,
        message_type: SyncMessageType,
        payload: serde_json::Value,
        target: Option<PeerId>,
        priority: Priority,
    ) -> Result<SyncMessage, SyncError> {
        let canonical = canonical_json(&payload);

        let (payload, sum, compression) = match self.compress_above {
            Some(threshold) if canonical.len() >= threshold => {
                let compressed = gzip(canonical.as_bytes())?;
                let info = CompressionInfo {
                    enabled: true,
                    algorithm: CompressionAlgorithm::Gzip,
                    original_size: canonical.len(),
                    compressed_size: compressed.len(),
                };
                let sum = checksum(&compressed);
                (serde_json::Value::String(encode_b64(&compressed)), sum, Some(info))
            }
            _ => {
                let sum = checksum(canonical.as_bytes());
                (payload, sum, None)
            }
        };

        let (seq, clock) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.next_seq += 1;
            let seq = state.next_seq;
            state.clock.observe(&self.source_key, seq);
            (seq, state.clock.clone())
        };

        Ok(SyncMessage {
            id: MessageId::new(),
            message_type,
            source: self.source,
            target,
            payload,
            checksum: sum,
            priority,
            timestamp: Utc::now(),
            ttl_ms: self.default_ttl_ms,
            sequence_number: Some(seq),
            ordering_key: Some(format!("{}:{}", self.source_key, message_type)),
            vector_clock: Some(clock),
            compression,
        })
    }
}
