//! Receiving-side ordering engine.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_id::{MessageId, PeerId};
use tracing::{debug, warn};

use crate::{SyncError, SyncMessage, SyncMessageType, VectorClock};

/// Applies one type of sync message to local state.
#[async_trait]
pub trait SyncHandler: Send + Sync {
    async fn handle(
        &self,
        message: &SyncMessage,
        payload: &serde_json::Value,
    ) -> Result<(), SyncError>;
}

/// Result of submitting a message to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The message was applied, along with `applied - 1` buffered messages
    /// it unblocked.
    Applied { applied: usize, last_applied: Option<u64> },

    /// The message arrived ahead of its predecessors and was buffered.
    Queued { expected: u64, received: u64 },

    /// The sequence number was already applied or is already buffered.
    Duplicate { last_applied: u64 },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum entries in the message log.
    pub max_log_entries: usize,

    /// Maximum buffered messages per source.
    pub max_pending_per_source: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_log_entries: 10_000,
            max_pending_per_source: 10_000,
        }
    }
}

/// Audit record of an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub message_id: MessageId,
    pub source: PeerId,
    pub message_type: SyncMessageType,
    pub sequence_number: Option<u64>,
    pub checksum: String,
    pub received_at: DateTime<Utc>,
}

/// Read-only view of a source's ordering state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSnapshot {
    pub last_applied: u64,
    pub pending: usize,
}

#[derive(Debug)]
struct Buffered {
    message: SyncMessage,
    payload: serde_json::Value,
}

#[derive(Debug, Default)]
struct SourceState {
    last_applied: u64,
    sequenced: bool,
    /// Arrival order; oldest evicted first.
    pending: VecDeque<Buffered>,
}

impl SourceState {
    fn is_buffered(&self, seq: u64) -> bool {
        self.pending
            .iter()
            .any(|b| b.message.sequence_number == Some(seq))
    }

    /// Remove the next eligible buffered message, breaking ties by
    /// timestamp, then sequence, then id.
    fn take_next(&mut self) -> Option<Buffered> {
        let expected = self.last_applied + 1;
        self.pending
            .retain(|b| b.message.sequence_number.is_some_and(|s| s >= expected));

        let index = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, b)| b.message.sequence_number == Some(expected))
            .min_by(|(_, a), (_, b)| {
                (a.message.timestamp, a.message.sequence_number, a.message.id).cmp(&(
                    b.message.timestamp,
                    b.message.sequence_number,
                    b.message.id,
                ))
            })
            .map(|(i, _)| i)?;

        self.pending.remove(index)
    }
}

/// Applies inbound sync messages in causal order per source.
///
/// Each source's state sits behind its own async mutex, so messages from
/// one source are applied one at a time while different sources proceed
/// independently.
pub struct OrderingEngine {
    config: EngineConfig,
    handlers: HashMap<SyncMessageType, Arc<dyn SyncHandler>>,
    sources: Mutex<HashMap<PeerId, Arc<tokio::sync::Mutex<SourceState>>>>,
    clock: Mutex<VectorClock>,
    log: Mutex<VecDeque<LogEntry>>,
}

impl OrderingEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            handlers: HashMap::new(),
            sources: Mutex::new(HashMap::new()),
            clock: Mutex::new(VectorClock::new()),
            log: Mutex::new(VecDeque::new()),
        }
    }

    /// Register the handler for one message type. Messages of a type with
    /// no handler are still sequenced and logged.
    pub fn with_handler(
        mut self,
        message_type: SyncMessageType,
        handler: Arc<dyn SyncHandler>,
    ) -> Self {
        self.handlers.insert(message_type, handler);
        self
    }

    fn source_state(&self, source: PeerId) -> Arc<tokio::sync::Mutex<SourceState>> {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(sources.entry(source).or_default())
    }

    /// Forget everything known about a source. Called when the source
    /// starts a new session and restarts its sequence at 1.
    pub fn reset_source(&self, source: PeerId) {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        sources.remove(&source);
    }

    pub async fn source_snapshot(&self, source: PeerId) -> Option<SourceSnapshot> {
        let state = {
            let sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
            sources.get(&source).cloned()
        }?;
        let state = state.lock().await;
        Some(SourceSnapshot {
            last_applied: state.last_applied,
            pending: state.pending.len(),
        })
    }

    /// Merged vector clock of everything applied so far.
    pub fn vector_clock(&self) -> VectorClock {
        self.clock.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn log_len(&self) -> usize {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn recent_log(&self, limit: usize) -> Vec<LogEntry> {
        let log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.iter().rev().take(limit).cloned().collect()
    }

    /// Verify, then apply or buffer, one inbound message.
    pub async fn process(&self, message: SyncMessage) -> Result<SyncOutcome, SyncError> {
        let payload = message.open()?;

        if let Some(age_ms) = message.expired_at(Utc::now()) {
            return Err(SyncError::Expired {
                age_ms,
                ttl_ms: message.ttl_ms.unwrap_or_default(),
            });
        }

        self.record(&message);

        let state = self.source_state(message.source);
        let mut state = state.lock().await;

        let Some(seq) = message.sequence_number else {
            if state.sequenced || !state.pending.is_empty() {
                return Err(SyncError::MissingSequence {
                    source_id: message.source.to_string(),
                });
            }
            self.apply(&message, &payload).await?;
            return Ok(SyncOutcome::Applied {
                applied: 1,
                last_applied: None,
            });
        };

        let expected = state.last_applied + 1;

        if seq < expected || (seq > expected && state.is_buffered(seq)) {
            debug!(
                source = %message.source,
                seq,
                last_applied = state.last_applied,
                "Dropping duplicate sync message"
            );
            return Ok(SyncOutcome::Duplicate {
                last_applied: state.last_applied,
            });
        }

        if seq > expected {
            debug!(
                source = %message.source,
                seq,
                expected,
                "Buffering out-of-order sync message"
            );
            state.pending.push_back(Buffered { message, payload });
            while state.pending.len() > self.config.max_pending_per_source {
                if let Some(evicted) = state.pending.pop_front() {
                    warn!(
                        source = %evicted.message.source,
                        seq = ?evicted.message.sequence_number,
                        "Pending queue full, evicting oldest message"
                    );
                }
            }
            return Ok(SyncOutcome::Queued {
                expected,
                received: seq,
            });
        }

        self.apply(&message, &payload).await?;
        state.last_applied = seq;
        state.sequenced = true;
        let mut applied = 1;

        while let Some(next) = state.take_next() {
            let next_seq = next.message.sequence_number.unwrap_or_default();
            if let Err(e) = self.apply(&next.message, &next.payload).await {
                warn!(
                    source = %next.message.source,
                    seq = next_seq,
                    error = %e,
                    "Buffered sync message failed to apply"
                );
                state.pending.push_front(next);
                break;
            }
            state.last_applied = next_seq;
            applied += 1;
        }

        Ok(SyncOutcome::Applied {
            applied,
            last_applied: Some(state.last_applied),
        })
    }

    async fn apply(
        &self,
        message: &SyncMessage,
        payload: &serde_json::Value,
    ) -> Result<(), SyncError> {
        match self.handlers.get(&message.message_type) {
            Some(handler) => handler.handle(message, payload).await?,
            None => debug!(
                message_type = %message.message_type,
                source = %message.source,
                "No handler registered, message sequenced only"
            ),
        }

        let mut clock = self.clock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(seq) = message.sequence_number {
            clock.observe(&message.source.to_string(), seq);
        }
        if let Some(remote) = &message.vector_clock {
            clock.merge(remote);
        }
        Ok(())
    }

    fn record(&self, message: &SyncMessage) {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.push_back(LogEntry {
            message_id: message.id,
            source: message.source,
            message_type: message.message_type,
            sequence_number: message.sequence_number,
            checksum: message.checksum.clone(),
            received_at: Utc::now(),
        });
        while log.len() > self.config.max_log_entries {
            log.pop_front();
        }
    }
}
