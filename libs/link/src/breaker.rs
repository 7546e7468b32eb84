//! Per-peer circuit breakers.
//!
//! CLOSED counts failures; reaching the threshold opens the circuit for a
//! cooldown. When the cooldown passes the breaker moves to HALF_OPEN and
//! lets a bounded number of trial attempts through. A failure in HALF_OPEN
//! reopens with a fresh cooldown; any success closes it again.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use fleet_id::PeerId;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,

    /// How long an open circuit rejects attempts.
    pub cooldown: Duration,

    /// Trial attempts allowed while half-open.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// Read-only view of one breaker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<Instant>,
    pub next_attempt_at: Option<Instant>,
}

impl BreakerSnapshot {
    /// Time left before an open circuit admits a trial attempt.
    pub fn retry_in(&self, now: Instant) -> Option<Duration> {
        match (self.state, self.next_attempt_at) {
            (CircuitState::Open, Some(at)) => Some(at.saturating_duration_since(now)),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct BreakerRecord {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    half_open_calls: u32,
}

/// Breaker table keyed by peer. Records are created on first use and live
/// for the lifetime of the table.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    config: BreakerConfig,
    records: Mutex<HashMap<PeerId, BreakerRecord>>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn can_attempt(&self, peer: PeerId) -> bool {
        self.can_attempt_at(peer, Instant::now())
    }

    /// Whether a connection attempt to `peer` may proceed at `now`. A
    /// half-open breaker counts each `true` as one trial call.
    pub fn can_attempt_at(&self, peer: PeerId, now: Instant) -> bool {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(peer).or_default();

        if record.state == CircuitState::Open {
            match record.next_attempt_at {
                Some(at) if now >= at => {
                    info!(peer = %peer, "Circuit half-open, allowing trial attempts");
                    record.state = CircuitState::HalfOpen;
                    record.half_open_calls = 0;
                }
                _ => return false,
            }
        }

        if record.state == CircuitState::HalfOpen {
            if record.half_open_calls >= self.config.half_open_max_calls {
                return false;
            }
            record.half_open_calls += 1;
        }

        true
    }

    pub fn record_success(&self, peer: PeerId) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(peer).or_default();
        if record.state != CircuitState::Closed {
            info!(peer = %peer, "Circuit closed");
        }
        *record = BreakerRecord::default();
    }

    pub fn record_failure(&self, peer: PeerId) {
        self.record_failure_at(peer, Instant::now());
    }

    pub fn record_failure_at(&self, peer: PeerId, now: Instant) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records.entry(peer).or_default();

        record.failure_count = record.failure_count.saturating_add(1);
        record.last_failure_at = Some(now);

        let trip = match record.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => record.failure_count >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if trip {
            warn!(
                peer = %peer,
                failures = record.failure_count,
                cooldown_secs = self.config.cooldown.as_secs(),
                "Circuit opened"
            );
            record.state = CircuitState::Open;
            record.next_attempt_at = Some(now + self.config.cooldown);
            record.half_open_calls = 0;
        }
    }

    /// Current breaker state. Never transitions the breaker.
    pub fn snapshot(&self, peer: PeerId) -> BreakerSnapshot {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records
            .get(&peer)
            .map(|r| BreakerSnapshot {
                state: r.state,
                failure_count: r.failure_count,
                last_failure_at: r.last_failure_at,
                next_attempt_at: r.next_attempt_at,
            })
            .unwrap_or_default()
    }
}
