//! Reconnection backoff.

use std::time::Duration;

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Upper bound for any delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based; 0 is treated as 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

/// Backoff plus an optional attempt budget.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub backoff: BackoffPolicy,

    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Delay before retry `attempt`, or `None` once the budget is spent.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if attempt > max => None,
            _ => Some(self.backoff.delay(attempt)),
        }
    }
}
