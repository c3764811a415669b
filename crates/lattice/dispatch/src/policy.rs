//! Retry and expiry policy

use std::time::Duration;

/// Bounded exponential backoff and entry lifetimes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sends per command, the first included
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Unacknowledged commands are failed after this long
    pub ack_timeout: Duration,
    /// How long settled and failed entries are kept
    pub entry_ttl: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            entry_ttl: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before resending after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
