use std::time::Duration;

use crate::error::ErrorKind;

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    GiveUp,
    RetryAfter(Duration),
}

/// Exponential backoff with a ceiling.
///
/// Delay schedule: `base * 2^(attempts-1)`, capped at `max_delay`.
/// With a 1s base: 1s, 2s, 4s, 8s, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Decide what to do after `attempts` finished attempts, the last of
    /// which failed with `kind`.
    pub fn decide(&self, attempts: u32, kind: ErrorKind) -> RetryDecision {
        if !kind.is_retryable() || attempts >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_for_attempt(attempts))
    }

    /// Backoff before the attempt following attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        std::cmp::min(delay, self.max_delay)
    }
}
