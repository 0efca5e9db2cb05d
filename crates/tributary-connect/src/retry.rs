//! Backoff policy for subscription-management and fetch calls
//!
//! [`BackoffPolicy`] is a plain value shared read-only by every receiver.
//! [`RetryGuard`] tracks the attempts of one failing operation against it.

use std::time::Duration;

/// Exponential backoff with a delay cap and an attempt bound.
///
/// The delay before retry `n` (0-indexed) is
/// `min(initial_delay * factor^n, max_delay)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Multiplier applied per retry
    pub factor: f64,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Total attempts including the first one
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    /// 100ms doubling up to 10s, five attempts in total.
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_millis(10_000),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Delay before retry number `retry` (0 = first retry)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        // cap the exponent so powi stays finite
        let exponent = retry.min(64) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.factor.powi(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms.max(0.0) as u64)
    }

    /// Sum of all delays a persistently failing operation waits through
    pub fn total_delay(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|retry| self.delay_for_retry(retry))
            .sum()
    }
}

/// Attempt tracker for a single operation
#[derive(Debug)]
pub struct RetryGuard {
    policy: BackoffPolicy,
    failures: u32,
}

impl RetryGuard {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Record a failed attempt.
    ///
    /// Returns the delay to wait before the next attempt, or `None` once the
    /// attempt bound is reached.
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures < self.policy.max_attempts {
            Some(self.policy.delay_for_retry(self.failures - 1))
        } else {
            None
        }
    }

    /// Failed attempts recorded so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }
}
