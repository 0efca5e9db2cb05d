//! Scheduled-delay capability
//!
//! Backoff waits go through a [`Scheduler`] instead of sleeping inline, so a
//! waiting receiver parks its task rather than a worker thread, and tests can
//! swap in a scheduler that records delays without waiting.

use async_trait::async_trait;
use std::time::Duration;

/// Source of timed delays
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Complete after `duration` has elapsed.
    ///
    /// Callers race this against their stop signal, so implementations must
    /// be cancel-safe.
    async fn delay(&self, duration: Duration);
}

/// Timer-wheel backed scheduler on the tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

#[async_trait]
impl Scheduler for TokioScheduler {
    async fn delay(&self, duration: Duration) {
        if duration.is_zero() {
            tokio::task::yield_now().await;
            return;
        }
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_waits() {
        let start = tokio::time::Instant::now();
        TokioScheduler.delay(Duration::from_millis(250)).await;
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_zero_delay_returns() {
        TokioScheduler.delay(Duration::ZERO).await;
    }
}
