//! Receiver counters
//!
//! All counters are `AtomicU64` with `Ordering::Relaxed`; they are observed,
//! never used for control flow.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time copy of [`ReceiverMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverMetricsSnapshot {
    pub create_attempts: u64,
    pub pulls: u64,
    pub empty_pulls: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub messages_delivered: u64,
    pub delivery_failures: u64,
    pub messages_acked: u64,
    pub ack_failures: u64,
    pub retries: u64,
    pub errors: u64,
}

impl ReceiverMetricsSnapshot {
    /// Messages handed to the sink but not (yet) acknowledged
    pub fn unacked(&self) -> u64 {
        self.messages_delivered.saturating_sub(self.messages_acked)
    }

    /// Share of pulls that returned nothing, in percent
    pub fn empty_pull_rate_percent(&self) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            self.empty_pulls as f64 / self.pulls as f64 * 100.0
        }
    }
}

/// Lock-free receiver counters
#[derive(Debug, Default)]
pub struct ReceiverMetrics {
    pub(crate) create_attempts: AtomicU64,
    pub(crate) pulls: AtomicU64,
    pub(crate) empty_pulls: AtomicU64,
    pub(crate) messages_received: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
    pub(crate) messages_delivered: AtomicU64,
    pub(crate) delivery_failures: AtomicU64,
    pub(crate) messages_acked: AtomicU64,
    pub(crate) ack_failures: AtomicU64,
    pub(crate) retries: AtomicU64,
    pub(crate) errors: AtomicU64,
}

impl ReceiverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_pull(&self, messages: u64, bytes: u64) {
        self.pulls.fetch_add(1, Ordering::Relaxed);
        if messages == 0 {
            self.empty_pulls.fetch_add(1, Ordering::Relaxed);
        }
        self.messages_received.fetch_add(messages, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReceiverMetricsSnapshot {
        ReceiverMetricsSnapshot {
            create_attempts: self.create_attempts.load(Ordering::Relaxed),
            pulls: self.pulls.load(Ordering::Relaxed),
            empty_pulls: self.empty_pulls.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_pull() {
        let metrics = ReceiverMetrics::new();
        metrics.record_pull(3, 120);
        metrics.record_pull(0, 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pulls, 2);
        assert_eq!(snapshot.empty_pulls, 1);
        assert_eq!(snapshot.messages_received, 3);
        assert_eq!(snapshot.bytes_received, 120);
        assert_eq!(snapshot.empty_pull_rate_percent(), 50.0);
    }

    #[test]
    fn test_unacked() {
        let metrics = ReceiverMetrics::new();
        ReceiverMetrics::incr(&metrics.messages_delivered);
        ReceiverMetrics::incr(&metrics.messages_delivered);
        ReceiverMetrics::incr(&metrics.messages_acked);
        assert_eq!(metrics.snapshot().unacked(), 1);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = ReceiverMetrics::new().snapshot();
        assert_eq!(snapshot, ReceiverMetricsSnapshot::default());
        assert_eq!(snapshot.empty_pull_rate_percent(), 0.0);
    }
}
