//! Parallel receivers
//!
//! Each receiver in a group has its own lifecycle and client. They share
//! the settings (backoff policy included) and the [`BucketCounter`] injected
//! through [`ReceiverBuilder::bucket_counter`], so every receiver built from
//! that counter, in this group or any other, gets its own partition label
//! until the label space wraps.
//!
//! [`BucketCounter`]: super::receiver::BucketCounter

use super::receiver::{PubSubReceiver, ReceiverBuilder};
use crate::error::{ConnectorError, ConnectorResult};
use crate::lifecycle::StopCause;
use crate::metrics::ReceiverMetricsSnapshot;
use futures::future::join_all;
use tracing::info;

/// A fixed set of receivers started and stopped together
#[derive(Debug)]
pub struct ReceiverGroup {
    receivers: Vec<PubSubReceiver>,
}

impl ReceiverGroup {
    /// Build `count` receivers from one builder, named `{subscription}-{bucket}`.
    ///
    /// The builder must carry a bucket counter.
    pub fn build(builder: ReceiverBuilder, count: u32) -> ConnectorResult<Self> {
        if count == 0 {
            return Err(ConnectorError::config("receiver count must be at least 1"));
        }
        if !builder.has_bucket_counter() {
            return Err(ConnectorError::config(
                "receiver group requires a bucket counter",
            ));
        }

        let receivers = (0..count)
            .map(|_| builder.clone().build())
            .collect::<ConnectorResult<Vec<_>>>()?;

        Ok(Self { receivers })
    }

    pub fn receivers(&self) -> &[PubSubReceiver] {
        &self.receivers
    }

    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    /// Run all receivers concurrently until each has stopped
    pub async fn run(&self) -> Vec<Option<StopCause>> {
        info!(receivers = self.receivers.len(), "Starting receiver group");
        join_all(self.receivers.iter().map(|r| r.run())).await
    }

    /// Request a stop of every receiver. Returns how many were still running.
    pub fn stop_all(&self, reason: &str) -> usize {
        self.receivers
            .iter()
            .filter(|r| r.stop(StopCause::requested(reason)))
            .count()
    }

    pub fn all_stopped(&self) -> bool {
        self.receivers.iter().all(PubSubReceiver::is_stopped)
    }

    pub fn metrics(&self) -> Vec<ReceiverMetricsSnapshot> {
        self.receivers.iter().map(PubSubReceiver::metrics).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::{BucketCounter, ReceiverSettings, SubscriptionTarget};
    use crate::testing::{CollectingSink, RecordingStopHook, ScriptedClient, ScriptedFactory};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn unlabelled(hook: Arc<RecordingStopHook>) -> ReceiverBuilder {
        let client = Arc::new(ScriptedClient::new());
        PubSubReceiver::builder(ReceiverSettings::new(SubscriptionTarget::new("p", "sub")))
            .client_factory(Arc::new(ScriptedFactory::new(client)))
            .sink(Arc::new(CollectingSink::new()))
            .stop_hook(hook)
    }

    fn builder(hook: Arc<RecordingStopHook>, buckets: u32) -> ReceiverBuilder {
        unlabelled(hook).bucket_counter(BucketCounter::new(), buckets)
    }

    fn buckets(group: &ReceiverGroup) -> HashSet<u32> {
        group.receivers().iter().map(|r| r.bucket()).collect()
    }

    #[test]
    fn test_distinct_buckets_and_names() {
        let group =
            ReceiverGroup::build(builder(Arc::new(RecordingStopHook::new()), 4), 4).unwrap();
        assert_eq!(group.len(), 4);

        assert_eq!(buckets(&group), HashSet::from([0, 1, 2, 3]));
        assert_eq!(group.receivers()[2].name(), "sub-2");
    }

    #[test]
    fn test_groups_sharing_a_counter_get_distinct_buckets() {
        let counter = BucketCounter::new();
        let shared = unlabelled(Arc::new(RecordingStopHook::new())).bucket_counter(counter, 4);

        let first = ReceiverGroup::build(shared.clone(), 2).unwrap();
        let second = ReceiverGroup::build(shared, 2).unwrap();

        assert_eq!(buckets(&first), HashSet::from([0, 1]));
        assert_eq!(buckets(&second), HashSet::from([2, 3]));
        assert_eq!(second.receivers()[0].name(), "sub-2");
    }

    #[test]
    fn test_zero_receivers_rejected() {
        assert!(ReceiverGroup::build(builder(Arc::new(RecordingStopHook::new()), 1), 0).is_err());
    }

    #[test]
    fn test_missing_counter_rejected() {
        let err = ReceiverGroup::build(unlabelled(Arc::new(RecordingStopHook::new())), 2)
            .unwrap_err();
        assert!(err.to_string().contains("bucket counter"));
    }

    #[test]
    fn test_stop_all() {
        let hook = Arc::new(RecordingStopHook::new());
        let group = ReceiverGroup::build(builder(hook.clone(), 3), 3).unwrap();
        group.receivers()[1].stop(StopCause::requested("early"));

        assert_eq!(group.stop_all("shutdown"), 2);
        assert!(group.all_stopped());
        assert_eq!(hook.stop_count(), 3);
        assert_eq!(group.stop_all("again"), 0);
    }
}
