//! Receiver handle, settings and construction
//!
//! A [`PubSubReceiver`] is a cheap-to-clone handle. Provisioning lives in
//! `provisioner.rs`, streaming in `fetch_loop.rs`; both drive the shared
//! [`Lifecycle`] and funnel every failure into [`PubSubReceiver::stop`].

use super::client::{Acknowledger, ClientFactory, SubscriberClient};
use super::provisioner::Provisioning;
use super::SubscriptionTarget;
use crate::config::{AckMode, ReceiverConfig};
use crate::error::{ConnectorError, ConnectorResult};
use crate::lifecycle::{Lifecycle, LifecycleState, LoggingStopHook, StopCause, StopHook};
use crate::metrics::{ReceiverMetrics, ReceiverMetricsSnapshot};
use crate::retry::BackoffPolicy;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::sink::MessageSink;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Immutable runtime view of a receiver's configuration
#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    pub target: SubscriptionTarget,
    pub backoff: BackoffPolicy,
    pub ack_mode: AckMode,
    pub max_messages: u32,
    pub empty_poll_delay: Duration,
    /// Fetch probes after the topic was reported missing
    pub probe_attempts: u32,
    /// Stop after probing even when a probe succeeded
    pub fail_after_probe: bool,
}

impl ReceiverSettings {
    pub fn new(target: SubscriptionTarget) -> Self {
        Self {
            target,
            backoff: BackoffPolicy::default(),
            ack_mode: AckMode::Auto,
            max_messages: 100,
            empty_poll_delay: Duration::from_millis(100),
            probe_attempts: 5,
            fail_after_probe: false,
        }
    }

    /// Build settings from a validated configuration, resolving the project id
    pub fn from_config(config: &ReceiverConfig) -> ConnectorResult<Self> {
        let project_id = config.resolve_project_id()?;
        let mut target = SubscriptionTarget::new(project_id, config.subscription.clone());
        target.topic = config.topic.clone();

        Ok(Self {
            target,
            backoff: config.backoff.policy(),
            ack_mode: config.ack_mode,
            max_messages: config.max_messages,
            empty_poll_delay: config.empty_poll_delay(),
            probe_attempts: config.topic_not_found.probe_attempts.max(1),
            fail_after_probe: config.topic_not_found.fail_after_probe,
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    pub fn with_max_messages(mut self, max_messages: u32) -> Self {
        self.max_messages = max_messages.max(1);
        self
    }

    pub fn with_empty_poll_delay(mut self, delay: Duration) -> Self {
        self.empty_poll_delay = delay;
        self
    }

    pub fn with_probe_attempts(mut self, attempts: u32) -> Self {
        self.probe_attempts = attempts.max(1);
        self
    }

    pub fn with_fail_after_probe(mut self, fail_after_probe: bool) -> Self {
        self.fail_after_probe = fail_after_probe;
        self
    }
}

/// Round-robin source of partition labels shared by parallel receivers
#[derive(Debug, Clone, Default)]
pub struct BucketCounter(Arc<AtomicU32>);

impl BucketCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next label in `0..buckets`
    pub fn assign(&self, buckets: u32) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed) % buckets.max(1)
    }
}

pub(super) struct ReceiverInner {
    pub(super) name: String,
    pub(super) settings: Arc<ReceiverSettings>,
    pub(super) bucket: u32,
    pub(super) lifecycle: Lifecycle,
    pub(super) factory: Arc<dyn ClientFactory>,
    pub(super) client: Mutex<Option<Arc<dyn SubscriberClient>>>,
    pub(super) scheduler: Arc<dyn Scheduler>,
    pub(super) stop_hook: Arc<dyn StopHook>,
    pub(super) sink: Arc<dyn MessageSink>,
    pub(super) metrics: ReceiverMetrics,
}

/// One durable pull-subscription receiver
#[derive(Clone)]
pub struct PubSubReceiver {
    pub(super) inner: Arc<ReceiverInner>,
}

impl std::fmt::Debug for PubSubReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubReceiver")
            .field("name", &self.inner.name)
            .field("subscription", &self.inner.settings.target.subscription)
            .field("bucket", &self.inner.bucket)
            .field("state", &self.inner.lifecycle.state())
            .finish()
    }
}

impl PubSubReceiver {
    pub fn builder(settings: ReceiverSettings) -> ReceiverBuilder {
        ReceiverBuilder::new(settings)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Partition label assigned at construction
    pub fn bucket(&self) -> u32 {
        self.inner.bucket
    }

    pub fn settings(&self) -> &ReceiverSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lifecycle.state()
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.inner.lifecycle.is_stopped()
    }

    /// Cause recorded by the first stop
    pub fn stop_cause(&self) -> Option<StopCause> {
        self.inner.lifecycle.cause()
    }

    pub fn metrics(&self) -> ReceiverMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Acknowledgment handle for sinks in manual mode.
    ///
    /// `None` until the client exists and again after stop.
    pub fn acknowledger(&self) -> Option<Acknowledger> {
        let client = self.inner.client.lock().clone()?;
        Some(Acknowledger::new(
            client,
            self.inner.settings.target.subscription_path(),
        ))
    }

    /// Provision, then stream until stopped. Returns the stop cause.
    pub async fn run(&self) -> Option<StopCause> {
        if self.ensure_subscription().await == Provisioning::Ready {
            self.stream().await;
        }
        self.stop_cause()
    }

    /// Spawn [`PubSubReceiver::run`] on the current runtime
    pub fn start(&self) -> JoinHandle<Option<StopCause>> {
        let receiver = self.clone();
        tokio::spawn(async move { receiver.run().await })
    }

    /// Stop the receiver.
    ///
    /// Only the first call has an effect: it records `cause`, wakes pending
    /// pulls and backoff waits, closes the client and notifies the stop
    /// hook. Returns `false` for every later call.
    pub fn stop(&self, cause: StopCause) -> bool {
        let inner = &self.inner;
        if !inner.lifecycle.stop(cause.clone()) {
            debug!(receiver = %inner.name, "Receiver already stopped");
            return false;
        }

        match &cause {
            StopCause::Failed(e) => {
                ReceiverMetrics::incr(&inner.metrics.errors);
                error!(receiver = %inner.name, error = %e, "Stopping receiver after failure");
            }
            StopCause::Requested(reason) => {
                info!(receiver = %inner.name, reason = %reason, "Stopping receiver");
            }
        }

        let client = inner.client.lock().take();
        if let Some(client) = client {
            client.close();
        }

        let snapshot = inner.metrics.snapshot();
        info!(
            receiver = %inner.name,
            pulls = snapshot.pulls,
            messages_received = snapshot.messages_received,
            messages_delivered = snapshot.messages_delivered,
            messages_acked = snapshot.messages_acked,
            retries = snapshot.retries,
            "Receiver stopped"
        );

        inner.stop_hook.on_stop(&inner.name, &cause);
        true
    }

    /// Client for this receiver, created through the factory on first use
    pub(super) async fn client(&self) -> ConnectorResult<Arc<dyn SubscriberClient>> {
        let existing = self.inner.client.lock().clone();
        if let Some(client) = existing {
            return Ok(client);
        }

        let client = self.inner.factory.create().await?;

        let mut slot = self.inner.client.lock();
        if self.inner.lifecycle.is_stopped() {
            drop(slot);
            client.close();
            return Err(ConnectorError::Shutdown);
        }
        Ok(slot.get_or_insert(client).clone())
    }

    /// Wait for `delay` unless stopped first. Returns whether still running.
    pub(super) async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.inner.scheduler.delay(delay) => {}
            _ = self.inner.lifecycle.cancelled() => {}
        }
        !self.inner.lifecycle.is_stopped()
    }
}

/// Builder for [`PubSubReceiver`]
#[derive(Clone)]
pub struct ReceiverBuilder {
    settings: Arc<ReceiverSettings>,
    name: Option<String>,
    factory: Option<Arc<dyn ClientFactory>>,
    sink: Option<Arc<dyn MessageSink>>,
    scheduler: Arc<dyn Scheduler>,
    stop_hook: Arc<dyn StopHook>,
    buckets: Option<(BucketCounter, u32)>,
}

impl ReceiverBuilder {
    pub fn new(settings: ReceiverSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            name: None,
            factory: None,
            sink: None,
            scheduler: Arc::new(TokioScheduler),
            stop_hook: Arc::new(LoggingStopHook),
            buckets: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn client_factory(mut self, factory: Arc<dyn ClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn stop_hook(mut self, stop_hook: Arc<dyn StopHook>) -> Self {
        self.stop_hook = stop_hook;
        self
    }

    /// Take the partition label from `counter`, modulo `buckets`
    pub fn bucket_counter(mut self, counter: BucketCounter, buckets: u32) -> Self {
        self.buckets = Some((counter, buckets));
        self
    }

    pub(super) fn has_bucket_counter(&self) -> bool {
        self.buckets.is_some()
    }

    pub fn build(self) -> ConnectorResult<PubSubReceiver> {
        let factory = self
            .factory
            .ok_or_else(|| ConnectorError::config("receiver requires a client factory"))?;
        let sink = self
            .sink
            .ok_or_else(|| ConnectorError::config("receiver requires a message sink"))?;

        let bucket = match &self.buckets {
            Some((counter, buckets)) => counter.assign(*buckets),
            None => 0,
        };
        let name = self
            .name
            .unwrap_or_else(|| format!("{}-{}", self.settings.target.subscription, bucket));

        Ok(PubSubReceiver {
            inner: Arc::new(ReceiverInner {
                name,
                settings: self.settings,
                bucket,
                lifecycle: Lifecycle::new(),
                factory,
                client: Mutex::new(None),
                scheduler: self.scheduler,
                stop_hook: self.stop_hook,
                sink,
                metrics: ReceiverMetrics::new(),
            }),
        })
    }
}
