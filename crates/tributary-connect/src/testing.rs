//! Testing utilities for receivers
//!
//! Substitutable collaborators for unit and integration tests:
//! - [`ScriptedClient`]: replays scripted backend results and counts calls
//! - [`ScriptedFactory`] / [`FailingFactory`]: client construction
//! - [`RecordingScheduler`]: records backoff delays without waiting
//! - [`RecordingStopHook`]: records stop causes
//! - [`CollectingSink`]: collects delivered messages
//!
//! # Example
//!
//! ```rust,ignore
//! let client = Arc::new(ScriptedClient::new());
//! client.push_create(Err(ApiError::unavailable("down")));
//! let receiver = PubSubReceiver::builder(settings)
//!     .client_factory(Arc::new(ScriptedFactory::new(client.clone())))
//!     .scheduler(Arc::new(RecordingScheduler::new()))
//!     .sink(Arc::new(CollectingSink::new()))
//!     .build()?;
//! ```

use crate::error::{ApiError, ConnectorError, ConnectorResult};
use crate::lifecycle::{StopCause, StopHook};
use crate::pubsub::{
    ClientFactory, InFlightMessage, PulledMessage, ReceiptHandle, SubscriberClient,
    SubscriptionTarget,
};
use crate::scheduler::Scheduler;
use crate::sink::MessageSink;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Build a pulled message with a receipt handle of `ack-{id}`
pub fn pulled(id: &str, payload: &str) -> PulledMessage {
    PulledMessage {
        message_id: id.to_string(),
        payload: Bytes::from(payload.to_string()),
        attributes: HashMap::new(),
        publish_time: None,
        delivery_attempt: Some(1),
        receipt_handle: ReceiptHandle::new(format!("ack-{}", id)),
    }
}

/// Backend client that replays scripted results.
///
/// Once a script runs out: creation succeeds, the subscription exists,
/// acknowledgment succeeds, and `pull` never completes (so a streaming
/// receiver idles until it is stopped).
#[derive(Default)]
pub struct ScriptedClient {
    creates: Mutex<VecDeque<Result<(), ApiError>>>,
    exists: Mutex<VecDeque<Result<bool, ApiError>>>,
    pulls: Mutex<VecDeque<Result<Vec<PulledMessage>, ApiError>>>,
    acks: Mutex<VecDeque<Result<(), ApiError>>>,
    create_targets: Mutex<Vec<SubscriptionTarget>>,
    acked: Mutex<Vec<ReceiptHandle>>,
    create_calls: AtomicUsize,
    exists_calls: AtomicUsize,
    pull_calls: AtomicUsize,
    ack_calls: AtomicUsize,
    close_calls: AtomicUsize,
    pulled: Notify,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_create(&self, result: Result<(), ApiError>) -> &Self {
        self.creates.lock().push_back(result);
        self
    }

    /// Script `count` identical create failures
    pub fn push_create_errors(&self, count: usize, error: ApiError) -> &Self {
        let mut creates = self.creates.lock();
        for _ in 0..count {
            creates.push_back(Err(error.clone()));
        }
        self
    }

    pub fn push_exists(&self, result: Result<bool, ApiError>) -> &Self {
        self.exists.lock().push_back(result);
        self
    }

    pub fn push_pull(&self, result: Result<Vec<PulledMessage>, ApiError>) -> &Self {
        self.pulls.lock().push_back(result);
        self
    }

    pub fn push_ack(&self, result: Result<(), ApiError>) -> &Self {
        self.acks.lock().push_back(result);
        self
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn exists_calls(&self) -> usize {
        self.exists_calls.load(Ordering::SeqCst)
    }

    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    pub fn ack_calls(&self) -> usize {
        self.ack_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Backend calls of any kind
    pub fn network_calls(&self) -> usize {
        self.create_calls() + self.exists_calls() + self.pull_calls() + self.ack_calls()
    }

    /// Targets passed to `create_subscription`, in call order
    pub fn create_targets(&self) -> Vec<SubscriptionTarget> {
        self.create_targets.lock().clone()
    }

    /// Receipt handles acknowledged successfully, in call order
    pub fn acked(&self) -> Vec<ReceiptHandle> {
        self.acked.lock().clone()
    }

    /// Wait until at least `count` pulls were issued
    pub async fn wait_for_pulls(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.pulled.notified();
                if self.pull_calls() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl SubscriberClient for ScriptedClient {
    async fn create_subscription(&self, target: &SubscriptionTarget) -> Result<(), ApiError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.create_targets.lock().push(target.clone());
        let next = self.creates.lock().pop_front();
        next.unwrap_or(Ok(()))
    }

    async fn subscription_exists(&self, _subscription: &str) -> Result<bool, ApiError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.exists.lock().pop_front();
        next.unwrap_or(Ok(true))
    }

    async fn pull(
        &self,
        _subscription: &str,
        _max_messages: u32,
    ) -> Result<Vec<PulledMessage>, ApiError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        self.pulled.notify_waiters();
        let next = self.pulls.lock().pop_front();
        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn acknowledge(
        &self,
        _subscription: &str,
        handles: &[ReceiptHandle],
    ) -> Result<(), ApiError> {
        self.ack_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.acks.lock().pop_front().unwrap_or(Ok(()));
        if next.is_ok() {
            self.acked.lock().extend_from_slice(handles);
        }
        next
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory handing out one shared [`ScriptedClient`]
pub struct ScriptedFactory {
    client: Arc<ScriptedClient>,
    creates: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new(client: Arc<ScriptedClient>) -> Self {
        Self {
            client,
            creates: AtomicUsize::new(0),
        }
    }

    /// Clients handed out so far
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for ScriptedFactory {
    async fn create(&self) -> ConnectorResult<Arc<dyn SubscriberClient>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(self.client.clone())
    }
}

/// Factory whose client construction always fails
pub struct FailingFactory {
    message: String,
}

impl FailingFactory {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl ClientFactory for FailingFactory {
    async fn create(&self) -> ConnectorResult<Arc<dyn SubscriberClient>> {
        Err(ConnectorError::Auth(self.message.clone()))
    }
}

/// Scheduler that records each requested delay and returns immediately
#[derive(Default)]
pub struct RecordingScheduler {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    async fn delay(&self, duration: Duration) {
        self.delays.lock().push(duration);
        tokio::task::yield_now().await;
    }
}

/// Stop hook that records every invocation
#[derive(Default)]
pub struct RecordingStopHook {
    stops: Mutex<Vec<(String, StopCause)>>,
}

impl RecordingStopHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.lock().len()
    }

    pub fn causes(&self) -> Vec<StopCause> {
        self.stops.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn receivers(&self) -> Vec<String> {
        self.stops.lock().iter().map(|(r, _)| r.clone()).collect()
    }
}

impl StopHook for RecordingStopHook {
    fn on_stop(&self, receiver: &str, cause: &StopCause) {
        self.stops.lock().push((receiver.to_string(), cause.clone()));
    }
}

/// Sink that keeps every delivered message
#[derive(Default)]
pub struct CollectingSink {
    messages: Mutex<Vec<InFlightMessage>>,
    failures: Mutex<VecDeque<ConnectorError>>,
    delivered: Notify,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next delivery with `error` instead of accepting it
    pub fn fail_next(&self, error: ConnectorError) -> &Self {
        self.failures.lock().push_back(error);
        self
    }

    pub fn messages(&self) -> Vec<InFlightMessage> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` messages were accepted
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.delivered.notified();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl MessageSink for CollectingSink {
    async fn deliver(&self, message: &InFlightMessage) -> ConnectorResult<()> {
        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        self.messages.lock().push(message.clone());
        self.delivered.notify_waiters();
        Ok(())
    }
}
