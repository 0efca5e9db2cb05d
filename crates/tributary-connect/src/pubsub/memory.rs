//! In-memory Pub/Sub backend
//!
//! Behaves like the service as far as the receiver can tell: subscriptions
//! need an existing topic, re-creating one answers `ALREADY_EXISTS`, pulls
//! wait a bounded time for messages, and deliveries that are not
//! acknowledged within the ack deadline are handed out again.
//!
//! Used by the binary's simulation mode and by tests.

use super::client::{ClientFactory, PulledMessage, ReceiptHandle, SubscriberClient};
use super::{topic_path, SubscriptionTarget};
use crate::error::{ApiError, ConnectorError, ConnectorResult, StatusCode};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Default time a pull waits for messages before returning an empty batch
pub const DEFAULT_PULL_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    payload: Bytes,
    attributes: HashMap<String, String>,
    publish_time: DateTime<Utc>,
    delivery_attempt: i32,
}

#[derive(Debug)]
struct Outstanding {
    message: StoredMessage,
    deadline: Instant,
}

#[derive(Debug)]
struct SubscriptionState {
    topic: String,
    ack_deadline: Duration,
    backlog: VecDeque<StoredMessage>,
    outstanding: HashMap<String, Outstanding>,
}

impl SubscriptionState {
    /// Move deliveries whose deadline passed back to the front of the backlog
    fn expire(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .outstanding
            .iter()
            .filter(|(_, o)| o.deadline <= now)
            .map(|(ack_id, _)| ack_id.clone())
            .collect();
        for ack_id in expired {
            if let Some(outstanding) = self.outstanding.remove(&ack_id) {
                self.backlog.push_front(outstanding.message);
            }
        }
    }
}

#[derive(Debug, Default)]
struct State {
    topics: HashSet<String>,
    subscriptions: HashMap<String, SubscriptionState>,
    next_message_id: u64,
    next_ack_id: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    published: Notify,
    pull_wait: Duration,
}

/// Process-local stand-in for the subscription service
#[derive(Debug, Clone)]
pub struct InMemoryPubSub {
    shared: Arc<Shared>,
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self::with_pull_wait(DEFAULT_PULL_WAIT)
    }

    /// Backend whose empty pulls return after `pull_wait`
    pub fn with_pull_wait(pull_wait: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                published: Notify::new(),
                pull_wait,
            }),
        }
    }

    /// Create a topic. Returns `false` if it already existed.
    pub fn create_topic(&self, project: &str, topic: &str) -> bool {
        self.shared
            .state
            .lock()
            .topics
            .insert(topic_path(project, topic))
    }

    pub fn topic_exists(&self, project: &str, topic: &str) -> bool {
        self.shared
            .state
            .lock()
            .topics
            .contains(&topic_path(project, topic))
    }

    /// Publish to every subscription of the topic. Returns the message id.
    pub fn publish(
        &self,
        project: &str,
        topic: &str,
        payload: impl Into<Bytes>,
        attributes: HashMap<String, String>,
    ) -> ConnectorResult<String> {
        let topic = topic_path(project, topic);
        let id = {
            let mut state = self.shared.state.lock();
            if !state.topics.contains(&topic) {
                return Err(ApiError::not_found(format!(
                    "Resource not found (resource={})",
                    topic
                ))
                .into());
            }
            state.next_message_id += 1;
            let message = StoredMessage {
                id: state.next_message_id.to_string(),
                payload: payload.into(),
                attributes,
                publish_time: Utc::now(),
                delivery_attempt: 0,
            };
            for subscription in state.subscriptions.values_mut() {
                if subscription.topic == topic {
                    subscription.backlog.push_back(message.clone());
                }
            }
            message.id
        };
        self.shared.published.notify_waiters();
        Ok(id)
    }

    /// Messages waiting to be pulled
    pub fn backlog(&self, subscription: &str) -> usize {
        self.shared
            .state
            .lock()
            .subscriptions
            .get(subscription)
            .map_or(0, |s| s.backlog.len())
    }

    /// Messages pulled but not yet acknowledged
    pub fn outstanding(&self, subscription: &str) -> usize {
        self.shared
            .state
            .lock()
            .subscriptions
            .get(subscription)
            .map_or(0, |s| s.outstanding.len())
    }

    fn try_pull(
        &self,
        subscription: &str,
        max_messages: u32,
    ) -> Result<Vec<PulledMessage>, ApiError> {
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        let sub = state.subscriptions.get_mut(subscription).ok_or_else(|| {
            ApiError::not_found(format!("Resource not found (resource={})", subscription))
        })?;

        let now = Instant::now();
        sub.expire(now);

        let take = sub.backlog.len().min(max_messages as usize);
        let mut batch = Vec::with_capacity(take);
        for mut message in sub.backlog.drain(..take) {
            message.delivery_attempt += 1;
            state.next_ack_id += 1;
            let ack_id = format!("{}:{}", message.id, state.next_ack_id);

            batch.push(PulledMessage {
                message_id: message.id.clone(),
                payload: message.payload.clone(),
                attributes: message.attributes.clone(),
                publish_time: Some(message.publish_time),
                delivery_attempt: Some(message.delivery_attempt),
                receipt_handle: ReceiptHandle::new(ack_id.clone()),
            });
            sub.outstanding.insert(
                ack_id,
                Outstanding {
                    message,
                    deadline: now + sub.ack_deadline,
                },
            );
        }
        Ok(batch)
    }
}

#[async_trait]
impl SubscriberClient for InMemoryPubSub {
    async fn create_subscription(&self, target: &SubscriptionTarget) -> Result<(), ApiError> {
        let topic = target.topic_path().ok_or_else(|| {
            ApiError::new(StatusCode::InvalidArgument, "topic is required")
        })?;
        let path = target.subscription_path();

        let mut state = self.shared.state.lock();
        if state.subscriptions.contains_key(&path) {
            return Err(ApiError::already_exists(format!(
                "Resource already exists in the project (resource={})",
                target.subscription
            )));
        }
        if !state.topics.contains(&topic) {
            return Err(ApiError::not_found(format!(
                "Resource not found (resource={})",
                target.topic.as_deref().unwrap_or_default()
            )));
        }
        state.subscriptions.insert(
            path.clone(),
            SubscriptionState {
                topic,
                ack_deadline: target.ack_deadline,
                backlog: VecDeque::new(),
                outstanding: HashMap::new(),
            },
        );
        debug!(subscription = %path, "Created in-memory subscription");
        Ok(())
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, ApiError> {
        Ok(self.shared.state.lock().subscriptions.contains_key(subscription))
    }

    async fn pull(
        &self,
        subscription: &str,
        max_messages: u32,
    ) -> Result<Vec<PulledMessage>, ApiError> {
        let deadline = Instant::now() + self.shared.pull_wait;
        loop {
            // register before checking so a publish in between is not missed
            let published = self.shared.published.notified();
            let batch = self.try_pull(subscription, max_messages)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, published).await.is_err() {
                return Ok(batch);
            }
        }
    }

    async fn acknowledge(
        &self,
        subscription: &str,
        handles: &[ReceiptHandle],
    ) -> Result<(), ApiError> {
        let mut state = self.shared.state.lock();
        let sub = state.subscriptions.get_mut(subscription).ok_or_else(|| {
            ApiError::not_found(format!("Resource not found (resource={})", subscription))
        })?;
        for handle in handles {
            sub.outstanding.remove(handle.as_str());
        }
        Ok(())
    }
}

/// Hands every receiver a client on the same in-memory backend
#[derive(Debug, Clone, Default)]
pub struct InMemoryClientFactory {
    backend: InMemoryPubSub,
}

impl InMemoryClientFactory {
    pub fn new(backend: InMemoryPubSub) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &InMemoryPubSub {
        &self.backend
    }
}

#[async_trait]
impl ClientFactory for InMemoryClientFactory {
    async fn create(&self) -> Result<Arc<dyn SubscriberClient>, ConnectorError> {
        Ok(Arc::new(self.backend.clone()))
    }
}
