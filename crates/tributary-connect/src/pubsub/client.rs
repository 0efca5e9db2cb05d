//! Backend abstraction for the subscription service
//!
//! The receiver never talks to a wire protocol directly. It holds an
//! `Arc<dyn SubscriberClient>` obtained from a [`ClientFactory`], which lets
//! the Google Cloud SDK, the in-memory backend and test fakes plug in alike.

use super::SubscriptionTarget;
use crate::error::{ApiError, ConnectorResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Opaque token used to acknowledge one delivery of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as returned by one pull
#[derive(Debug, Clone)]
pub struct PulledMessage {
    pub message_id: String,
    pub payload: Bytes,
    pub attributes: HashMap<String, String>,
    pub publish_time: Option<DateTime<Utc>>,
    pub delivery_attempt: Option<i32>,
    pub receipt_handle: ReceiptHandle,
}

/// A message owned by the receiver between fetch and acknowledgment
#[derive(Debug, Clone)]
pub struct InFlightMessage {
    pub message_id: String,
    pub payload: Bytes,
    pub attributes: HashMap<String, String>,
    pub publish_time: Option<DateTime<Utc>>,
    pub delivery_attempt: Option<i32>,
    pub receipt_handle: ReceiptHandle,
    /// Partition label of the receiver that fetched the message
    pub bucket: u32,
}

impl InFlightMessage {
    pub fn new(pulled: PulledMessage, bucket: u32) -> Self {
        Self {
            message_id: pulled.message_id,
            payload: pulled.payload,
            attributes: pulled.attributes,
            publish_time: pulled.publish_time,
            delivery_attempt: pulled.delivery_attempt,
            receipt_handle: pulled.receipt_handle,
            bucket,
        }
    }
}

/// Subscription-management and pull/acknowledge calls
#[async_trait]
pub trait SubscriberClient: Send + Sync {
    /// Create a pull subscription on `target.topic`.
    ///
    /// Returns `ALREADY_EXISTS` when the subscription is present and
    /// `NOT_FOUND` when the topic is missing.
    async fn create_subscription(&self, target: &SubscriptionTarget) -> Result<(), ApiError>;

    /// Whether the subscription exists
    async fn subscription_exists(&self, subscription: &str) -> Result<bool, ApiError>;

    /// Fetch up to `max_messages`.
    ///
    /// May wait a bounded amount of time for messages; an empty batch is a
    /// normal result.
    async fn pull(
        &self,
        subscription: &str,
        max_messages: u32,
    ) -> Result<Vec<PulledMessage>, ApiError>;

    /// Acknowledge deliveries by receipt handle
    async fn acknowledge(
        &self,
        subscription: &str,
        handles: &[ReceiptHandle],
    ) -> Result<(), ApiError>;

    /// Release transport resources. Calls still in flight may complete.
    fn close(&self) {}
}

/// Builds one client per receiver instance
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self) -> ConnectorResult<Arc<dyn SubscriberClient>>;
}

/// Acknowledges deliveries on behalf of a sink running in manual mode
#[derive(Clone)]
pub struct Acknowledger {
    client: Arc<dyn SubscriberClient>,
    subscription: String,
}

impl Acknowledger {
    pub(crate) fn new(client: Arc<dyn SubscriberClient>, subscription: String) -> Self {
        Self {
            client,
            subscription,
        }
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub async fn ack(&self, handles: &[ReceiptHandle]) -> Result<(), ApiError> {
        if handles.is_empty() {
            return Ok(());
        }
        self.client.acknowledge(&self.subscription, handles).await
    }
}

impl fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledger")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}
