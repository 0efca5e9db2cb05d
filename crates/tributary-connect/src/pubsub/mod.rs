//! Durable pull-subscription receiver
//!
//! A [`PubSubReceiver`] first makes sure its subscription exists (creating it
//! on the configured topic when needed), then pulls batches, hands each
//! message to a [`crate::sink::MessageSink`] and acknowledges it. Every
//! failure path ends in a single `stop`.
//!
//! | Backend | Module | Notes |
//! |---------|--------|-------|
//! | Google Cloud | `gcloud` | requires the `pubsub` feature |
//! | In-memory | [`memory`] | simulation mode and tests |

pub mod classify;
pub mod client;
mod fetch_loop;
#[cfg(feature = "pubsub")]
pub mod gcloud;
pub mod group;
pub mod memory;
mod provisioner;
pub mod receiver;

pub use classify::{classify, ErrorClass};
pub use client::{
    Acknowledger, ClientFactory, InFlightMessage, PulledMessage, ReceiptHandle, SubscriberClient,
};
pub use group::ReceiverGroup;
pub use memory::{InMemoryClientFactory, InMemoryPubSub};
pub use provisioner::Provisioning;
pub use receiver::{BucketCounter, PubSubReceiver, ReceiverBuilder, ReceiverSettings};

use std::time::Duration;

/// Acknowledgment deadline of subscriptions created by the receiver
pub const ACK_DEADLINE: Duration = Duration::from_secs(10);

/// Fully qualified subscription path
pub fn subscription_path(project: &str, subscription: &str) -> String {
    format!("projects/{}/subscriptions/{}", project, subscription)
}

/// Fully qualified topic path
pub fn topic_path(project: &str, topic: &str) -> String {
    format!("projects/{}/topics/{}", project, topic)
}

/// The subscription a receiver brings into existence and pulls from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTarget {
    pub project_id: String,
    /// Topic to create the subscription on; `None` only checks existence
    pub topic: Option<String>,
    pub subscription: String,
    /// Always [`ACK_DEADLINE`]; pull-only, no push endpoint
    pub ack_deadline: Duration,
}

impl SubscriptionTarget {
    pub fn new(project_id: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            topic: None,
            subscription: subscription.into(),
            ack_deadline: ACK_DEADLINE,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn subscription_path(&self) -> String {
        subscription_path(&self.project_id, &self.subscription)
    }

    pub fn topic_path(&self) -> Option<String> {
        self.topic
            .as_deref()
            .map(|topic| topic_path(&self.project_id, topic))
    }
}
