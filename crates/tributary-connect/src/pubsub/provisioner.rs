//! Subscription Provisioner
//!
//! Makes sure the subscription exists before any fetch. With a topic it
//! creates the subscription (treating `ALREADY_EXISTS` as success); without
//! one it only checks that the subscription is there.

use super::classify::{classify, classify_connector, ErrorClass};
use super::client::SubscriberClient;
use super::receiver::PubSubReceiver;
use crate::error::{ApiError, ConnectorError};
use crate::lifecycle::{LifecycleState, StopCause};
use crate::metrics::ReceiverMetrics;
use crate::retry::{BackoffPolicy, RetryGuard};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of [`PubSubReceiver::ensure_subscription`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioning {
    /// The subscription exists and the receiver is streaming
    Ready,
    /// The receiver is stopped; the cause went to the stop hook
    Stopped,
}

impl PubSubReceiver {
    /// Bring the subscription into existence.
    ///
    /// Never returns an error: every failure ends in a single `stop` and
    /// [`Provisioning::Stopped`].
    pub async fn ensure_subscription(&self) -> Provisioning {
        let inner = &self.inner;
        if inner.lifecycle.is_stopped() {
            debug!(receiver = %inner.name, "Receiver stopped before provisioning");
            return Provisioning::Stopped;
        }
        inner.lifecycle.advance(LifecycleState::Provisioning);

        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => {
                self.stop(StopCause::failed(e));
                return Provisioning::Stopped;
            }
        };

        let target = &inner.settings.target;
        let path = target.subscription_path();
        let mut guard = RetryGuard::new(inner.settings.backoff.clone());

        info!(
            receiver = %inner.name,
            subscription = %path,
            topic = ?target.topic_path(),
            "Provisioning subscription"
        );

        loop {
            if inner.lifecycle.is_stopped() {
                return Provisioning::Stopped;
            }

            let result = match target.topic {
                Some(_) => {
                    ReceiverMetrics::incr(&inner.metrics.create_attempts);
                    client.create_subscription(target).await.map(|()| true)
                }
                None => client.subscription_exists(&path).await,
            };

            let error = match result {
                Ok(true) => {
                    info!(receiver = %inner.name, subscription = %path, "Subscription ready");
                    return self.mark_ready();
                }
                Ok(false) => {
                    self.stop(StopCause::failed(ConnectorError::NotFound(format!(
                        "subscription {} does not exist and no topic is configured",
                        path
                    ))));
                    return Provisioning::Stopped;
                }
                Err(e) => e,
            };

            match classify(&error) {
                ErrorClass::Idempotent => {
                    info!(receiver = %inner.name, subscription = %path, "Subscription already exists");
                    return self.mark_ready();
                }
                ErrorClass::RecoverableProbe if target.topic.is_some() => {
                    return self.probe_subscription(&client, error).await;
                }
                ErrorClass::RecoverableRetry => match guard.record_failure() {
                    Some(delay) => {
                        ReceiverMetrics::incr(&inner.metrics.retries);
                        warn!(
                            receiver = %inner.name,
                            subscription = %path,
                            attempt = guard.failures(),
                            max_attempts = guard.max_attempts(),
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Provisioning failed, retrying"
                        );
                        if !self.pause(delay).await {
                            return Provisioning::Stopped;
                        }
                    }
                    None => {
                        error!(
                            receiver = %inner.name,
                            subscription = %path,
                            attempts = guard.failures(),
                            error = %error,
                            "Provisioning retries exhausted"
                        );
                        self.stop(StopCause::failed(error));
                        return Provisioning::Stopped;
                    }
                },
                ErrorClass::RecoverableProbe | ErrorClass::Fatal => {
                    self.stop(StopCause::failed(error));
                    return Provisioning::Stopped;
                }
            }
        }
    }

    /// The topic was reported missing: fetch from the subscription path
    /// until it answers or the probe bound runs out.
    async fn probe_subscription(
        &self,
        client: &Arc<dyn SubscriberClient>,
        not_found: ApiError,
    ) -> Provisioning {
        let inner = &self.inner;
        let settings = &inner.settings;
        let mut guard = RetryGuard::new(
            settings
                .backoff
                .clone()
                .with_max_attempts(settings.probe_attempts),
        );
        let single_attempt = BackoffPolicy::no_retry();

        warn!(
            receiver = %inner.name,
            error = %not_found,
            probe_attempts = settings.probe_attempts,
            "Topic not found, probing subscription"
        );

        loop {
            if inner.lifecycle.is_stopped() {
                return Provisioning::Stopped;
            }

            let error = match self.fetch_and_ack(client, &single_attempt).await {
                Ok(delivered) => {
                    if settings.fail_after_probe {
                        warn!(
                            receiver = %inner.name,
                            probes = guard.failures() + 1,
                            "Probe succeeded, stopping anyway (fail_after_probe)"
                        );
                        self.stop(StopCause::failed(not_found));
                        return Provisioning::Stopped;
                    }
                    info!(
                        receiver = %inner.name,
                        probes = guard.failures() + 1,
                        delivered = delivered as u64,
                        "Subscription answered probe"
                    );
                    return self.mark_ready();
                }
                Err(e) if e.is_shutdown() => return Provisioning::Stopped,
                Err(e) => e,
            };

            match classify_connector(&error) {
                ErrorClass::RecoverableProbe | ErrorClass::RecoverableRetry => {
                    match guard.record_failure() {
                        Some(delay) => {
                            debug!(
                                receiver = %inner.name,
                                probe = guard.failures(),
                                delay_ms = delay.as_millis() as u64,
                                error = %error,
                                "Probe failed"
                            );
                            if !self.pause(delay).await {
                                return Provisioning::Stopped;
                            }
                        }
                        None => {
                            error!(
                                receiver = %inner.name,
                                probes = guard.failures(),
                                error = %error,
                                "Subscription never became available"
                            );
                            self.stop(StopCause::failed(error));
                            return Provisioning::Stopped;
                        }
                    }
                }
                ErrorClass::Idempotent | ErrorClass::Fatal => {
                    self.stop(StopCause::failed(error));
                    return Provisioning::Stopped;
                }
            }
        }
    }

    fn mark_ready(&self) -> Provisioning {
        if self.inner.lifecycle.advance(LifecycleState::Streaming) {
            Provisioning::Ready
        } else {
            Provisioning::Stopped
        }
    }
}
