//! Fetch-Acknowledge Loop

use super::classify::{classify, ErrorClass};
use super::client::{InFlightMessage, SubscriberClient};
use super::receiver::PubSubReceiver;
use crate::config::AckMode;
use crate::error::{ApiError, ConnectorError, ConnectorResult};
use crate::lifecycle::{LifecycleState, StopCause};
use crate::metrics::ReceiverMetrics;
use crate::retry::{BackoffPolicy, RetryGuard};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

impl PubSubReceiver {
    /// Pull, deliver and acknowledge until stopped.
    ///
    /// Does nothing unless provisioning left the receiver in `Streaming`.
    pub(crate) async fn stream(&self) {
        let inner = &self.inner;
        if inner.lifecycle.state() != LifecycleState::Streaming {
            debug!(receiver = %inner.name, state = %inner.lifecycle.state(), "Not streaming");
            return;
        }

        let client = match self.client().await {
            Ok(client) => client,
            Err(e) => {
                if !e.is_shutdown() {
                    self.stop(StopCause::failed(e));
                }
                return;
            }
        };

        info!(
            receiver = %inner.name,
            subscription = %inner.settings.target.subscription_path(),
            bucket = inner.bucket,
            ack_mode = ?inner.settings.ack_mode,
            "Streaming started"
        );

        let backoff = inner.settings.backoff.clone();
        while !inner.lifecycle.is_stopped() {
            match self.fetch_and_ack(&client, &backoff).await {
                Ok(0) => {
                    if !self.pause(inner.settings.empty_poll_delay).await {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) if e.is_shutdown() => break,
                Err(e) => {
                    self.stop(StopCause::failed(e));
                    break;
                }
            }
        }

        debug!(receiver = %inner.name, "Streaming finished");
    }

    /// One pull, then hand-off and (in auto mode) acknowledgment of each
    /// message. Returns the number of messages the sink accepted.
    pub(super) async fn fetch_and_ack(
        &self,
        client: &Arc<dyn SubscriberClient>,
        backoff: &BackoffPolicy,
    ) -> ConnectorResult<usize> {
        let inner = &self.inner;
        let settings = &inner.settings;
        let client: &dyn SubscriberClient = client.as_ref();
        let path = settings.target.subscription_path();
        let path: &str = &path;
        let max_messages = settings.max_messages;

        let batch = self
            .with_retry(backoff, "pull", true, move || {
                client.pull(path, max_messages)
            })
            .await?;

        let bytes: usize = batch.iter().map(|m| m.payload.len()).sum();
        inner.metrics.record_pull(batch.len() as u64, bytes as u64);

        let mut delivered = 0;
        for pulled in batch {
            let message = InFlightMessage::new(pulled, inner.bucket);

            if let Err(e) = inner.sink.deliver(&message).await {
                ReceiverMetrics::incr(&inner.metrics.delivery_failures);
                if e.is_retryable() {
                    warn!(
                        receiver = %inner.name,
                        message_id = %message.message_id,
                        error = %e,
                        "Sink rejected message, leaving it for redelivery"
                    );
                    continue;
                }
                return Err(e);
            }
            ReceiverMetrics::incr(&inner.metrics.messages_delivered);
            delivered += 1;
            debug!(
                receiver = %inner.name,
                message_id = %message.message_id,
                bucket = message.bucket,
                "Delivered message"
            );

            if settings.ack_mode == AckMode::Auto {
                let handle = &message.receipt_handle;
                let acked = self
                    .with_retry(backoff, "acknowledge", false, move || {
                        client.acknowledge(path, std::slice::from_ref(handle))
                    })
                    .await;
                if let Err(e) = acked {
                    ReceiverMetrics::incr(&inner.metrics.ack_failures);
                    return Err(e);
                }
                ReceiverMetrics::incr(&inner.metrics.messages_acked);
            }
        }

        Ok(delivered)
    }

    /// Run one backend call, retrying it while its errors are retryable.
    ///
    /// With `interruptible` the call is abandoned as soon as the receiver
    /// stops, which is what unblocks a pending pull. Backoff waits are always
    /// cut short by stop.
    async fn with_retry<T, F, Fut>(
        &self,
        backoff: &BackoffPolicy,
        operation: &'static str,
        interruptible: bool,
        mut call: F,
    ) -> ConnectorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let inner = &self.inner;
        let mut guard = RetryGuard::new(backoff.clone());
        loop {
            let result = if interruptible {
                tokio::select! {
                    _ = inner.lifecycle.cancelled() => return Err(ConnectorError::Shutdown),
                    result = call() => result,
                }
            } else {
                call().await
            };

            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if classify(&error) != ErrorClass::RecoverableRetry {
                return Err(error.into());
            }
            match guard.record_failure() {
                Some(delay) => {
                    ReceiverMetrics::incr(&inner.metrics.retries);
                    warn!(
                        receiver = %inner.name,
                        operation,
                        attempt = guard.failures(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Backend call failed, retrying"
                    );
                    if !self.pause(delay).await {
                        return Err(ConnectorError::Shutdown);
                    }
                }
                None => return Err(error.into()),
            }
        }
    }
}
