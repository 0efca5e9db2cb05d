//! Downstream delivery
//!
//! The receiver hands every fetched message to a [`MessageSink`]. Returning
//! `Ok` means the sink owns the message, which in `auto` ack mode triggers the
//! acknowledgment. A retryable error leaves the message unacknowledged so the
//! service redelivers it; any other error stops the receiver.

use crate::error::{ConnectorError, ConnectorResult};
use crate::pubsub::InFlightMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Write;
use tokio::sync::mpsc;

/// Destination for fetched messages
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, message: &InFlightMessage) -> ConnectorResult<()>;
}

/// Output format for [`StdoutSink`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Compact JSON (one line per message)
    #[default]
    Json,
    /// Simple text format
    Text,
}

/// Writes each message to stdout (or any writer) for debugging
pub struct StdoutSink {
    format: OutputFormat,
    writer: Mutex<Box<dyn Write + Send>>,
}

impl StdoutSink {
    pub fn new(format: OutputFormat) -> Self {
        Self::with_writer(format, Box::new(std::io::stdout()))
    }

    pub fn with_writer(format: OutputFormat, writer: Box<dyn Write + Send>) -> Self {
        Self {
            format,
            writer: Mutex::new(writer),
        }
    }

    /// Render one message as a single output line
    pub fn render(&self, message: &InFlightMessage) -> String {
        let payload = String::from_utf8_lossy(&message.payload);
        match self.format {
            OutputFormat::Json => json!({
                "message_id": message.message_id,
                "bucket": message.bucket,
                "publish_time": message.publish_time.map(|t| t.to_rfc3339()),
                "delivery_attempt": message.delivery_attempt,
                "attributes": message.attributes,
                "payload": payload,
            })
            .to_string(),
            OutputFormat::Text => {
                format!("[{}] {} {}", message.bucket, message.message_id, payload)
            }
        }
    }
}

#[async_trait]
impl MessageSink for StdoutSink {
    async fn deliver(&self, message: &InFlightMessage) -> ConnectorResult<()> {
        let line = self.render(message);
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }
}

/// Forwards messages to a bounded channel
///
/// Backpressure from a slow consumer holds up the fetch loop. A closed
/// channel is fatal.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<InFlightMessage>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::Sender<InFlightMessage>) -> Self {
        Self { sender }
    }

    /// Sink plus the receiving end of a channel with `capacity` slots
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<InFlightMessage>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(sender), receiver)
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn deliver(&self, message: &InFlightMessage) -> ConnectorResult<()> {
        self.sender
            .send(message.clone())
            .await
            .map_err(|_| ConnectorError::sink_fatal("message channel closed"))
    }
}
