//! tributary-connect - Durable pull-subscription receiver for Google Cloud Pub/Sub
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  ready   ┌──────────────────────┐  deliver  ┌──────────┐
//! │ Provisioner  │─────────▶│ Fetch-Acknowledge    │──────────▶│   Sink   │
//! │ (create/     │          │ Loop (pull, ack)     │◀── ack ───│          │
//! │  probe)      │          └──────────────────────┘           └──────────┘
//! └──────┬───────┘                     │
//!        └──────── failure ──▶ stop(cause) ◀── supervisor
//! ```
//!
//! The provisioner makes sure the subscription exists (creating it on the
//! configured topic when needed) before the loop fetches anything. Both share
//! one lifecycle; every failure ends in a single `stop(cause)` that notifies
//! the [`lifecycle::StopHook`].
//!
//! # Library usage
//!
//! ```rust,ignore
//! use tributary_connect::pubsub::{InMemoryClientFactory, PubSubReceiver, ReceiverSettings};
//! use tributary_connect::sink::{OutputFormat, StdoutSink};
//!
//! let config = ReceiverConfig::from_file("tributary.yaml")?;
//! let receiver = PubSubReceiver::builder(ReceiverSettings::from_config(&config)?)
//!     .client_factory(Arc::new(factory))
//!     .sink(Arc::new(StdoutSink::new(OutputFormat::Json)))
//!     .build()?;
//! let handle = receiver.start();
//! // ...
//! receiver.stop(StopCause::requested("shutdown"));
//! ```
//!
//! # CLI usage
//!
//! ```bash
//! # Run receivers (simulation mode without the `pubsub` feature)
//! tributary -c tributary.yaml
//!
//! # Validate configuration
//! tributary -c tributary.yaml validate
//!
//! # Print the configuration JSON schema
//! tributary schema
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod pubsub;
pub mod retry;
pub mod scheduler;
pub mod sink;
pub mod testing;
pub mod types;

pub use config::{AckMode, ReceiverConfig};
pub use error::{ApiError, ConnectorError, ConnectorResult, StatusCode};
pub use lifecycle::{LifecycleState, StopCause, StopHook};
pub use pubsub::{PubSubReceiver, ReceiverGroup, ReceiverSettings};
pub use retry::BackoffPolicy;
pub use sink::MessageSink;
