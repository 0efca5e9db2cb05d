//! tributary - Pub/Sub pull-subscription receiver
//!
//! Ensures the configured subscription exists, then streams its messages to
//! stdout until interrupted.
//!
//! ```bash
//! # Run receivers (default command)
//! tributary -c tributary.yaml
//!
//! # Text output instead of JSON lines
//! tributary -c tributary.yaml run --format text
//!
//! # Validate configuration
//! tributary -c tributary.yaml validate
//!
//! # Print the configuration JSON schema
//! tributary schema --format yaml
//! ```
//!
//! Built without the `pubsub` feature, `run` uses an in-memory backend fed
//! with generated sample messages.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tributary_connect::config::{AckMode, ReceiverConfig};
use tributary_connect::pubsub::{
    BucketCounter, ClientFactory, PubSubReceiver, ReceiverGroup, ReceiverSettings,
};
use tributary_connect::sink::{OutputFormat, StdoutSink};

#[derive(Parser)]
#[command(name = "tributary")]
#[command(version, about = "Durable pull-subscription receiver for Google Cloud Pub/Sub")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tributary.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the subscription and stream messages (default)
    Run {
        /// Output format for received messages
        #[arg(long, value_enum, default_value = "json")]
        format: Format,
    },
    /// Validate configuration file
    Validate,
    /// Show the configuration schema
    Schema {
        /// Output format (json, yaml)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Text,
}

impl From<Format> for OutputFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => OutputFormat::Json,
            Format::Text => OutputFormat::Text,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    // Commands that don't need config
    if let Some(Commands::Schema { format }) = &cli.command {
        return show_schema(format);
    }

    let config = ReceiverConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command {
        None => run(config, OutputFormat::Json).await,
        Some(Commands::Run { format }) => run(config, format.into()).await,
        Some(Commands::Validate) => validate_config(config),
        Some(Commands::Schema { .. }) => Ok(()),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn run(config: ReceiverConfig, format: OutputFormat) -> Result<()> {
    let settings = ReceiverSettings::from_config(&config).context("Invalid receiver settings")?;
    info!(
        subscription = %settings.target.subscription_path(),
        receivers = config.receivers,
        "Starting tributary"
    );
    if settings.ack_mode == AckMode::Manual {
        warn!("ack_mode is manual but the stdout sink never acknowledges; messages will be redelivered");
    }

    let factory = client_factory(&config, &settings).await?;
    // one counter for the whole process
    let buckets = BucketCounter::new();
    let builder = PubSubReceiver::builder(settings)
        .client_factory(factory)
        .sink(Arc::new(StdoutSink::new(format)))
        .bucket_counter(buckets, config.receivers);
    let group = Arc::new(ReceiverGroup::build(builder, config.receivers)?);

    let mut runner = {
        let group = group.clone();
        tokio::spawn(async move { group.run().await })
    };

    let causes = tokio::select! {
        result = &mut runner => result.context("receiver group panicked")?,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutdown requested");
            group.stop_all("ctrl-c");
            runner.await.context("receiver group panicked")?
        }
    };

    for (snapshot, receiver) in group.metrics().iter().zip(group.receivers()) {
        info!(
            receiver = %receiver.name(),
            metrics = %serde_json::to_string(snapshot)?,
            "Final metrics"
        );
    }

    let failures: Vec<String> = causes
        .iter()
        .flatten()
        .filter(|cause| cause.is_failure())
        .map(|cause| cause.to_string())
        .collect();
    if !failures.is_empty() {
        anyhow::bail!("{} receiver(s) failed: {}", failures.len(), failures.join("; "));
    }
    Ok(())
}

#[cfg(feature = "pubsub")]
async fn client_factory(
    config: &ReceiverConfig,
    _settings: &ReceiverSettings,
) -> Result<Arc<dyn ClientFactory>> {
    use tributary_connect::pubsub::gcloud::{GcloudClientFactory, GcloudSettings};

    let settings = GcloudSettings::from_config(config)?;
    Ok(Arc::new(GcloudClientFactory::new(settings)))
}

#[cfg(not(feature = "pubsub"))]
async fn client_factory(
    _config: &ReceiverConfig,
    settings: &ReceiverSettings,
) -> Result<Arc<dyn ClientFactory>> {
    use tributary_connect::pubsub::{InMemoryClientFactory, InMemoryPubSub, SubscriberClient};

    warn!("Built without the `pubsub` feature; running in simulation mode");

    let backend = InMemoryPubSub::new();
    let target = &settings.target;
    let topic = target
        .topic
        .clone()
        .unwrap_or_else(|| "simulated".to_string());
    backend.create_topic(&target.project_id, &topic);
    if target.topic.is_none() {
        // no topic to create it on, so the subscription has to exist up front
        backend
            .create_subscription(&target.clone().with_topic(topic.clone()))
            .await?;
    }

    tokio::spawn(simulation::generate(
        backend.clone(),
        target.project_id.clone(),
        topic,
    ));
    Ok(Arc::new(InMemoryClientFactory::new(backend)))
}

#[cfg(not(feature = "pubsub"))]
mod simulation {
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use tracing::warn;
    use tributary_connect::pubsub::InMemoryPubSub;

    const INTERVAL: Duration = Duration::from_secs(1);

    /// Publish one sample message per interval until publishing fails
    pub async fn generate(backend: InMemoryPubSub, project: String, topic: String) {
        let mut interval = tokio::time::interval(INTERVAL);
        for sequence in 0u64.. {
            interval.tick().await;
            let payload = json!({
                "sequence": sequence,
                "generated_at": Utc::now().to_rfc3339(),
            })
            .to_string();
            let attributes = HashMap::from([("source".to_string(), "simulator".to_string())]);
            if let Err(e) = backend.publish(&project, &topic, payload, attributes) {
                warn!("Simulation generator stopped: {}", e);
                return;
            }
        }
    }
}

fn validate_config(config: ReceiverConfig) -> Result<()> {
    let settings = ReceiverSettings::from_config(&config).context("Invalid receiver settings")?;
    let target = &settings.target;
    let backoff = &settings.backoff;

    println!("✓ Configuration valid!\n");

    println!("Subscription:");
    println!("  Path: {}", target.subscription_path());
    match target.topic_path() {
        Some(topic) => println!("  Topic: {} (created if missing)", topic),
        None => println!("  Topic: none (subscription must exist)"),
    }
    println!("  Ack deadline: {}s", target.ack_deadline.as_secs());
    println!();

    println!("Receivers:");
    println!("  Count: {}", config.receivers);
    println!("  Ack mode: {:?}", settings.ack_mode);
    println!("  Max messages per pull: {}", settings.max_messages);
    println!("  Empty poll delay: {}ms", settings.empty_poll_delay.as_millis());
    println!();

    println!("Backoff:");
    println!("  Initial: {}ms", backoff.initial_delay.as_millis());
    println!("  Factor: {}", backoff.factor);
    println!("  Maximum: {}ms", backoff.max_delay.as_millis());
    println!("  Max attempts: {}", backoff.max_attempts);
    println!(
        "  Worst-case wait per operation: {}ms",
        backoff.total_delay().as_millis()
    );
    println!();

    println!("Topic not found:");
    println!("  Probe attempts: {}", settings.probe_attempts);
    println!(
        "  After successful probe: {}",
        if settings.fail_after_probe {
            "stop (legacy)"
        } else {
            "continue"
        }
    );
    println!();

    println!("Auth:");
    if let Some(file) = config.auth.service_account_file() {
        println!("  Credentials file: {}", file);
    } else if config.auth.credentials_json.is_some() {
        println!("  Credentials JSON: [REDACTED]");
    } else if config.auth.use_adc {
        println!("  Application Default Credentials");
    } else {
        println!("  none");
    }
    if let Some(endpoint) = &config.endpoint_url {
        println!("  Endpoint override: {}", endpoint);
    }

    Ok(())
}

fn show_schema(format: &str) -> Result<()> {
    let schema = schemars::schema_for!(ReceiverConfig);
    let schema = serde_json::to_value(&schema)?;

    match format {
        "yaml" => println!("{}", serde_yaml::to_string(&schema)?),
        _ => println!("{}", serde_json::to_string_pretty(&schema)?),
    }

    Ok(())
}
