//! Receiver configuration
//!
//! Loaded from YAML with `${VAR}` / `${VAR:-default}` expansion, then checked
//! with `validator`. The JSON schema (via `schemars`) is what
//! `tributary schema` prints.
//!
//! ```yaml
//! project_id: my-gcp-project
//! subscription: orders-ingest
//! topic: orders
//! receivers: 2
//! ack_mode: auto
//! backoff:
//!   initial_backoff_ms: 100
//!   backoff_factor: 2.0
//!   maximum_backoff_ms: 10000
//!   max_attempts: 5
//! auth:
//!   credentials_file: ${GOOGLE_APPLICATION_CREDENTIALS}
//! ```

use crate::error::{ConnectorError, ConnectorResult};
use crate::retry::BackoffPolicy;
use crate::types::SensitiveString;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Resource names accepted by the subscription service
static RESOURCE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9\-.~+%_]{2,254}$")
        .expect("resource name regex pattern is invalid - this is a bug")
});

/// Placeholder that asks for the project or credentials to be taken from the environment
pub const AUTO_DETECT: &str = "auto-detect";

/// Environment variables consulted, in order, to resolve the project id
pub const PROJECT_ENV_VARS: [&str; 2] = ["GOOGLE_CLOUD_PROJECT", "GCLOUD_PROJECT"];

fn validate_resource_name(value: &str) -> Result<(), ValidationError> {
    if !RESOURCE_NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_resource_name").with_message(
            format!(
                "'{}' must start with a letter and contain 3-255 of [A-Za-z0-9-.~+%_]",
                value
            )
            .into(),
        ));
    }
    if value.starts_with("goog") {
        return Err(ValidationError::new("reserved_prefix")
            .with_message(format!("'{}' must not start with 'goog'", value).into()));
    }
    Ok(())
}

/// How delivered messages get acknowledged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Acknowledge right after the sink accepted the message
    #[default]
    Auto,
    /// The sink acknowledges through an [`crate::pubsub::Acknowledger`]
    Manual,
}

/// Google Cloud authentication configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct GcpAuthConfig {
    /// Path to service account JSON key file (`auto-detect` uses ADC)
    pub credentials_file: Option<String>,

    /// Service account JSON key content
    pub credentials_json: Option<SensitiveString>,

    /// Use Application Default Credentials (ADC)
    #[serde(default = "default_true")]
    pub use_adc: bool,
}

impl Default for GcpAuthConfig {
    fn default() -> Self {
        Self {
            credentials_file: None,
            credentials_json: None,
            use_adc: true,
        }
    }
}

impl GcpAuthConfig {
    /// Key file to load, if any. Empty and `auto-detect` mean ambient
    /// credentials.
    pub fn service_account_file(&self) -> Option<&str> {
        self.credentials_file
            .as_deref()
            .filter(|path| !path.is_empty() && *path != AUTO_DETECT)
    }

    /// Check if explicit credentials are provided
    pub fn has_explicit_credentials(&self) -> bool {
        self.service_account_file().is_some() || self.credentials_json.is_some()
    }
}

/// Backoff applied to failing subscription-management and fetch calls
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    #[validate(range(min = 1, max = 60000))]
    pub initial_backoff_ms: u64,

    /// Multiplier applied to the delay after each retry
    #[serde(default = "default_backoff_factor")]
    #[validate(range(min = 1.0, max = 10.0))]
    pub backoff_factor: f64,

    /// Upper bound for a single delay in milliseconds
    #[serde(default = "default_maximum_backoff_ms")]
    #[validate(range(min = 1, max = 600000))]
    pub maximum_backoff_ms: u64,

    /// Attempts per operation, the first one included
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            maximum_backoff_ms: default_maximum_backoff_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new()
            .with_initial_delay(Duration::from_millis(self.initial_backoff_ms))
            .with_factor(self.backoff_factor)
            .with_max_delay(Duration::from_millis(self.maximum_backoff_ms))
            .with_max_attempts(self.max_attempts)
    }
}

/// Behaviour when the topic backing a new subscription does not exist
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
pub struct TopicNotFoundConfig {
    /// Fetch probes against the subscription before giving up
    #[serde(default = "default_probe_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub probe_attempts: u32,

    /// Stop the receiver after probing even if a probe succeeded.
    ///
    /// Legacy compatibility switch; the default lets a successful probe
    /// continue into streaming.
    #[serde(default)]
    pub fail_after_probe: bool,
}

impl Default for TopicNotFoundConfig {
    fn default() -> Self {
        Self {
            probe_attempts: default_probe_attempts(),
            fail_after_probe: false,
        }
    }
}

/// Pub/Sub receiver configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
pub struct ReceiverConfig {
    /// Google Cloud project ID, or `auto-detect`
    #[serde(default = "default_project_id")]
    pub project_id: String,

    /// Subscription name (not full path)
    #[validate(custom(function = "validate_resource_name"))]
    pub subscription: String,

    /// Topic to create the subscription on when it does not exist yet
    #[validate(custom(function = "validate_resource_name"))]
    pub topic: Option<String>,

    /// Parallel receiver instances
    #[serde(default = "default_receivers")]
    #[validate(range(min = 1, max = 64))]
    pub receivers: u32,

    /// Acknowledgment mode
    #[serde(default)]
    pub ack_mode: AckMode,

    /// Maximum number of messages per pull request
    #[serde(default = "default_max_messages")]
    #[validate(range(min = 1, max = 1000))]
    pub max_messages: u32,

    /// Pause after a pull that returned nothing, in milliseconds
    #[serde(default = "default_empty_poll_delay_ms")]
    #[validate(range(max = 60000))]
    pub empty_poll_delay_ms: u64,

    /// Retry/backoff policy
    #[serde(default)]
    #[validate(nested)]
    pub backoff: BackoffConfig,

    /// Missing-topic probing
    #[serde(default)]
    #[validate(nested)]
    pub topic_not_found: TopicNotFoundConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: GcpAuthConfig,

    /// Endpoint URL override (for emulator)
    pub endpoint_url: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_project_id() -> String {
    AUTO_DETECT.to_string()
}

fn default_receivers() -> u32 {
    1
}

fn default_max_messages() -> u32 {
    100
}

fn default_empty_poll_delay_ms() -> u64 {
    100
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_maximum_backoff_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_probe_attempts() -> u32 {
    5
}

impl ReceiverConfig {
    /// Minimal configuration for `subscription`, everything else defaulted
    pub fn new(project_id: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            subscription: subscription.into(),
            topic: None,
            receivers: default_receivers(),
            ack_mode: AckMode::default(),
            max_messages: default_max_messages(),
            empty_poll_delay_ms: default_empty_poll_delay_ms(),
            backoff: BackoffConfig::default(),
            topic_not_found: TopicNotFoundConfig::default(),
            auth: GcpAuthConfig::default(),
            endpoint_url: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> ConnectorResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConnectorError::config(format!(
                "failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse, expand and validate a YAML document
    pub fn from_yaml_str(content: &str) -> ConnectorResult<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.check()?;
        Ok(config)
    }

    /// Field validation plus cross-field constraints
    pub fn check(&self) -> ConnectorResult<()> {
        self.validate()
            .map_err(|e| ConnectorError::config(e.to_string()))?;
        if self.backoff.maximum_backoff_ms < self.backoff.initial_backoff_ms {
            return Err(ConnectorError::config(format!(
                "backoff.maximum_backoff_ms ({}) is below backoff.initial_backoff_ms ({})",
                self.backoff.maximum_backoff_ms, self.backoff.initial_backoff_ms
            )));
        }
        Ok(())
    }

    /// Project id with `auto-detect` resolved from the environment
    pub fn resolve_project_id(&self) -> ConnectorResult<String> {
        resolve_project_id_with(&self.project_id, |name| std::env::var(name).ok())
    }

    pub fn empty_poll_delay(&self) -> Duration {
        Duration::from_millis(self.empty_poll_delay_ms)
    }
}

/// Resolve `configured` against `lookup`, which reads an environment variable.
pub fn resolve_project_id_with(
    configured: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> ConnectorResult<String> {
    let configured = configured.trim();
    if !configured.is_empty() && configured != AUTO_DETECT {
        return Ok(configured.to_string());
    }
    PROJECT_ENV_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .ok_or_else(|| {
            ConnectorError::config(format!(
                "project_id is '{}' and none of {} is set",
                AUTO_DETECT,
                PROJECT_ENV_VARS.join(", ")
            ))
        })
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
pub fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = ReceiverConfig::from_yaml_str("subscription: orders-ingest\n").unwrap();
        assert_eq!(config.project_id, AUTO_DETECT);
        assert_eq!(config.receivers, 1);
        assert_eq!(config.ack_mode, AckMode::Auto);
        assert_eq!(config.max_messages, 100);
        assert_eq!(config.backoff.max_attempts, 5);
        assert_eq!(config.topic_not_found.probe_attempts, 5);
        assert!(!config.topic_not_found.fail_after_probe);
        assert!(config.auth.use_adc);
        assert!(config.topic.is_none());
    }

    #[test]
    fn test_backoff_policy_from_config() {
        let policy = BackoffConfig::default().policy();
        assert_eq!(policy, BackoffPolicy::default());
    }

    #[test]
    fn test_subscription_name_rules() {
        assert!(validate_resource_name("orders-ingest").is_ok());
        assert!(validate_resource_name("a.b~c+d%e_f").is_ok());
        assert!(validate_resource_name("ab").is_err());
        assert!(validate_resource_name("1orders").is_err());
        assert!(validate_resource_name("orders/ingest").is_err());
        assert!(validate_resource_name("google-sub").is_err());
        assert!(validate_resource_name(&"a".repeat(256)).is_err());
        assert!(validate_resource_name(&"a".repeat(255)).is_ok());
    }

    #[test]
    fn test_reserved_prefix_rejected() {
        let err = ReceiverConfig::from_yaml_str("subscription: goog-metrics\n").unwrap_err();
        assert!(matches!(err, ConnectorError::Config(_)));
    }

    #[test]
    fn test_invalid_topic_rejected() {
        let config = ReceiverConfig::new("p", "orders-ingest").with_topic("x");
        assert!(config.check().is_err());
    }

    #[test]
    fn test_range_validation() {
        let yaml = "subscription: orders-ingest\nreceivers: 0\n";
        assert!(ReceiverConfig::from_yaml_str(yaml).is_err());

        let yaml = "subscription: orders-ingest\nbackoff:\n  backoff_factor: 0.5\n";
        assert!(ReceiverConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_backoff_bounds_cross_check() {
        let yaml = "subscription: orders-ingest\nbackoff:\n  initial_backoff_ms: 500\n  maximum_backoff_ms: 100\n";
        let err = ReceiverConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("maximum_backoff_ms"));
    }

    #[test]
    fn test_ack_mode_parsing() {
        let yaml = "subscription: orders-ingest\nack_mode: manual\n";
        let config = ReceiverConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.ack_mode, AckMode::Manual);

        let yaml = "subscription: orders-ingest\nack_mode: sometimes\n";
        assert!(matches!(
            ReceiverConfig::from_yaml_str(yaml),
            Err(ConnectorError::Yaml(_))
        ));
    }

    #[test]
    fn test_expand_env_vars_default() {
        let expanded = expand_env_vars("project_id: ${TRIBUTARY_TEST_UNSET_VAR:-fallback}");
        assert_eq!(expanded, "project_id: fallback");
        let expanded = expand_env_vars("x: ${TRIBUTARY_TEST_UNSET_VAR}");
        assert_eq!(expanded, "x: ");
    }

    #[test]
    fn test_resolve_project_id_explicit() {
        let resolved = resolve_project_id_with("my-project", |_| None).unwrap();
        assert_eq!(resolved, "my-project");
    }

    #[test]
    fn test_resolve_project_id_env_order() {
        let lookup = |name: &str| match name {
            "GOOGLE_CLOUD_PROJECT" => Some("primary".to_string()),
            "GCLOUD_PROJECT" => Some("secondary".to_string()),
            _ => None,
        };
        assert_eq!(
            resolve_project_id_with(AUTO_DETECT, lookup).unwrap(),
            "primary"
        );

        let lookup = |name: &str| (name == "GCLOUD_PROJECT").then(|| "secondary".to_string());
        assert_eq!(resolve_project_id_with("", lookup).unwrap(), "secondary");
    }

    #[test]
    fn test_resolve_project_id_missing() {
        let err = resolve_project_id_with(AUTO_DETECT, |_| None).unwrap_err();
        assert!(matches!(err, ConnectorError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "project_id: my-project\nsubscription: orders-ingest\ntopic: orders\nreceivers: 3\nauth:\n  credentials_json: secret-key\n"
        )
        .unwrap();

        let config = ReceiverConfig::from_file(file.path()).unwrap();
        assert_eq!(config.topic.as_deref(), Some("orders"));
        assert_eq!(config.receivers, 3);
        assert!(config.auth.has_explicit_credentials());

        let rendered = serde_yaml::to_string(&config).unwrap();
        assert!(!rendered.contains("secret-key"));
    }

    #[test]
    fn test_auto_detect_credentials_file_means_ambient() {
        let yaml = "subscription: orders-ingest\nauth:\n  credentials_file: auto-detect\n";
        let config = ReceiverConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.auth.service_account_file(), None);
        assert!(!config.auth.has_explicit_credentials());

        let auth = GcpAuthConfig {
            credentials_file: Some("/etc/keys/sa.json".to_string()),
            ..Default::default()
        };
        assert_eq!(auth.service_account_file(), Some("/etc/keys/sa.json"));
    }

    #[test]
    fn test_from_missing_file() {
        let err = ReceiverConfig::from_file("/nonexistent/tributary.yaml").unwrap_err();
        assert!(matches!(err, ConnectorError::Config(_)));
    }

    #[test]
    fn test_schema_generation() {
        let schema = schemars::schema_for!(ReceiverConfig);
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("subscription"));
        assert!(json.contains("ack_mode"));
    }
}
