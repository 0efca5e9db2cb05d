//! Google Cloud Pub/Sub backend over the `gcloud-pubsub` SDK
//!
//! Client construction checks, in order: `PUBSUB_EMULATOR_HOST` or an
//! explicit `endpoint_url`, a credentials file, inline credentials JSON,
//! then Application Default Credentials.
//!
//! Every call is made exactly once. The SDK's own retry layer is disabled so
//! the receiver's [`BackoffPolicy`](crate::retry::BackoffPolicy) is the only
//! retry schedule in play.

use super::client::{ClientFactory, PulledMessage, ReceiptHandle, SubscriberClient};
use super::SubscriptionTarget;
use crate::config::{GcpAuthConfig, ReceiverConfig};
use crate::error::{ApiError, ConnectorError, ConnectorResult, StatusCode};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use gcloud_gax::conn::Environment;
use gcloud_gax::grpc::{Code, Status};
use gcloud_gax::retry::RetrySetting;
use gcloud_googleapis::pubsub::v1::AcknowledgeRequest;
use gcloud_pubsub::apiv1::conn_pool::ConnectionManager;
use gcloud_pubsub::apiv1::subscriber_client::SubscriberClient as ApiSubscriberClient;
use gcloud_pubsub::client::google_cloud_auth::credentials::CredentialsFile;
use gcloud_pubsub::client::{Client, ClientConfig};
use gcloud_pubsub::subscriber::ReceivedMessage;
use gcloud_pubsub::subscription::SubscriptionConfig;
use std::sync::Arc;
use tracing::info;

fn map_code(code: Code) -> StatusCode {
    match code {
        Code::Cancelled => StatusCode::Cancelled,
        Code::InvalidArgument => StatusCode::InvalidArgument,
        Code::DeadlineExceeded => StatusCode::DeadlineExceeded,
        Code::NotFound => StatusCode::NotFound,
        Code::AlreadyExists => StatusCode::AlreadyExists,
        Code::PermissionDenied => StatusCode::PermissionDenied,
        Code::ResourceExhausted => StatusCode::ResourceExhausted,
        Code::FailedPrecondition => StatusCode::FailedPrecondition,
        Code::Aborted => StatusCode::Aborted,
        Code::OutOfRange => StatusCode::OutOfRange,
        Code::Unimplemented => StatusCode::Unimplemented,
        Code::Internal => StatusCode::Internal,
        Code::Unavailable => StatusCode::Unavailable,
        Code::DataLoss => StatusCode::DataLoss,
        Code::Unauthenticated => StatusCode::Unauthenticated,
        _ => StatusCode::Unknown,
    }
}

/// Single attempt, no retryable codes
fn no_retry() -> RetrySetting {
    RetrySetting {
        take: 0,
        codes: Vec::new(),
        ..Default::default()
    }
}

fn api_error(status: Status) -> ApiError {
    ApiError::new(map_code(status.code()), status.message().to_string())
}

fn to_pulled(received: ReceivedMessage) -> PulledMessage {
    let message = &received.message;
    PulledMessage {
        message_id: message.message_id.clone(),
        payload: Bytes::from(message.data.clone()),
        attributes: message.attributes.clone(),
        // clamp negative nanos to 0 to prevent u32 wrap
        publish_time: message
            .publish_time
            .as_ref()
            .and_then(|ts| DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)),
        delivery_attempt: received
            .delivery_attempt()
            .and_then(|d| i32::try_from(d).ok()),
        receipt_handle: ReceiptHandle::new(received.ack_id()),
    }
}

/// Connection settings for [`GcloudClientFactory`]
#[derive(Debug, Clone)]
pub struct GcloudSettings {
    pub project_id: String,
    pub auth: GcpAuthConfig,
    pub endpoint_url: Option<String>,
}

impl GcloudSettings {
    pub fn from_config(config: &ReceiverConfig) -> ConnectorResult<Self> {
        Ok(Self {
            project_id: config.resolve_project_id()?,
            auth: config.auth.clone(),
            endpoint_url: config.endpoint_url.clone(),
        })
    }
}

/// Builds one SDK client per receiver
#[derive(Debug, Clone)]
pub struct GcloudClientFactory {
    settings: GcloudSettings,
}

impl GcloudClientFactory {
    pub fn new(settings: GcloudSettings) -> Self {
        Self { settings }
    }

    async fn build_config(&self) -> ConnectorResult<ClientConfig> {
        let settings = &self.settings;
        let mut client_config = ClientConfig {
            project_id: Some(settings.project_id.clone()),
            ..Default::default()
        };

        if let Some(endpoint) = &settings.endpoint_url {
            let host = endpoint.trim_start_matches("http://").trim_end_matches('/');
            client_config.environment = Environment::Emulator(host.to_string());
            info!(endpoint = %host, "Using Pub/Sub emulator");
        } else if let Ok(host) = std::env::var("PUBSUB_EMULATOR_HOST") {
            info!(endpoint = %host, "Using Pub/Sub emulator");
        } else if let Some(creds_file) = settings.auth.service_account_file() {
            let creds = CredentialsFile::new_from_file(creds_file.to_string())
                .await
                .map_err(|e| ConnectorError::Auth(format!("Failed to load credentials: {}", e)))?;
            client_config = client_config
                .with_credentials(creds)
                .await
                .map_err(|e| ConnectorError::Auth(format!("Failed to configure auth: {}", e)))?;
        } else if let Some(ref creds_json) = settings.auth.credentials_json {
            let creds = CredentialsFile::new_from_str(creds_json.expose_secret())
                .await
                .map_err(|e| ConnectorError::Auth(format!("Failed to parse credentials: {}", e)))?;
            client_config = client_config
                .with_credentials(creds)
                .await
                .map_err(|e| ConnectorError::Auth(format!("Failed to configure auth: {}", e)))?;
        } else if settings.auth.use_adc {
            client_config = client_config
                .with_auth()
                .await
                .map_err(|e| ConnectorError::Auth(format!("Failed to get ADC: {}", e)))?;
        } else {
            return Err(ConnectorError::Auth(
                "no credentials configured and use_adc is disabled".to_string(),
            ));
        }

        Ok(client_config)
    }
}

/// Low-level subscriber client for acknowledgements; the high-level ack
/// helpers always apply the SDK's default retries.
async fn ack_client(config: &ClientConfig) -> ConnectorResult<ApiSubscriberClient> {
    let connect = || {
        ConnectionManager::new(
            1,
            config.endpoint.as_str(),
            &config.environment,
            &config.connection_option,
        )
    };
    let unary = connect()
        .await
        .map_err(|e| ConnectorError::Connection(format!("Failed to connect: {}", e)))?;
    let streaming = connect()
        .await
        .map_err(|e| ConnectorError::Connection(format!("Failed to connect: {}", e)))?;
    Ok(ApiSubscriberClient::new(unary, streaming))
}

#[async_trait]
impl ClientFactory for GcloudClientFactory {
    async fn create(&self) -> ConnectorResult<Arc<dyn SubscriberClient>> {
        let client_config = self.build_config().await?;
        let acks = ack_client(&client_config).await?;
        let client = Client::new(client_config)
            .await
            .map_err(|e| ConnectorError::Connection(format!("Failed to create client: {}", e)))?;
        Ok(Arc::new(GcloudSubscriber { client, acks }))
    }
}

/// [`SubscriberClient`] over one SDK client
pub struct GcloudSubscriber {
    client: Client,
    acks: ApiSubscriberClient,
}

#[async_trait]
impl SubscriberClient for GcloudSubscriber {
    async fn create_subscription(&self, target: &SubscriptionTarget) -> Result<(), ApiError> {
        let topic = target.topic_path().ok_or_else(|| {
            ApiError::new(StatusCode::InvalidArgument, "topic is required")
        })?;
        let config = SubscriptionConfig {
            ack_deadline_seconds: target.ack_deadline.as_secs() as i32,
            ..Default::default()
        };
        self.client
            .create_subscription(&target.subscription_path(), &topic, config, Some(no_retry()))
            .await
            .map(|_| ())
            .map_err(api_error)
    }

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, ApiError> {
        self.client
            .subscription(subscription)
            .exists(Some(no_retry()))
            .await
            .map_err(api_error)
    }

    async fn pull(
        &self,
        subscription: &str,
        max_messages: u32,
    ) -> Result<Vec<PulledMessage>, ApiError> {
        let received = self
            .client
            .subscription(subscription)
            .pull(max_messages as i32, Some(no_retry()))
            .await
            .map_err(api_error)?;
        Ok(received.into_iter().map(to_pulled).collect())
    }

    async fn acknowledge(
        &self,
        subscription: &str,
        handles: &[ReceiptHandle],
    ) -> Result<(), ApiError> {
        if handles.is_empty() {
            return Ok(());
        }
        let request = AcknowledgeRequest {
            subscription: subscription.to_string(),
            ack_ids: handles.iter().map(|h| h.as_str().to_string()).collect(),
        };
        self.acks
            .acknowledge(request, Some(no_retry()))
            .await
            .map(|_| ())
            .map_err(api_error)
    }
}
