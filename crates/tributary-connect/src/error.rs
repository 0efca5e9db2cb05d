//! Error types for tributary-connect
//!
//! Two layers:
//! - [`ApiError`] is what a Pub/Sub backend returns: a canonical status code,
//!   a message, and the backend's own verdict on whether the call may be retried.
//! - [`ConnectorError`] is the crate-wide error that every failure path funnels
//!   into before it reaches the receiver's stop path.

use std::fmt;
use thiserror::Error;

/// Result type alias for connector operations
pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Canonical status codes reported by the subscription service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StatusCode {
    /// Whether the service usually clears this condition on its own.
    ///
    /// Used as the default for [`ApiError::is_retryable`]; a backend adapter
    /// may override it per error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable
                | Self::DeadlineExceeded
                | Self::Aborted
                | Self::ResourceExhausted
                | Self::Internal
                | Self::Unknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a subscription backend call
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    code: StatusCode,
    message: String,
    retryable: bool,
}

impl ApiError {
    /// Create an error whose retryability follows the status code
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.is_transient(),
        }
    }

    /// Override the backend's retry verdict
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(StatusCode::AlreadyExists, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Errors that can occur in connector operations
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Configuration validation failed
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection to the service could not be established
    #[error("connection error: {0}")]
    Connection(String),

    /// Credentials could not be loaded or were rejected
    #[error("authentication error: {0}")]
    Auth(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend call failed
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Downstream sink rejected a message
    #[error("sink error: {message}")]
    Sink { message: String, retryable: bool },

    /// Transient error that may succeed on retry
    #[error("transient error (retryable): {0}")]
    Transient(String),

    /// Fatal error that will not succeed on retry
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Operation abandoned because the receiver is stopping
    #[error("receiver is shutting down")]
    Shutdown,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConnectorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Transient(_) => true,
            Self::Api(e) => e.is_retryable(),
            Self::Sink { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Check if this is the shutdown marker
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// The backend status code, if this error came from a backend call
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Api(e) => Some(e.code()),
            _ => None,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a fatal error
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Sink failure after which the message may be redelivered
    pub fn sink_retryable(msg: impl Into<String>) -> Self {
        Self::Sink {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Sink failure that should stop the receiver
    pub fn sink_fatal(msg: impl Into<String>) -> Self {
        Self::Sink {
            message: msg.into(),
            retryable: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_default_retryability() {
        assert!(ApiError::new(StatusCode::Unavailable, "down").is_retryable());
        assert!(ApiError::new(StatusCode::Aborted, "contention").is_retryable());
        assert!(!ApiError::new(StatusCode::NotFound, "gone").is_retryable());
        assert!(!ApiError::new(StatusCode::PermissionDenied, "no").is_retryable());
    }

    #[test]
    fn test_retryable_override() {
        let err = ApiError::new(StatusCode::Aborted, "aborted").with_retryable(false);
        assert!(!err.is_retryable());
        assert_eq!(err.code(), StatusCode::Aborted);
    }

    #[test]
    fn test_api_error_display() {
        let err = ApiError::not_found("projects/p/topics/t");
        assert_eq!(err.to_string(), "NOT_FOUND: projects/p/topics/t");
    }

    #[test]
    fn test_connector_error_retryable() {
        assert!(ConnectorError::connection("reset").is_retryable());
        assert!(ConnectorError::Transient("blip".to_string()).is_retryable());
        assert!(ConnectorError::from(ApiError::unavailable("x")).is_retryable());
        assert!(ConnectorError::sink_retryable("busy").is_retryable());
        assert!(!ConnectorError::sink_fatal("closed").is_retryable());
        assert!(!ConnectorError::config("bad").is_retryable());
        assert!(!ConnectorError::Shutdown.is_retryable());
    }

    #[test]
    fn test_status_code_passthrough() {
        let err: ConnectorError = ApiError::already_exists("sub").into();
        assert_eq!(err.status_code(), Some(StatusCode::AlreadyExists));
        assert_eq!(ConnectorError::Shutdown.status_code(), None);
    }
}
