//! Closed classification of backend errors
//!
//! Provisioning and fetching branch on the class, never on the raw status
//! code, so the retry logic stays independent of the backend library.

use crate::error::{ApiError, ConnectorError, StatusCode};

/// What the receiver does about a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The resource already exists; counts as success
    Idempotent,
    /// The referenced resource is missing; re-probe before giving up
    RecoverableProbe,
    /// Back off and retry the same call
    RecoverableRetry,
    /// Stop the receiver
    Fatal,
}

/// Classify a backend error.
///
/// `ALREADY_EXISTS` is checked first, then `NOT_FOUND`, then the backend's
/// retryable flag; everything else is fatal.
pub fn classify(error: &ApiError) -> ErrorClass {
    match error.code() {
        StatusCode::AlreadyExists => ErrorClass::Idempotent,
        StatusCode::NotFound => ErrorClass::RecoverableProbe,
        _ if error.is_retryable() => ErrorClass::RecoverableRetry,
        _ => ErrorClass::Fatal,
    }
}

/// Classify a connector error; only backend errors can be anything but
/// retry-or-fatal.
pub fn classify_connector(error: &ConnectorError) -> ErrorClass {
    match error {
        ConnectorError::Api(e) => classify(e),
        e if e.is_retryable() => ErrorClass::RecoverableRetry,
        _ => ErrorClass::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_exists_short_circuits_retryable() {
        let err = ApiError::already_exists("sub").with_retryable(true);
        assert_eq!(classify(&err), ErrorClass::Idempotent);
    }

    #[test]
    fn test_not_found_is_probe() {
        assert_eq!(
            classify(&ApiError::not_found("topic")),
            ErrorClass::RecoverableProbe
        );
    }

    #[test]
    fn test_retryable_flag_decides() {
        let aborted = ApiError::new(StatusCode::Aborted, "contention");
        assert_eq!(classify(&aborted), ErrorClass::RecoverableRetry);
        assert_eq!(
            classify(&aborted.with_retryable(false)),
            ErrorClass::Fatal
        );
        let denied = ApiError::new(StatusCode::PermissionDenied, "no").with_retryable(true);
        assert_eq!(classify(&denied), ErrorClass::RecoverableRetry);
    }

    #[test]
    fn test_other_codes_fatal() {
        let err = ApiError::new(StatusCode::InvalidArgument, "bad name");
        assert_eq!(classify(&err), ErrorClass::Fatal);
    }

    #[test]
    fn test_classify_connector() {
        let err = ConnectorError::from(ApiError::not_found("x"));
        assert_eq!(classify_connector(&err), ErrorClass::RecoverableProbe);
        assert_eq!(
            classify_connector(&ConnectorError::connection("reset")),
            ErrorClass::RecoverableRetry
        );
        assert_eq!(
            classify_connector(&ConnectorError::config("bad")),
            ErrorClass::Fatal
        );
    }
}
