use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A type-erased error raised by the transport underneath a [`ListWatch`](crate::ListWatch)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by a [`ListWatch`](crate::ListWatch) backend
#[derive(Error, Debug)]
pub enum Error {
    /// The remote store answered with an error status
    #[error("ApiError: {0} ({0:?})")]
    Api(#[source] ErrorResponse),

    /// The request could not be delivered or the response could not be read
    #[error("ServiceError: {0}")]
    Service(#[source] BoxError),
}

impl Error {
    /// The error status returned by the remote store, if any
    #[must_use]
    pub fn api_response(&self) -> Option<&ErrorResponse> {
        match self {
            Error::Api(resp) => Some(resp),
            Error::Service(_) => None,
        }
    }

    /// Whether the remote store rejected the request because the resource version has expired
    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.api_response().is_some_and(ErrorResponse::is_gone)
    }
}

impl From<ErrorResponse> for Error {
    fn from(resp: ErrorResponse) -> Self {
        Error::Api(resp)
    }
}

/// An error response from the API.
#[derive(Error, Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
#[error("{message}: {reason}")]
pub struct ErrorResponse {
    /// The status
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

impl ErrorResponse {
    /// Builds a `Failure` status with the given code and reason
    #[must_use]
    pub fn failure(code: u16, reason: &str, message: impl Into<String>) -> Self {
        Self {
            status: "Failure".into(),
            message: message.into(),
            reason: reason.into(),
            code,
        }
    }

    /// The status sent when a requested resource version is older than the retained history
    #[must_use]
    pub fn gone(message: impl Into<String>) -> Self {
        Self::failure(410, "Expired", message)
    }

    /// HTTP 410: the resource version is too old, a fresh list is required
    #[must_use]
    pub fn is_gone(&self) -> bool {
        self.code == 410
    }

    /// HTTP 401 or 403: retrying with the same credentials is not expected to succeed
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        self.code == 401 || self.code == 403
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GONE: &str = r#"
    {
      "kind": "Status",
      "apiVersion": "v1",
      "metadata": {},
      "status": "Failure",
      "message": "too old resource version: 1 (2847)",
      "reason": "Expired",
      "code": 410
    }
    "#;

    const FORBIDDEN: &str = r#"
    {
      "kind": "Status",
      "apiVersion": "v1",
      "metadata": {},
      "status": "Failure",
      "message": "configmaps is forbidden: User \"system:anonymous\" cannot list resource \"configmaps\" in API group \"\" in the namespace \"default\"",
      "reason": "Forbidden",
      "details": {
        "kind": "configmaps"
      },
      "code": 403
    }
    "#;

    fn error_response(text: &str) -> serde_json::Result<ErrorResponse> {
        serde_json::from_str(text)
    }

    #[test]
    fn expired_status_is_gone() {
        let status = error_response(GONE).unwrap();
        assert!(status.is_gone());
        assert!(!status.is_auth_failure());
        assert_eq!(status, ErrorResponse::gone("too old resource version: 1 (2847)"));
        assert!(Error::from(status).is_gone());
    }

    #[test]
    fn forbidden_status_is_auth_failure() {
        let status = error_response(FORBIDDEN).unwrap();
        assert_eq!(status.code, 403);
        assert!(status.is_auth_failure());
        assert!(!Error::Api(status).is_gone());
    }

    #[test]
    fn service_errors_carry_no_status() {
        let err = Error::Service("connection reset by peer".into());
        assert!(err.api_response().is_none());
        assert!(!err.is_gone());
        assert_eq!(err.to_string(), "ServiceError: connection reset by peer");
    }
}
