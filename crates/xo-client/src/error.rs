//! XenOrchestra client errors

use reqwest::StatusCode;
use thiserror::Error;

/// Errors that can occur when talking to XenOrchestra
///
/// Only [`XoError::Transient`] is ever retried by the session. Everything else
/// propagates to the caller on the first occurrence.
#[derive(Debug, Clone, Error)]
pub enum XoError {
    /// The requested object does not exist (an expected absence, not a failure)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Network failure, timeout or temporary platform unavailability
    #[error("Transient error: {0}")]
    Transient(String),

    /// Credentials were rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed or incomplete configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The endpoint does not speak a supported API version
    #[error("Unsupported API: {0}")]
    Unsupported(String),

    /// Platform state disagrees with the requested change
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Quota or capability exceeded; needs a human to fix it
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    /// The platform rejected the request as malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Any other unexpected API answer
    #[error("XenOrchestra API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The session was shut down before the call could be issued
    #[error("Operation cancelled")]
    Cancelled,
}

impl XoError {
    /// Returns true for errors the session may retry internally
    pub fn is_transient(&self) -> bool {
        matches!(self, XoError::Transient(_))
    }

    /// Returns true if the error signals an absent object
    pub fn is_not_found(&self) -> bool {
        matches!(self, XoError::NotFound(_))
    }

    /// Classify a non-success HTTP answer
    pub fn from_status(status: StatusCode, context: &str, body: &str) -> Self {
        let message = if body.is_empty() {
            format!("{} - {}", context, status)
        } else {
            format!("{} - {} - {}", context, status, body)
        };

        match status.as_u16() {
            401 | 403 => XoError::Authentication(message),
            404 => XoError::NotFound(message),
            409 | 412 => XoError::Conflict(message),
            400 | 422 => XoError::InvalidRequest(message),
            402 | 413 | 507 => XoError::Provisioning(message),
            408 | 429 => XoError::Transient(message),
            s if s >= 500 => XoError::Transient(message),
            _ => XoError::Api(message),
        }
    }
}

impl From<reqwest::Error> for XoError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return XoError::Serialization(e.to_string());
        }
        if e.is_builder() {
            return XoError::InvalidConfig(e.to_string());
        }
        if let Some(status) = e.status() {
            return XoError::from_status(status, "HTTP request failed", "");
        }
        // connect, timeout, request and body errors are all network-level
        XoError::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for XoError {
    fn from(e: serde_json::Error) -> Self {
        XoError::Serialization(e.to_string())
    }
}

/// Failure to establish the session in the first place
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Bad credentials
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Endpoint unreachable or timed out
    #[error("network error: {0}")]
    Network(String),

    /// Incompatible API version
    #[error("unsupported API: {0}")]
    Unsupported(String),

    /// The configuration could not be turned into a transport
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<XoError> for ConnectionError {
    fn from(e: XoError) -> Self {
        match e {
            XoError::Authentication(m) => ConnectionError::Auth(m),
            XoError::Unsupported(m) | XoError::NotFound(m) => ConnectionError::Unsupported(m),
            XoError::InvalidConfig(m) => ConnectionError::Config(m),
            other => ConnectionError::Network(other.to_string()),
        }
    }
}

impl From<ConnectionError> for XoError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Auth(m) => XoError::Authentication(m),
            ConnectionError::Network(m) => XoError::Transient(m),
            ConnectionError::Unsupported(m) => XoError::Unsupported(m),
            ConnectionError::Config(m) => XoError::InvalidConfig(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            XoError::from_status(StatusCode::UNAUTHORIZED, "GET /vms", ""),
            XoError::Authentication(_)
        ));
        assert!(XoError::from_status(StatusCode::NOT_FOUND, "GET /vms/x", "").is_not_found());
        assert!(matches!(
            XoError::from_status(StatusCode::CONFLICT, "PUT", ""),
            XoError::Conflict(_)
        ));
        assert!(matches!(
            XoError::from_status(StatusCode::INSUFFICIENT_STORAGE, "POST", "no space left"),
            XoError::Provisioning(_)
        ));
        assert!(XoError::from_status(StatusCode::BAD_GATEWAY, "GET", "").is_transient());
        assert!(XoError::from_status(StatusCode::TOO_MANY_REQUESTS, "GET", "").is_transient());
        assert!(!XoError::from_status(StatusCode::BAD_REQUEST, "POST", "").is_transient());
    }

    #[test]
    fn test_connection_error_round_trip_keeps_retry_class() {
        let auth: XoError = ConnectionError::from(XoError::Authentication("bad token".into())).into();
        assert!(matches!(auth, XoError::Authentication(_)));

        let net: XoError = ConnectionError::from(XoError::Transient("refused".into())).into();
        assert!(net.is_transient());
    }
}
