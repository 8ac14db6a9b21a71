//! Provider error types.
//!
//! Platform errors from the XenOrchestra client are carried unchanged so the
//! host framework's retry loop sees the original classification.

use kube::Error as KubeError;
use thiserror::Error;
use xo_client::{ConnectionError, XoError};

/// Errors returned by the cloud provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// XenOrchestra platform error
    #[error("XenOrchestra error: {0}")]
    Xo(#[from] XoError),

    /// The session could not be established
    #[error("XenOrchestra connection failed: {0}")]
    Connection(#[from] ConnectionError),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// No VM backs this node any more
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Provider ID is not `xenorchestra://<uuid>`
    #[error("Invalid provider ID: {0}")]
    InvalidProviderId(String),

    /// The Service cannot be turned into a balancer target
    #[error("Invalid service: {0}")]
    InvalidService(String),

    /// Capability method this provider does not implement
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// No factory registered under this name
    #[error("Unknown cloud provider: {0}")]
    UnknownProvider(String),

    /// Capability used before `initialize`
    #[error("Cloud provider is not initialized")]
    NotInitialized,

    /// The cloud-config stream could not be read
    #[error("Failed to read cloud-config: {0}")]
    Io(#[from] std::io::Error),
}

impl ProviderError {
    /// True when the instance is gone from the platform
    pub fn is_instance_not_found(&self) -> bool {
        matches!(self, ProviderError::InstanceNotFound(_))
    }

    /// True for failures that need a human before a retry can succeed
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderError::Xo(XoError::Provisioning(_) | XoError::InvalidRequest(_))
                | ProviderError::InvalidService(_)
        )
    }

    /// True when the host should simply re-drive the call later
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Xo(e) => e.is_transient(),
            ProviderError::Connection(ConnectionError::Network(_)) => true,
            _ => false,
        }
    }
}
