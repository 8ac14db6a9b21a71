//! Controller-specific error types.
//!
//! Provider and Kubernetes errors are carried as-is; the rest covers startup
//! configuration.

use kube::Error as KubeError;
use thiserror::Error;
use xo_cloud_provider::ProviderError;

/// Errors that can occur in the cloud controller manager.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cloud provider error
    #[error("Cloud provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A background loop panicked or was aborted
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The provider does not serve a capability the controller needs
    #[error("Capability not supported: {0}")]
    Unsupported(String),
}

impl ControllerError {
    /// True when requeueing soon is likely to help
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Provider(e) => e.is_transient(),
            ControllerError::Kube(_) => true,
            _ => false,
        }
    }
}
