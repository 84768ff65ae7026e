//! Controller-specific error types.

use cloudprovider::{ConfigError, ManagerError};
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that stop the network manager.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cloud provider config could not be read
    #[error("Invalid cloud provider config: {0}")]
    Config(#[from] ConfigError),

    /// Provider registration failed
    #[error("Provider registration failed: {0}")]
    Registration(#[from] ManagerError),

    /// Invalid environment configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A background task stopped
    #[error("Task stopped: {0}")]
    TaskStopped(String),
}
