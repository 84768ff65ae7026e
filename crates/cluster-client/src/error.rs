//! Cluster client errors

use thiserror::Error;

/// Errors that can occur when talking to the Kubernetes API
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object already exists or was modified concurrently
    #[error("Conflict: {0}")]
    Conflict(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid request (e.g., missing required fields)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ClusterError {
    /// Whether the error means the object is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    /// Map a kube error for `what`, translating 404/409 into typed variants.
    pub(crate) fn from_kube(e: kube::Error, what: impl Into<String>) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => ClusterError::NotFound(what.into()),
            kube::Error::Api(ae) if ae.code == 409 => ClusterError::Conflict(what.into()),
            other => ClusterError::Kube(other),
        }
    }
}
