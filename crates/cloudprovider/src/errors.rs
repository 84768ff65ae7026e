//! Plugin error taxonomy.
//!
//! Every lifecycle failure is a [`PluginError`]. Its [`ErrorKind`] is only
//! used to classify events and logs. The one kind callers branch on is
//! `NotImplemented`, which the dispatcher treats as "pod left unmodified".

use crate::cache::CacheError;
use cluster_client::ClusterError;
use network_api::NetworkApiError;
use std::fmt;
use thiserror::Error;

/// Classification of a plugin failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed pod annotation or plugin configuration, never retried
    ParameterError,
    /// Kubernetes or cloud API call failed, safe to retry
    ApiCallError,
    /// External resource not provisioned yet
    ResourceNotReady,
    /// Port pool exhausted for an allocation key
    PortExhausted,
    /// Invariant violation
    InternalError,
    /// Operation unsupported by the plugin
    NotImplementedError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ParameterError => "ParameterError",
            ErrorKind::ApiCallError => "ApiCallError",
            ErrorKind::ResourceNotReady => "ResourceNotReady",
            ErrorKind::PortExhausted => "PortExhausted",
            ErrorKind::InternalError => "InternalError",
            ErrorKind::NotImplementedError => "NotImplementedError",
        };
        f.write_str(s)
    }
}

/// Errors returned by plugin lifecycle calls
#[derive(Debug, Error)]
pub enum PluginError {
    /// Bad pod parameters or plugin configuration
    #[error("Parameter error: {0}")]
    Parameter(String),

    /// Kubernetes or cloud API failure
    #[error("API call error: {0}")]
    ApiCall(String),

    /// External resource not ready yet.
    ///
    /// The bundled plugins report a resource that is still coming up as a
    /// `Waiting` network status instead; this kind is left for plugins that
    /// have to fail the call.
    #[error("Resource not ready: {0}")]
    ResourceNotReady(String),

    /// No free ports left
    #[error("Port exhausted: {0}")]
    PortExhausted(String),

    /// Invariant violation
    #[error("Internal error: {0}")]
    Internal(String),

    /// Unsupported operation
    #[error("Not implemented: {0}")]
    NotImplemented(String),
}

impl PluginError {
    /// The error kind used for events and logs.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PluginError::Parameter(_) => ErrorKind::ParameterError,
            PluginError::ApiCall(_) => ErrorKind::ApiCallError,
            PluginError::ResourceNotReady(_) => ErrorKind::ResourceNotReady,
            PluginError::PortExhausted(_) => ErrorKind::PortExhausted,
            PluginError::Internal(_) => ErrorKind::InternalError,
            PluginError::NotImplemented(_) => ErrorKind::NotImplementedError,
        }
    }
}

impl From<ClusterError> for PluginError {
    fn from(e: ClusterError) -> Self {
        PluginError::ApiCall(e.to_string())
    }
}

impl From<NetworkApiError> for PluginError {
    fn from(e: NetworkApiError) -> Self {
        PluginError::Parameter(e.to_string())
    }
}

impl From<CacheError> for PluginError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Exhausted { .. } => PluginError::PortExhausted(e.to_string()),
            CacheError::InvalidRequest(_) => PluginError::Parameter(e.to_string()),
            CacheError::Taken { .. } => PluginError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::PortExhausted.to_string(), "PortExhausted");
        assert_eq!(
            PluginError::NotImplemented("update".to_string()).kind(),
            ErrorKind::NotImplementedError
        );
        assert_eq!(
            PluginError::ResourceNotReady("slb lb-1".to_string()).kind().to_string(),
            "ResourceNotReady"
        );
    }

    #[test]
    fn test_cluster_errors_are_api_call_errors() {
        let err: PluginError = ClusterError::NotFound("service a/b".to_string()).into();
        assert_eq!(err.kind(), ErrorKind::ApiCallError);
    }

    #[test]
    fn test_cache_exhaustion_maps_to_port_exhausted() {
        let err: PluginError = CacheError::Exhausted {
            key: "node-A".to_string(),
            requested: 2,
            available: 1,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::PortExhausted);
    }

    #[test]
    fn test_contested_port_is_internal_error() {
        let err: PluginError = CacheError::Taken {
            key: "node-a".to_string(),
            unit: 8005,
            holder: crate::cache::Owner::new("default/gs-1", None),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::InternalError);
        assert!(err.to_string().contains("default/gs-1"));
    }
}
