//! Network API errors

use thiserror::Error;

/// Errors raised while decoding the pod annotation contract
#[derive(Debug, Error)]
pub enum NetworkApiError {
    /// Annotation value is not valid JSON for its schema
    #[error("Invalid annotation {annotation}: {source}")]
    InvalidJson {
        /// Annotation key
        annotation: String,
        /// Underlying decode error
        #[source]
        source: serde_json::Error,
    },

    /// A `port/PROTOCOL` item could not be parsed
    #[error("Invalid port declaration: {0}")]
    InvalidPort(String),

    /// Unsupported protocol name
    #[error("Unsupported protocol: {0}")]
    InvalidProtocol(String),

    /// A required network-conf parameter is missing
    #[error("Missing network parameter: {0}")]
    MissingParameter(String),
}
