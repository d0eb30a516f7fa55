//! Error types for MCA

use thiserror::Error;

/// Main error type for MCA operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The Pod cannot be reconciled into a valid injected shape
    #[error("malformed pod: {0}")]
    MalformedPod(String),

    /// A required configuration value is absent at call time
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// The input manifest could not be parsed into a Pod
    #[error("failed to parse manifest: {0}")]
    InvalidManifest(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Certificate generation error
    #[error("pki error: {0}")]
    Pki(#[from] crate::pki::PkiError),

    /// HTTP server error
    #[error("server error: {0}")]
    Server(String),

    /// Request forwarding error in the proxy
    #[error("proxy error: {0}")]
    Proxy(String),
}

impl Error {
    /// Create a malformed-pod error with the given message
    pub fn malformed_pod(msg: impl Into<String>) -> Self {
        Self::MalformedPod(msg.into())
    }

    /// Create a missing-configuration error with the given message
    pub fn missing_config(msg: impl Into<String>) -> Self {
        Self::MissingConfig(msg.into())
    }

    /// Create an invalid-manifest error with the given message
    pub fn invalid_manifest(msg: impl Into<String>) -> Self {
        Self::InvalidManifest(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a server error with the given message
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }

    /// Create a proxy error with the given message
    pub fn proxy(msg: impl Into<String>) -> Self {
        Self::Proxy(msg.into())
    }
}
