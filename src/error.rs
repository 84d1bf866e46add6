//! Error types for the health-sync operator

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Transport-level failure talking to the Consul agent
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The Consul agent answered with a non-success status
    #[error("Consul returned HTTP {status}: {message}")]
    ConsulError { status: u16, message: String },

    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The event source cannot reach the cluster at all
    #[error("Event source failed: {0}")]
    EventSourceError(String),
}

impl Error {
    /// Whether retrying the same operation later can reasonably succeed.
    ///
    /// Only used to pick log wording; the work queue retries any error
    /// until the retry ceiling is reached.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 429,
            Error::KubeError(_) | Error::HttpError(_) => true,
            Error::ConsulError { status, .. } => *status >= 500 || *status == 429,
            Error::ConfigError(_) | Error::SerializationError(_) => false,
            Error::EventSourceError(_) => false,
        }
    }

    /// Short category used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::HttpError(_) => "http",
            Error::ConsulError { .. } => "consul",
            Error::ConfigError(_) => "config",
            Error::SerializationError(_) => "serialization",
            Error::EventSourceError(_) => "event_source",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
