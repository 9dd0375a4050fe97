//! Error types for cluster operations

use thiserror::Error;

use crate::resource::ResourceKind;

/// Result type alias for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Errors that can occur while talking to the control plane
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Create found an object with the same name
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: ResourceKind, name: String },

    /// The object doesn't exist
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    /// The control plane answered with an unexpected status
    #[error("Can't {operation} {kind} '{name}': status {status}: {message}")]
    Api {
        operation: &'static str,
        kind: ResourceKind,
        name: String,
        status: u16,
        message: String,
    },

    /// The request didn't get an answer
    #[error("Control plane request failed: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Connection details are missing or unusable
    #[error("Invalid cluster configuration: {0}")]
    Config(String),

    /// A readiness predicate didn't hold in time
    #[error("{what} isn't ready after {seconds} seconds")]
    Timeout { what: String, seconds: u64 },

    /// The watched object went away or the stream broke
    #[error("Error while waiting for {what}: {message}")]
    Watch { what: String, message: String },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    /// Create a Transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a Transport error with source
    pub fn transport_with_source(message: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create a Watch error
    pub fn watch(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Watch {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
