//! Error types for sandbox-runner

use std::path::PathBuf;

use sandbox_cluster::ClusterError;
use thiserror::Error;

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

/// Errors that can occur while provisioning or running tests
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Bad input, reported before anything is done
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The server couldn't be reached or the exchange broke
    #[error("Can't talk to the server: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The server rejected the token
    #[error("Server rejected the token: {reason}")]
    Auth { reason: String },

    /// The server answered with an error
    #[error("Server failed with status {status}: {reason}")]
    Server { status: u16, reason: String },

    /// Control plane failure, including readiness timeouts
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Building the test binaries failed
    #[error("Compilation of tests in {directory:?} failed: {message}")]
    Compile { directory: PathBuf, message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire format error
    #[error("Protocol error: {0}")]
    Protocol(#[from] sandbox_core::Error),
}

impl RunnerError {
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

    /// Create a Compile error
    pub fn compile(directory: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Compile {
            directory: directory.into(),
            message: message.into(),
        }
    }
}
