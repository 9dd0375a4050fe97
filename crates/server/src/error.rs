//! Error types for the server

use std::io;
use std::path::PathBuf;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use sandbox_core::ErrorBody;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors building or running the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid server configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Failures of the steps that run one test binary. All of them are the fault
/// of the server, not of the caller.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Can't create test directory {path:?}: {source}")]
    CreateDirectory { path: PathBuf, source: io::Error },

    #[error("Can't create test binary file {path:?}: {source}")]
    WriteBinary { path: PathBuf, source: io::Error },

    #[error("Can't create output file {path:?}: {source}")]
    CreateOutput { path: PathBuf, source: io::Error },

    #[error("Can't execute test binary {path:?}: {source}")]
    Spawn { path: PathBuf, source: io::Error },

    #[error("Can't read output file {path:?}: {source}")]
    ReadOutput { path: PathBuf, source: io::Error },
}

impl ExecutionError {
    /// Reason sent to the caller. Paths and OS details stay in the log.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::CreateDirectory { .. } => "Can't create test directory",
            Self::WriteBinary { .. } => "Can't create test binary file",
            Self::CreateOutput { .. } => "Can't create output file",
            Self::Spawn { .. } => "Can't execute test binary",
            Self::ReadOutput { .. } => "Can't read output file",
        }
    }
}

/// Error answered to an HTTP request, rendered as `{"reason": ...}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    status: StatusCode,
    reason: String,
}

impl ApiError {
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, reason)
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, reason)
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, reason)
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, reason)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<ExecutionError> for ApiError {
    fn from(error: ExecutionError) -> Self {
        Self::internal(error.reason())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match serde_json::to_vec(&ErrorBody::new(self.reason)) {
            Ok(body) => body,
            Err(_) => br#"{"reason":"An unexpected error happened, please check the log for details"}"#
                .to_vec(),
        };
        (
            self.status,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}
