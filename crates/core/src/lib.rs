//! Core library for the sandbox test runner
//!
//! This crate contains the pieces shared by the runner and the server:
//! - The JSON wire protocol used to ship test binaries and results
//! - The bearer token that pairs one runner with one server

pub mod api;
pub mod error;
pub mod token;

pub use api::{ErrorBody, ExecutionRequest, ExecutionResult};
pub use error::Error;
pub use token::AuthToken;

pub type Result<T> = std::result::Result<T, Error>;
