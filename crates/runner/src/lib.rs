//! Sandbox Runner - runs test binaries in an ephemeral cluster environment
//!
//! The runner builds the test binaries, provisions a project with a server
//! and a cleaner, sends the binaries to the server one at a time and prints
//! what they wrote. When it is done it deletes the project; if it dies
//! before that, the cleaner deletes the project after a delay.

mod binaries;
mod client;
mod error;
mod session;

pub use binaries::{compile_binaries, find_binaries, scan_directories, BINARY_EXTENSION};
pub use client::ServerClient;
pub use error::{Result, RunnerError};
pub use session::{
    RunSummary, Runner, RunnerBuilder, Session, WaitSettings, DEFAULT_CLEANUP_DELAY,
};
