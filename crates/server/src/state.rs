//! Server state

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sandbox_core::AuthToken;

/// State shared by the request handlers. Nothing in it changes after the
/// server starts; every test run gets its own directory under `work`.
#[derive(Clone)]
pub struct ServerState {
    inner: Arc<ServerStateInner>,
}

struct ServerStateInner {
    token: AuthToken,
    work: PathBuf,
}

impl ServerState {
    pub fn new(token: AuthToken, work: PathBuf) -> Self {
        Self {
            inner: Arc::new(ServerStateInner { token, work }),
        }
    }

    /// Token that callers have to present
    pub fn token(&self) -> &AuthToken {
        &self.inner.token
    }

    /// Directory where the test directories are created
    pub fn work(&self) -> &Path {
        &self.inner.work
    }
}
