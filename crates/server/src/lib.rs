//! Server that runs test binaries inside a sandbox environment
//!
//! It exposes a single authenticated endpoint, `POST /api/v1/tests`. Each
//! request carries a binary with its arguments and environment; the server
//! runs it in a fresh directory and answers with the exit code and whatever
//! the binary wrote to stdout and stderr.
//!
//! Requests go through these stages, outermost first:
//! - HTTP tracing
//! - access log
//! - routing, with JSON answers for unknown paths and methods
//! - bearer token check, only for routed paths
//! - the handler

mod access;
mod auth;
mod error;
mod execution;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::post,
    Router,
};
use sandbox_core::{api, AuthToken};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use error::{ApiError, ExecutionError, Result, ServerError};
pub use execution::{execute, TestDirectory, SIGNALED_EXIT_CODE};
pub use state::ServerState;

/// Address used when none is configured
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8000";

/// Test binaries are shipped whole inside the request body
const MAX_REQUEST_BYTES: usize = 1024 * 1024 * 1024;

/// Build the request pipeline
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route(
            &api::tests_path(),
            post(handlers::run_test).fallback(handlers::method_not_allowed),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ))
        .fallback(handlers::not_found)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .layer(middleware::from_fn(access::log_access))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Builder for [`Server`]
#[derive(Default)]
pub struct ServerBuilder {
    listen: Option<String>,
    token: Option<AuthToken>,
    work: Option<PathBuf>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Address and port to listen on, `0.0.0.0:8000` by default
    pub fn listen(mut self, value: impl Into<String>) -> Self {
        self.listen = Some(value.into());
        self
    }

    /// Token that callers must present. Mandatory.
    pub fn token(mut self, value: AuthToken) -> Self {
        self.token = Some(value);
        self
    }

    /// Directory for the test directories, the system temporary directory
    /// by default
    pub fn work(mut self, value: impl Into<PathBuf>) -> Self {
        self.work = Some(value.into());
        self
    }

    pub fn build(self) -> Result<Server> {
        let token = self
            .token
            .ok_or_else(|| ServerError::Config("token is mandatory".to_string()))?;
        let work = self.work.unwrap_or_else(std::env::temp_dir);
        if !work.is_dir() {
            return Err(ServerError::Config(format!(
                "work directory {:?} doesn't exist or isn't a directory",
                work
            )));
        }
        Ok(Server {
            listen: self.listen.unwrap_or_else(|| DEFAULT_LISTEN.to_string()),
            state: ServerState::new(token, work),
            local_addr: None,
            shutdown: None,
            task: None,
        })
    }
}

/// Server running in a background task
pub struct Server {
    listen: String,
    state: ServerState,
    local_addr: Option<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bind the listen address and start serving in the background
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.task.is_some() {
            return Err(ServerError::Config("server is already running".to_string()));
        }
        let listener = TcpListener::bind(&self.listen).await?;
        let address = listener.local_addr()?;
        info!(
            "Listening on '{}', test directories go to {:?}",
            address,
            self.state.work()
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(self.state.clone());
        self.task = Some(tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
        }));
        self.shutdown = Some(shutdown_tx);
        self.local_addr = Some(address);
        Ok(address)
    }

    /// Address the server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting connections and wait for the requests in flight
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(result) => result?,
            Err(e) => {
                error!("Server task failed: {}", e);
                return Err(ServerError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e.to_string(),
                )));
            }
        }
        info!("Server stopped");
        Ok(())
    }
}
