//! Access log middleware

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::Response,
};
use tracing::info;

/// Write every request to the log before handing it to the next stage
pub async fn log_access(request: Request, next: Next) -> Response {
    info!(
        "Received {} request for '{}' from '{}'",
        request.method(),
        request.uri().path(),
        caller_address(&request)
    );
    next.run(request).await
}

/// Address of the peer, when the server was started with connection info
pub fn caller_address(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(address)| address.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
