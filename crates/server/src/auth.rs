//! Bearer token authentication
//!
//! Runs before the request body is even looked at, so a caller without the
//! right token can't cause any side effect.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use sandbox_core::token::fingerprint;
use tracing::warn;

use crate::access::caller_address;
use crate::error::ApiError;
use crate::state::ServerState;

pub async fn require_token(
    State(state): State<ServerState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&request)?;
    if !state.token().matches(token) {
        // The presented credential is never logged, only a digest of it
        warn!(
            method = %request.method(),
            path = request.uri().path(),
            address = %caller_address(&request),
            token = %fingerprint(token),
            "Rejected request because token is incorrect"
        );
        return Err(ApiError::unauthorized("Wrong token"));
    }
    Ok(next.run(request).await)
}

/// Extract the token from an `Authorization: Bearer <token>` header
fn bearer_token(request: &Request) -> Result<&str, ApiError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or_else(|| ApiError::bad_request("Authorization header is mandatory"))?;
    let value = header
        .to_str()
        .map_err(|_| ApiError::bad_request("Authorization header contains invalid characters"))?;

    let parts: Vec<&str> = value.split(' ').collect();
    let [kind, token] = parts.as_slice() else {
        return Err(ApiError::bad_request(format!(
            "Expected exactly 2 parts in the authorization header but found {}",
            parts.len()
        )));
    };
    if !kind.eq_ignore_ascii_case("bearer") {
        return Err(ApiError::bad_request(format!(
            "Expected authorization type 'bearer' but found '{}'",
            kind
        )));
    }
    Ok(*token)
}
