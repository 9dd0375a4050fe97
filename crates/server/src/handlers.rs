//! Request handlers

use axum::{
    body::Bytes,
    extract::State,
    http::{header, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use sandbox_core::ExecutionRequest;
use tracing::{error, info};

use crate::error::ApiError;
use crate::execution::execute;
use crate::state::ServerState;

/// POST /api/v1/tests - Run a test binary and return what it wrote
pub async fn run_test(State(state): State<ServerState>, body: Bytes) -> Result<Response, ApiError> {
    let request = ExecutionRequest::from_json(&body).map_err(|e| {
        info!("Can't unmarshal request body: {}", e);
        ApiError::bad_request("Can't unmarshal request body")
    })?;
    request
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let result = execute(state.work(), &request).await.map_err(|e| {
        error!("{}", e);
        ApiError::from(e)
    })?;

    let body = result.to_json().map_err(|e| {
        error!("Can't serialize test result: {}", e);
        ApiError::internal("Can't serialize test result")
    })?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

/// Fallback for every path that isn't routed
pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::not_found(format!("Can't find resource for path '{}'", uri.path()))
}

/// Fallback for a routed path used with the wrong method
pub async fn method_not_allowed(method: Method, uri: Uri) -> ApiError {
    ApiError::new(
        StatusCode::METHOD_NOT_ALLOWED,
        format!("Method '{}' isn't allowed for path '{}'", method, uri.path()),
    )
}
