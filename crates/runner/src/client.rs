use reqwest::{header, Client, StatusCode};
use sandbox_core::{api, AuthToken, ErrorBody, ExecutionRequest, ExecutionResult};
use tracing::debug;

use crate::error::{Result, RunnerError};

/// Talks to the server running inside the environment
pub struct ServerClient {
    client: Client,
    address: String,
    token: AuthToken,
}

impl ServerClient {
    pub fn new(client: Client, address: impl Into<String>, token: AuthToken) -> Self {
        Self {
            client,
            address: address.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    /// Base address of the server, e.g. `https://server-sandbox.apps.example.com`
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one test binary and wait till the server has run it
    pub async fn send(&self, request: &ExecutionRequest) -> Result<ExecutionResult> {
        let url = format!("{}{}", self.address, api::tests_path());
        debug!("Sending POST request to '{}'", url);

        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, self.token.bearer_header())
            .header(header::CONTENT_TYPE, "application/json")
            .body(request.to_json()?)
            .send()
            .await
            .map_err(|e| RunnerError::transport_with_source(format!("POST '{}' failed", url), e))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            RunnerError::transport_with_source(format!("can't read response from '{}'", url), e)
        })?;
        if status != StatusCode::OK {
            let reason = error_reason(&body);
            return Err(match status {
                StatusCode::UNAUTHORIZED => RunnerError::Auth { reason },
                _ => RunnerError::Server {
                    status: status.as_u16(),
                    reason,
                },
            });
        }
        Ok(ExecutionResult::from_json(&body)?)
    }
}

/// Reason of an error answer, falling back to the raw body when it isn't the
/// usual `{"reason": ...}` document
fn error_reason(body: &[u8]) -> String {
    serde_json::from_slice::<ErrorBody>(body)
        .map(|error| error.reason)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_reason() {
        assert_eq!(error_reason(br#"{"reason": "Wrong token"}"#), "Wrong token");
        assert_eq!(error_reason(b"Bad Gateway\n"), "Bad Gateway");
    }

    #[test]
    fn test_address_is_normalized() {
        let client = ServerClient::new(Client::new(), "https://example.com/", AuthToken::generate());
        assert_eq!(client.address(), "https://example.com");
    }
}
