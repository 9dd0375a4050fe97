//! Bearer token shared by one runner and one server
//!
//! The runner generates the token while provisioning the environment and hands
//! it to the server through its startup configuration. It only lives in the
//! memory of those two processes.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Opaque authentication token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Generate a fresh random token
    pub fn generate() -> Self {
        let mut bytes = [0_u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Wrap an existing token, rejecting values that can't travel in a bearer
    /// header
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.is_empty() {
            return Err(Error::InvalidInput("token can't be empty".to_string()));
        }
        if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::InvalidInput(
                "token can't contain whitespace or control characters".to_string(),
            ));
        }
        Ok(Self(value))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Value of the `Authorization` header carrying this token
    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.0)
    }

    /// Compare against a presented credential without short-circuiting on the
    /// first differing byte
    pub fn matches(&self, candidate: &str) -> bool {
        let expected = Sha256::digest(self.0.as_bytes());
        let actual = Sha256::digest(candidate.as_bytes());
        expected
            .iter()
            .zip(actual.iter())
            .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    /// Short digest that identifies the token in logs
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

/// Short digest of an arbitrary credential, safe to write to logs
pub fn fingerprint(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..6])
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthToken({})", self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens_are_unique_and_header_safe() {
        let first = AuthToken::generate();
        let second = AuthToken::generate();
        assert_ne!(first, second);
        assert_eq!(first.expose().len(), 43);
        assert!(AuthToken::new(first.expose()).is_ok());
    }

    #[test]
    fn test_matches() {
        let token = AuthToken::new("secret-token").unwrap();
        assert!(token.matches("secret-token"));
        assert!(!token.matches("secret-tokem"));
        assert!(!token.matches(""));
    }

    #[test]
    fn test_debug_is_redacted() {
        let token = AuthToken::new("secret-token").unwrap();
        let printed = format!("{:?}", token);
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains(&token.fingerprint()));
        assert_eq!(token.fingerprint().len(), 12);
    }

    #[test]
    fn test_new_rejects_unusable_values() {
        assert!(AuthToken::new("").is_err());
        assert!(AuthToken::new("two words").is_err());
    }

    #[test]
    fn test_bearer_header() {
        let token = AuthToken::new("abc").unwrap();
        assert_eq!(token.bearer_header(), "Bearer abc");
    }
}
