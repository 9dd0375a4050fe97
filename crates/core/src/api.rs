//! Wire protocol between the runner and the server
//!
//! A single endpoint, `POST {PREFIX}/{VERSION}/tests`, receives an
//! [`ExecutionRequest`] and answers with an [`ExecutionResult`]. Byte fields
//! travel as standard base64 strings. Any non-200 answer carries an
//! [`ErrorBody`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Path prefix of the API
pub const PREFIX: &str = "/api";

/// Version segment of the API
pub const VERSION: &str = "v1";

/// Path of the test execution endpoint, relative to the server address
pub fn tests_path() -> String {
    format!("{}/{}/tests", PREFIX, VERSION)
}

/// A test binary together with the parameters used to invoke it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Contents of the executable
    #[serde(default, with = "base64_bytes")]
    pub binary: Vec<u8>,
    /// Command line arguments, in order
    #[serde(default)]
    pub args: Vec<String>,
    /// Variables added on top of the server environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ExecutionRequest {
    pub fn new(binary: Vec<u8>) -> Self {
        Self {
            binary,
            ..Default::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Check the parts of the request that serde can't check
    pub fn validate(&self) -> Result<()> {
        if self.binary.is_empty() {
            return Err(Error::InvalidInput("binary is mandatory".to_string()));
        }
        if let Some(name) = self
            .env
            .keys()
            .find(|name| name.is_empty() || name.contains('=') || name.contains('\0'))
        {
            return Err(Error::InvalidInput(format!(
                "environment variable name '{}' isn't valid",
                name
            )));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Outcome of running one test binary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(rename = "out", default, with = "base64_bytes")]
    pub stdout: Vec<u8>,
    #[serde(rename = "err", default, with = "base64_bytes")]
    pub stderr: Vec<u8>,
    /// Exit status of the process, `-1` when it was killed by a signal
    #[serde(rename = "code")]
    pub exit_code: i32,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Body of every error response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub reason: String,
}

impl ErrorBody {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Serde adapter for byte vectors encoded as base64 strings. `null` decodes
/// to an empty vector.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD.decode(text).map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
