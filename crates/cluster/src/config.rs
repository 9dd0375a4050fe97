//! Cluster connection configuration
//!
//! The connection details come from, in order of preference:
//! - an explicit file, either a kubeconfig or a JSON [`ClusterConfig`]
//! - the `SANDBOX_CLUSTER_SERVER`/`SANDBOX_CLUSTER_TOKEN` variables
//! - the service account that the cluster mounts into pods
//! - the kubeconfig of the user (`KUBECONFIG` or `~/.kube/config`)

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Certificate, Client, Proxy};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ClusterError, Result};
use crate::kubeconfig::{self, Kubeconfig};

/// Directory where the cluster mounts the service account of a pod
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const SERVER_ENV: &str = "SANDBOX_CLUSTER_SERVER";
const TOKEN_ENV: &str = "SANDBOX_CLUSTER_TOKEN";

/// How to reach the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Base URL of the API server, e.g. `https://api.example.com:6443`
    pub server: String,
    /// Bearer token used to authenticate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Namespace the caller runs in, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// PEM file with additional trusted certificate authorities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
    /// Base64 encoded PEM with trusted certificate authorities, as found in
    /// kubeconfig files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_data: Option<String>,
    /// Accept certificates signed by unknown authorities
    #[serde(default)]
    pub insecure: bool,
    /// Proxy used for every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl ClusterConfig {
    /// Load the configuration using the first source that is available
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            debug!("Loading cluster configuration from {:?}", path);
            return Self::from_file(path);
        }
        if let Some(config) = Self::from_env() {
            debug!("Using cluster configuration from the environment");
            return Ok(config);
        }
        if std::env::var_os("KUBERNETES_SERVICE_HOST").is_some() {
            debug!("Using in-cluster configuration");
            return Self::in_cluster();
        }
        let path = kubeconfig::default_path().ok_or_else(|| {
            ClusterError::Config(
                "no configuration file given, not running inside a cluster and no home directory"
                    .to_string(),
            )
        })?;
        debug!("Loading kubeconfig from {:?}", path);
        Self::from_file(&path)
    }

    /// Load a kubeconfig or a JSON cluster configuration
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            ClusterError::Config(format!("can't read configuration file {:?}: {}", path, e))
        })?;
        // JSON documents are valid YAML too
        let document: serde_yaml::Value = serde_yaml::from_slice(&data).map_err(|e| {
            ClusterError::Config(format!("can't parse configuration file {:?}: {}", path, e))
        })?;
        let config = if kubeconfig::is_kubeconfig(&document) {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            Kubeconfig::from_value(document)?.into_cluster_config(base)?
        } else {
            serde_yaml::from_value(document).map_err(|e| {
                ClusterError::Config(format!("invalid configuration file {:?}: {}", path, e))
            })?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Option<Self> {
        let server = std::env::var(SERVER_ENV).ok().filter(|s| !s.is_empty())?;
        Some(Self {
            server,
            token: std::env::var(TOKEN_ENV).ok().filter(|s| !s.is_empty()),
            ..Default::default()
        })
    }

    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            ClusterError::Config(
                "no configuration file given and not running inside a cluster".to_string(),
            )
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        Self::from_service_account(&host, &port, Path::new(SERVICE_ACCOUNT_DIR))
    }

    /// Build the configuration from a mounted service account directory
    pub fn from_service_account(host: &str, port: &str, dir: &Path) -> Result<Self> {
        let token = std::fs::read_to_string(dir.join("token"))?;
        let ca_file = dir.join("ca.crt");
        let server = if host.contains(':') {
            format!("https://[{}]:{}", host, port)
        } else {
            format!("https://{}:{}", host, port)
        };
        Ok(Self {
            server,
            token: Some(token.trim().to_string()),
            namespace: read_namespace_file(&dir.join("namespace")).ok(),
            ca_file: ca_file.exists().then_some(ca_file),
            ca_data: None,
            insecure: false,
            proxy: None,
        })
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        if proxy.is_some() {
            self.proxy = proxy;
        }
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure |= insecure;
        self
    }

    /// PEM with the extra certificate authorities to trust, if any
    pub fn ca_pem(&self) -> Result<Option<Vec<u8>>> {
        if let Some(data) = &self.ca_data {
            let pem = STANDARD.decode(data.trim()).map_err(|e| {
                ClusterError::Config(format!("invalid certificate authority data: {}", e))
            })?;
            return Ok(Some(pem));
        }
        match &self.ca_file {
            Some(path) => Ok(Some(std::fs::read(path).map_err(|e| {
                ClusterError::Config(format!("can't read CA certificate {:?}: {}", path, e))
            })?)),
            None => Ok(None),
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.server.starts_with("http://") && !self.server.starts_with("https://") {
            return Err(ClusterError::Config(format!(
                "server '{}' must be an http or https URL",
                self.server
            )));
        }
        Ok(())
    }
}

/// Read the name of the namespace the cluster writes into every pod
pub fn read_namespace_file(path: &Path) -> Result<String> {
    let namespace = std::fs::read_to_string(path)?.trim().to_string();
    if namespace.is_empty() {
        return Err(ClusterError::Config(format!(
            "namespace file {:?} is empty",
            path
        )));
    }
    Ok(namespace)
}

/// Build an HTTP client honoring the proxy and TLS settings
pub fn build_http_client(
    proxy: Option<&str>,
    insecure: bool,
    ca_pem: Option<&[u8]>,
) -> Result<Client> {
    let mut builder = Client::builder();
    if let Some(proxy) = proxy {
        let proxy = Proxy::all(proxy)
            .map_err(|e| ClusterError::Config(format!("invalid proxy URL '{}': {}", proxy, e)))?;
        builder = builder.proxy(proxy);
    }
    if insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(pem) = ca_pem {
        for certificate in Certificate::from_pem_bundle(pem)
            .map_err(|e| ClusterError::Config(format!("invalid CA certificate: {}", e)))?
        {
            builder = builder.add_root_certificate(certificate);
        }
    }
    builder
        .build()
        .map_err(|e| ClusterError::Config(format!("can't create HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.json");
        std::fs::write(
            &path,
            r#"{"server": "https://api.example.com:6443", "token": "abc", "insecure": true}"#,
        )
        .unwrap();

        let config = ClusterConfig::from_file(&path).unwrap();
        assert_eq!(config.server, "https://api.example.com:6443");
        assert_eq!(config.token.as_deref(), Some("abc"));
        assert!(config.insecure);
        assert!(config.proxy.is_none());
    }

    #[test]
    fn test_from_file_rejects_bad_server() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.json");
        std::fs::write(&path, r#"{"server": "api.example.com"}"#).unwrap();

        assert!(matches!(
            ClusterConfig::from_file(&path),
            Err(ClusterError::Config(_))
        ));
    }

    #[test]
    fn test_from_file_reads_kubeconfig() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config");
        std::fs::write(
            &path,
            concat!(
                "current-context: dev\n",
                "contexts:\n",
                "- name: dev\n",
                "  context: {cluster: dev, user: dev}\n",
                "clusters:\n",
                "- name: dev\n",
                "  cluster: {server: 'https://api.dev.example.com:6443', certificate-authority-data: Zm9v}\n",
                "users:\n",
                "- name: dev\n",
                "  user: {token: dev-token}\n",
            ),
        )
        .unwrap();

        let config = ClusterConfig::from_file(&path).unwrap();
        assert_eq!(config.server, "https://api.dev.example.com:6443");
        assert_eq!(config.token.as_deref(), Some("dev-token"));
        assert_eq!(config.ca_pem().unwrap(), Some(b"foo".to_vec()));
    }

    #[test]
    fn test_ca_pem_sources() {
        assert_eq!(ClusterConfig::default().ca_pem().unwrap(), None);

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ca.crt");
        std::fs::write(&path, "pem").unwrap();
        let config = ClusterConfig {
            ca_file: Some(path),
            ..Default::default()
        };
        assert_eq!(config.ca_pem().unwrap(), Some(b"pem".to_vec()));

        let config = ClusterConfig {
            ca_data: Some("not base64!".to_string()),
            ..Default::default()
        };
        assert!(matches!(config.ca_pem(), Err(ClusterError::Config(_))));
    }

    #[test]
    fn test_from_service_account() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("token"), "sa-token\n").unwrap();
        std::fs::write(dir.path().join("namespace"), "sandbox-jane-1\n").unwrap();

        let config = ClusterConfig::from_service_account("10.0.0.1", "443", dir.path()).unwrap();
        assert_eq!(config.server, "https://10.0.0.1:443");
        assert_eq!(config.token.as_deref(), Some("sa-token"));
        assert_eq!(config.namespace.as_deref(), Some("sandbox-jane-1"));
        assert!(config.ca_file.is_none());
    }

    #[test]
    fn test_read_namespace_file_rejects_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("namespace");
        std::fs::write(&path, "  \n").unwrap();
        assert!(read_namespace_file(&path).is_err());
    }

    #[test]
    fn test_overrides() {
        let config = ClusterConfig::default()
            .with_proxy(Some("http://proxy:3128".to_string()))
            .with_insecure(true)
            .with_proxy(None);
        assert_eq!(config.proxy.as_deref(), Some("http://proxy:3128"));
        assert!(config.insecure);
    }
}
