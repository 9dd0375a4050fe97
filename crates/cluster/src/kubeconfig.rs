//! Connection details taken from a kubeconfig file
//!
//! Only what the sandbox needs is read: the server, token and CA of the
//! current context. Users that authenticate with client certificates or exec
//! plugins aren't supported.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::config::ClusterConfig;
use crate::error::{ClusterError, Result};

/// Variable with the list of kubeconfig files, the first one is used
pub const KUBECONFIG_ENV: &str = "KUBECONFIG";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Kubeconfig {
    #[serde(default)]
    current_context: Option<String>,
    #[serde(default)]
    contexts: Vec<Named<Context>>,
    #[serde(default)]
    clusters: Vec<Named<Cluster>>,
    #[serde(default)]
    users: Vec<Named<User>>,
}

#[derive(Debug, Deserialize)]
struct Named<T> {
    name: String,
    #[serde(alias = "context", alias = "cluster", alias = "user")]
    value: T,
}

#[derive(Debug, Deserialize)]
struct Context {
    cluster: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Cluster {
    server: String,
    #[serde(default)]
    certificate_authority: Option<PathBuf>,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
    #[serde(default)]
    proxy_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct User {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    token_file: Option<PathBuf>,
}

/// Default location: the first entry of `KUBECONFIG`, else `~/.kube/config`
pub fn default_path() -> Option<PathBuf> {
    if let Some(list) = std::env::var_os(KUBECONFIG_ENV) {
        if let Some(first) = std::env::split_paths(&list).find(|p| !p.as_os_str().is_empty()) {
            return Some(first);
        }
    }
    dirs::home_dir().map(|home| home.join(".kube").join("config"))
}

/// Whether a parsed document looks like a kubeconfig rather than a plain
/// cluster configuration
pub(crate) fn is_kubeconfig(document: &serde_yaml::Value) -> bool {
    document.get("clusters").is_some() || document.get("current-context").is_some()
}

impl Kubeconfig {
    pub(crate) fn from_value(document: serde_yaml::Value) -> Result<Self> {
        serde_yaml::from_value(document)
            .map_err(|e| ClusterError::Config(format!("invalid kubeconfig: {}", e)))
    }

    /// Resolve the current context. Relative file references are taken
    /// relative to `base`, the directory of the kubeconfig file.
    pub(crate) fn into_cluster_config(self, base: &Path) -> Result<ClusterConfig> {
        let context_name = self
            .current_context
            .filter(|name| !name.is_empty())
            .ok_or_else(|| ClusterError::Config("kubeconfig has no current context".to_string()))?;
        let context = find(self.contexts, &context_name, "context")?;
        debug!("Using kubeconfig context '{}'", context_name);

        let cluster = find(self.clusters, &context.cluster, "cluster")?;
        let user = match &context.user {
            Some(name) => find(self.users, name, "user")?,
            None => User::default(),
        };

        let token = match (user.token, user.token_file) {
            (Some(token), _) => Some(token),
            (None, Some(file)) => {
                let path = base.join(file);
                let token = std::fs::read_to_string(&path).map_err(|e| {
                    ClusterError::Config(format!("can't read token file {:?}: {}", path, e))
                })?;
                Some(token.trim().to_string())
            }
            (None, None) => None,
        };
        if token.is_none() {
            return Err(ClusterError::Config(format!(
                "user of context '{}' has no token, log in to the cluster first",
                context_name
            )));
        }

        let config = ClusterConfig {
            server: cluster.server,
            token,
            namespace: context.namespace,
            ca_file: cluster.certificate_authority.map(|file| base.join(file)),
            ca_data: cluster.certificate_authority_data,
            insecure: cluster.insecure_skip_tls_verify,
            proxy: cluster.proxy_url,
        };
        Ok(config)
    }
}

fn find<T>(entries: Vec<Named<T>>, name: &str, what: &str) -> Result<T> {
    entries
        .into_iter()
        .find(|entry| entry.name == name)
        .map(|entry| entry.value)
        .ok_or_else(|| ClusterError::Config(format!("kubeconfig has no {} named '{}'", what, name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: sandbox/api-example-com:6443/jane
contexts:
- name: other
  context:
    cluster: other
    user: other
- name: sandbox/api-example-com:6443/jane
  context:
    cluster: api-example-com:6443
    namespace: sandbox
    user: jane/api-example-com:6443
clusters:
- name: api-example-com:6443
  cluster:
    server: https://api.example.com:6443
    certificate-authority: ca.crt
    insecure-skip-tls-verify: true
- name: other
  cluster:
    server: https://other.example.com:6443
users:
- name: jane/api-example-com:6443
  user:
    token: sha256~abc
- name: other
  user:
    tokenFile: other-token
"#;

    fn parse(text: &str) -> Kubeconfig {
        Kubeconfig::from_value(serde_yaml::from_str(text).unwrap()).unwrap()
    }

    #[test]
    fn test_current_context_is_used() {
        let config = parse(KUBECONFIG)
            .into_cluster_config(Path::new("/home/jane/.kube"))
            .unwrap();

        assert_eq!(config.server, "https://api.example.com:6443");
        assert_eq!(config.token.as_deref(), Some("sha256~abc"));
        assert_eq!(config.namespace.as_deref(), Some("sandbox"));
        assert_eq!(
            config.ca_file,
            Some(PathBuf::from("/home/jane/.kube/ca.crt"))
        );
        assert!(config.insecure);
    }

    #[test]
    fn test_token_file_is_read() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("other-token"), "file-token\n").unwrap();
        let text = KUBECONFIG.replace(
            "current-context: sandbox/api-example-com:6443/jane",
            "current-context: other",
        );

        let config = parse(&text).into_cluster_config(dir.path()).unwrap();
        assert_eq!(config.server, "https://other.example.com:6443");
        assert_eq!(config.token.as_deref(), Some("file-token"));
        assert!(!config.insecure);
    }

    #[test]
    fn test_missing_context_or_token() {
        let text = KUBECONFIG.replace(
            "current-context: sandbox/api-example-com:6443/jane",
            "current-context: gone",
        );
        assert!(matches!(
            parse(&text).into_cluster_config(Path::new("/")),
            Err(ClusterError::Config(_))
        ));

        let text = KUBECONFIG.replace("    token: sha256~abc", "    username: jane");
        assert!(matches!(
            parse(&text).into_cluster_config(Path::new("/")),
            Err(ClusterError::Config(_))
        ));
    }

    #[test]
    fn test_is_kubeconfig() {
        assert!(is_kubeconfig(&serde_yaml::from_str(KUBECONFIG).unwrap()));
        assert!(!is_kubeconfig(
            &serde_yaml::from_str(r#"{"server": "https://api.example.com"}"#).unwrap()
        ));
    }
}
