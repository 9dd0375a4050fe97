//! Provisioning of the environment and execution of the test binaries

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use sandbox_cluster::{
    build_http_client, delete_if_present, ensure, manifests,
    wait::{self, PROBE_ATTEMPTS, PROBE_INTERVAL, WATCH_TIMEOUT},
    ClusterError, ControlPlane, DeleteOptions, Resource, ResourceKind,
};
use sandbox_core::{AuthToken, ExecutionRequest};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::binaries::{compile_binaries, find_binaries, scan_directories};
use crate::client::ServerClient;
use crate::error::{Result, RunnerError};

/// Default time after which an abandoned environment deletes itself
pub const DEFAULT_CLEANUP_DELAY: Duration = Duration::from_secs(60 * 60);

/// Bounds of the readiness waits done while provisioning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSettings {
    /// Ceiling of the watches on the server pod and route
    pub watch_timeout: Duration,
    /// Attempts to reach the server through the route
    pub probe_attempts: u32,
    pub probe_interval: Duration,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            watch_timeout: WATCH_TIMEOUT,
            probe_attempts: PROBE_ATTEMPTS,
            probe_interval: PROBE_INTERVAL,
        }
    }
}

/// Outcome of a batch of test binaries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Binaries found
    pub total: usize,
    /// Binaries that finished with a nonzero exit code
    pub failed: usize,
    /// Binaries that couldn't be read, and so were never sent
    pub skipped: usize,
}

impl RunSummary {
    /// True when every binary ran and exited with zero
    pub fn passed(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }
}

/// Builder for [`Runner`]
pub struct RunnerBuilder {
    directories: Vec<PathBuf>,
    recursive: bool,
    compile: bool,
    keep: bool,
    output: PathBuf,
    image: String,
    cleanup_delay: Duration,
    user: Option<String>,
    proxy: Option<String>,
    insecure: bool,
    plane: Option<Arc<dyn ControlPlane>>,
    wait: WaitSettings,
}

impl Default for RunnerBuilder {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            recursive: false,
            compile: true,
            keep: false,
            output: PathBuf::from("."),
            image: manifests::DEFAULT_IMAGE.to_string(),
            cleanup_delay: DEFAULT_CLEANUP_DELAY,
            user: None,
            proxy: None,
            insecure: false,
            plane: None,
            wait: WaitSettings::default(),
        }
    }
}

impl RunnerBuilder {
    pub fn directory(mut self, value: impl Into<PathBuf>) -> Self {
        self.directories.push(value.into());
        self
    }

    pub fn directories<I, P>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.directories.extend(values.into_iter().map(Into::into));
        self
    }

    /// Look for crate directories under the given ones
    pub fn recursive(mut self, value: bool) -> Self {
        self.recursive = value;
        self
    }

    /// Build the test binaries before running them. Enabled by default.
    pub fn compile(mut self, value: bool) -> Self {
        self.compile = value;
        self
    }

    /// Preserve the environment when done. No cleaner is deployed either.
    pub fn keep(mut self, value: bool) -> Self {
        self.keep = value;
        self
    }

    /// Where the test binaries are written and looked for, the current
    /// directory by default
    pub fn output(mut self, value: impl Into<PathBuf>) -> Self {
        self.output = value.into();
        self
    }

    /// Image used for the server and cleaner pods
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    pub fn cleanup_delay(mut self, value: Duration) -> Self {
        self.cleanup_delay = value;
        self
    }

    /// User name that goes into the name of the environment
    pub fn user(mut self, value: impl Into<String>) -> Self {
        self.user = Some(value.into());
        self
    }

    /// Proxy for the connection to the server
    pub fn proxy(mut self, value: Option<String>) -> Self {
        self.proxy = value;
        self
    }

    /// Accept certificates of the server signed by unknown authorities
    pub fn insecure(mut self, value: bool) -> Self {
        self.insecure = value;
        self
    }

    pub fn control_plane(mut self, value: Arc<dyn ControlPlane>) -> Self {
        self.plane = Some(value);
        self
    }

    pub fn wait_settings(mut self, value: WaitSettings) -> Self {
        self.wait = value;
        self
    }

    pub fn build(self) -> Result<Runner> {
        if self.directories.is_empty() {
            return Err(RunnerError::Validation(
                "at least one directory must be provided".to_string(),
            ));
        }
        if self.cleanup_delay.is_zero() {
            return Err(RunnerError::Validation(
                "cleanup delay can't be zero".to_string(),
            ));
        }
        let plane = self.plane.ok_or_else(|| {
            RunnerError::Validation("control plane is mandatory".to_string())
        })?;
        let client = build_http_client(self.proxy.as_deref(), self.insecure, None)?;
        let user = self.user.unwrap_or_else(current_user);

        Ok(Runner {
            directories: self.directories,
            recursive: self.recursive,
            compile: self.compile,
            keep: self.keep,
            output: self.output,
            image: self.image,
            cleanup_delay: self.cleanup_delay,
            user,
            plane,
            client,
            wait: self.wait,
        })
    }
}

/// Runs test binaries in a freshly provisioned environment
pub struct Runner {
    directories: Vec<PathBuf>,
    recursive: bool,
    compile: bool,
    keep: bool,
    output: PathBuf,
    image: String,
    cleanup_delay: Duration,
    user: String,
    plane: Arc<dyn ControlPlane>,
    client: Client,
    wait: WaitSettings,
}

impl Runner {
    pub fn builder() -> RunnerBuilder {
        RunnerBuilder::default()
    }

    /// Find the test directories, build them if needed, and list the
    /// resulting binaries. When building, only the binaries of this build
    /// are listed, not the ones left in the output directory by others.
    pub async fn binaries(&self) -> Result<Vec<PathBuf>> {
        let directories = scan_directories(&self.directories, self.recursive)?;
        if self.compile {
            return compile_binaries(&directories, &self.output).await;
        }
        find_binaries(&self.output)
    }

    /// Create the environment and wait till its server can take requests.
    ///
    /// If something fails after the environment was created, it is deleted
    /// again, unless it has to be preserved.
    pub async fn provision(&self) -> Result<Session> {
        let environment = environment_name(&self.user, chrono::Utc::now().timestamp());
        let token = AuthToken::generate();

        info!("Creating project '{}'", environment);
        let owned = match self
            .plane
            .create(
                ResourceKind::Project,
                None,
                manifests::project_request(&environment),
            )
            .await
        {
            Ok(_) => true,
            Err(e) if e.is_already_exists() => {
                warn!("Project '{}' already exists, will use it", environment);
                false
            }
            Err(e) => return Err(e.into()),
        };

        match self.deploy(&environment, &token, owned).await {
            Ok(endpoint) => {
                info!("Server is ready at '{}'", endpoint);
                Ok(Session {
                    client: ServerClient::new(self.client.clone(), endpoint, token),
                    environment,
                    owned,
                    keep: self.keep,
                    plane: Arc::clone(&self.plane),
                })
            }
            Err(e) => {
                if owned && !self.keep {
                    delete_environment(self.plane.as_ref(), &environment).await;
                }
                Err(e)
            }
        }
    }

    /// Create the objects of the environment. The cleaner only goes into
    /// projects created by this run and not preserved, the others outlive
    /// the run.
    async fn deploy(&self, environment: &str, token: &AuthToken, owned: bool) -> Result<String> {
        let plane = self.plane.as_ref();
        let namespace = Some(environment);

        if owned && !self.keep {
            info!(
                "Deploying cleaner, project will be deleted after {:?} at most",
                self.cleanup_delay
            );
            ensure_identity(plane, environment, manifests::CLEANER_APP).await?;
            ensure(
                plane,
                ResourceKind::Pod,
                namespace,
                manifests::cleaner_pod(&self.image, self.cleanup_delay),
            )
            .await?;
        }

        info!("Deploying server");
        ensure_identity(plane, environment, manifests::SERVER_APP).await?;
        ensure(
            plane,
            ResourceKind::Pod,
            namespace,
            manifests::server_pod(&self.image, token.expose()),
        )
        .await?;
        ensure(
            plane,
            ResourceKind::Service,
            namespace,
            manifests::server_service(),
        )
        .await?;
        ensure(
            plane,
            ResourceKind::Route,
            namespace,
            manifests::server_route(),
        )
        .await?;

        self.discover(environment).await
    }

    /// Resolve the address of the server once the pod is ready, the route
    /// is admitted and the server answers through it
    async fn discover(&self, environment: &str) -> Result<String> {
        let plane = self.plane.as_ref();
        wait::wait_for_pod(
            plane,
            environment,
            manifests::SERVER_APP,
            self.wait.watch_timeout,
        )
        .await?;
        let route = wait::wait_for_route(
            plane,
            environment,
            manifests::SERVER_APP,
            self.wait.watch_timeout,
        )
        .await?;

        let endpoint = route_endpoint(&route)?;
        wait::wait_for_server(
            &self.client,
            &endpoint,
            self.wait.probe_attempts,
            self.wait.probe_interval,
        )
        .await?;
        Ok(endpoint)
    }

    /// Build, provision, run every binary and tear the environment down
    pub async fn run<O, E>(&self, stdout: &mut O, stderr: &mut E) -> Result<RunSummary>
    where
        O: Write,
        E: Write,
    {
        let binaries = self.binaries().await?;
        let session = self.provision().await?;
        let result = session.run_all(&binaries, stdout, stderr).await;
        let teardown = session.teardown().await;
        let summary = result?;
        teardown?;
        Ok(summary)
    }
}

/// A provisioned environment with a live server
pub struct Session {
    environment: String,
    owned: bool,
    keep: bool,
    plane: Arc<dyn ControlPlane>,
    client: ServerClient,
}

impl Session {
    /// Name of the project that holds the environment
    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn endpoint(&self) -> &str {
        self.client.address()
    }

    /// Whether this session created the environment
    pub fn owns_environment(&self) -> bool {
        self.owned
    }

    /// Run the binaries one after the other, in name order, copying what
    /// they write to the given writers. A binary that fails counts as
    /// failed; a binary that can't be read is skipped. Transport and
    /// authentication errors stop the batch.
    pub async fn run_all<O, E>(
        &self,
        binaries: &[PathBuf],
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<RunSummary>
    where
        O: Write,
        E: Write,
    {
        let mut binaries = binaries.to_vec();
        binaries.sort();
        let mut summary = RunSummary {
            total: binaries.len(),
            ..Default::default()
        };

        for binary in &binaries {
            info!("Running test binary {:?}", binary);
            let data = match tokio::fs::read(binary).await {
                Ok(data) => data,
                Err(e) => {
                    error!("Can't read test binary from file {:?}: {}", binary, e);
                    summary.skipped += 1;
                    continue;
                }
            };

            let result = self.client.send(&ExecutionRequest::new(data)).await?;
            report_output(binary, "Output", &result.stdout, stdout)?;
            report_output(binary, "Error output", &result.stderr, stderr)?;
            info!(
                "Test binary {:?} finished with exit code {}",
                binary, result.exit_code
            );
            if !result.success() {
                summary.failed += 1;
            }
        }
        Ok(summary)
    }

    /// Delete the environment, unless it has to be preserved or this session
    /// didn't create it
    pub async fn teardown(self) -> Result<()> {
        if self.keep {
            info!("Project '{}' will be preserved", self.environment);
            return Ok(());
        }
        if !self.owned {
            info!(
                "Project '{}' wasn't created by this run, will not delete it",
                self.environment
            );
            return Ok(());
        }
        info!("Deleting project '{}'", self.environment);
        delete_if_present(
            self.plane.as_ref(),
            ResourceKind::Project,
            None,
            &self.environment,
            DeleteOptions::default(),
        )
        .await?;
        Ok(())
    }
}

fn report_output<W: Write>(binary: &Path, label: &str, data: &[u8], writer: &mut W) -> Result<()> {
    if data.is_empty() {
        info!("Test binary {:?} didn't produce {}", binary, label.to_lowercase());
        return Ok(());
    }
    info!("{} of test binary {:?} follows", label, binary);
    writer.write_all(data)?;
    writer.flush()?;
    Ok(())
}

async fn ensure_identity(plane: &dyn ControlPlane, environment: &str, app: &str) -> Result<()> {
    let namespace = Some(environment);
    ensure(
        plane,
        ResourceKind::ServiceAccount,
        namespace,
        manifests::service_account(app),
    )
    .await?;
    ensure(
        plane,
        ResourceKind::RoleBinding,
        namespace,
        manifests::admin_role_binding(app, environment),
    )
    .await?;
    Ok(())
}

async fn delete_environment(plane: &dyn ControlPlane, environment: &str) {
    info!("Deleting project '{}' after failed provisioning", environment);
    if let Err(e) = delete_if_present(
        plane,
        ResourceKind::Project,
        None,
        environment,
        DeleteOptions::default(),
    )
    .await
    {
        error!("Can't delete project '{}': {}", environment, e);
    }
}

/// External address of the server: `https` when the route terminates TLS
fn route_endpoint(route: &Resource) -> Result<String> {
    let host = route
        .field(&["spec", "host"])
        .and_then(Value::as_str)
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ClusterError::watch(format!("route '{}'", route.name()), "route has no host"))?;
    let tls = route
        .field(&["spec", "tls"])
        .is_some_and(|tls| !tls.is_null());
    let scheme = if tls { "https" } else { "http" };
    Ok(format!("{}://{}", scheme, host))
}

/// Name of a new environment: `sandbox-<user>-<unix seconds>`, reduced to
/// the characters allowed in a project name
fn environment_name(user: &str, timestamp: i64) -> String {
    let mut user: String = user
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    user = user.trim_matches('-').to_string();
    if user.is_empty() {
        user = "user".to_string();
    }
    format!("sandbox-{}-{}", user, timestamp)
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_cluster::MemoryControlPlane;
    use serde_json::json;

    #[test]
    fn test_environment_name() {
        assert_eq!(environment_name("jane", 1700000000), "sandbox-jane-1700000000");
        assert_eq!(environment_name("Jane.Doe", 1), "sandbox-jane-doe-1");
        assert_eq!(environment_name("", 1), "sandbox-user-1");
    }

    #[test]
    fn test_route_endpoint() {
        let secure = Resource::new(
            ResourceKind::Route,
            json!({"metadata": {"name": "server"}, "spec": {"host": "server.apps.example.com", "tls": {"termination": "edge"}}}),
        );
        assert_eq!(route_endpoint(&secure).unwrap(), "https://server.apps.example.com");

        let plain = Resource::new(
            ResourceKind::Route,
            json!({"metadata": {"name": "server"}, "spec": {"host": "127.0.0.1:8000"}}),
        );
        assert_eq!(route_endpoint(&plain).unwrap(), "http://127.0.0.1:8000");

        let pending = Resource::new(ResourceKind::Route, json!({"metadata": {"name": "server"}}));
        assert!(route_endpoint(&pending).is_err());
    }

    #[test]
    fn test_build_validation() {
        assert!(matches!(
            Runner::builder().build(),
            Err(RunnerError::Validation(_))
        ));

        let plane: Arc<dyn ControlPlane> = Arc::new(MemoryControlPlane::new());
        assert!(Runner::builder()
            .directory(".")
            .cleanup_delay(Duration::ZERO)
            .control_plane(Arc::clone(&plane))
            .build()
            .is_err());
        assert!(Runner::builder()
            .directory(".")
            .control_plane(plane)
            .build()
            .is_ok());
    }

    #[test]
    fn test_summary() {
        assert!(RunSummary::default().passed());
        assert!(!RunSummary {
            total: 2,
            failed: 1,
            skipped: 0
        }
        .passed());
        assert!(!RunSummary {
            total: 2,
            failed: 0,
            skipped: 1
        }
        .passed());
    }
}
