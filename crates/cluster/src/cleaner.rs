//! Self-destruct timer for sandbox environments
//!
//! The cleaner runs inside the environment it guards. Once started it waits
//! for the configured time and then deletes the environment, unless it is
//! stopped first. The runner stops it during a normal teardown; if the runner
//! dies the timer fires and nothing is left behind.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{read_namespace_file, SERVICE_ACCOUNT_DIR};
use crate::control_plane::{delete_if_present, ControlPlane};
use crate::error::{ClusterError, Result};
use crate::resource::{DeleteOptions, ResourceKind};

/// Grace period given to the objects of the environment when it is deleted
pub const GRACE_PERIOD_SECONDS: i64 = 1;

/// Lifecycle of a [`Cleaner`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanerState {
    /// Built, not started
    Idle,
    /// Deadline armed
    Armed,
    /// Deadline expired, deletion of the environment attempted
    Fired,
    /// Cancelled before the deadline
    Stopped,
}

impl CleanerState {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Fired | Self::Stopped)
    }
}

/// Builder for [`Cleaner`]
pub struct CleanerBuilder {
    wait: Duration,
    namespace: Option<String>,
    namespace_file: PathBuf,
    plane: Option<Arc<dyn ControlPlane>>,
}

impl CleanerBuilder {
    fn new() -> Self {
        Self {
            wait: Duration::ZERO,
            namespace: None,
            namespace_file: PathBuf::from(SERVICE_ACCOUNT_DIR).join("namespace"),
            plane: None,
        }
    }

    /// Time to wait before deleting the environment
    pub fn wait(mut self, value: Duration) -> Self {
        self.wait = value;
        self
    }

    /// Name of the environment to delete. When not set it is read from the
    /// namespace file of the pod.
    pub fn namespace(mut self, value: impl Into<String>) -> Self {
        self.namespace = Some(value.into());
        self
    }

    pub fn namespace_file(mut self, value: impl Into<PathBuf>) -> Self {
        self.namespace_file = value.into();
        self
    }

    pub fn control_plane(mut self, value: Arc<dyn ControlPlane>) -> Self {
        self.plane = Some(value);
        self
    }

    /// Create the cleaner. It isn't started; call [`Cleaner::start`] for that.
    pub fn build(self) -> Result<Cleaner> {
        if self.wait.is_zero() {
            return Err(ClusterError::InvalidInput(
                "wait time can't be zero".to_string(),
            ));
        }
        let plane = self.plane.ok_or_else(|| {
            ClusterError::InvalidInput("control plane is mandatory".to_string())
        })?;
        let namespace = match self.namespace {
            Some(namespace) if !namespace.trim().is_empty() => namespace.trim().to_string(),
            Some(_) => {
                return Err(ClusterError::InvalidInput(
                    "namespace can't be empty".to_string(),
                ))
            }
            None => read_namespace_file(&self.namespace_file)?,
        };

        let (state_tx, state_rx) = watch::channel(CleanerState::Idle);
        Ok(Cleaner {
            wait: self.wait,
            plane,
            namespace,
            state_tx: Some(state_tx),
            state_rx,
            stop_tx: None,
            task: None,
        })
    }
}

/// One-shot, cancellable deadline that deletes the environment
pub struct Cleaner {
    wait: Duration,
    plane: Arc<dyn ControlPlane>,
    namespace: String,
    /// Held until `start` hands it to the timer task
    state_tx: Option<watch::Sender<CleanerState>>,
    state_rx: watch::Receiver<CleanerState>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Cleaner {
    pub fn builder() -> CleanerBuilder {
        CleanerBuilder::new()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    pub fn state(&self) -> CleanerState {
        *self.state_rx.borrow()
    }

    /// Arm the deadline
    pub fn start(&mut self) -> Result<()> {
        let state_tx = self.state_tx.take().ok_or_else(|| {
            ClusterError::InvalidInput("cleaner was already started or stopped".to_string())
        })?;
        let (stop_tx, stop_rx) = oneshot::channel();
        state_tx.send_replace(CleanerState::Armed);
        info!(
            "Project '{}' will be deleted in {:?} unless the cleaner is stopped",
            self.namespace, self.wait
        );

        let plane = Arc::clone(&self.plane);
        let namespace = self.namespace.clone();
        let wait = self.wait;
        self.task = Some(tokio::spawn(async move {
            tokio::select! {
                // Resolves on `stop` and also when the sender is dropped
                _ = stop_rx => {
                    state_tx.send_replace(CleanerState::Stopped);
                    info!("Cleaner stopped, project '{}' will be preserved", namespace);
                }
                _ = tokio::time::sleep(wait) => {
                    state_tx.send_replace(CleanerState::Fired);
                    delete_project(plane.as_ref(), &namespace).await;
                }
            }
        }));
        self.stop_tx = Some(stop_tx);
        Ok(())
    }

    /// Cancel the deadline if it didn't fire yet, and wait till the timer
    /// task is done. Stopping a fired cleaner doesn't undo anything.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(state_tx) = self.state_tx.take() {
            state_tx.send_replace(CleanerState::Stopped);
            return Ok(());
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            // The receiver is gone if the deadline already fired
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| {
                ClusterError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("cleaner task failed: {}", e),
                ))
            })?;
        }
        Ok(())
    }

    /// Wait till the deadline fires or the cleaner is stopped
    pub async fn resolved(&self) -> CleanerState {
        let mut state_rx = self.state_rx.clone();
        let resolved = match state_rx.wait_for(CleanerState::is_resolved).await {
            Ok(state) => Some(*state),
            // Sender gone, the last published state is final
            Err(_) => None,
        };
        resolved.unwrap_or_else(|| *state_rx.borrow())
    }

    /// Release the signaling channel. A pending deadline is cancelled. The
    /// cleaner is consumed, so it can't be stopped afterwards.
    pub fn destroy(mut self) {
        self.stop_tx.take();
        self.state_tx.take();
    }
}

async fn delete_project(plane: &dyn ControlPlane, namespace: &str) {
    info!("Deleting project '{}'", namespace);
    match delete_if_present(
        plane,
        ResourceKind::Project,
        None,
        namespace,
        DeleteOptions::grace(GRACE_PERIOD_SECONDS),
    )
    .await
    {
        Ok(true) => info!("Project '{}' has been deleted", namespace),
        Ok(false) => info!("Project '{}' was already deleted", namespace),
        Err(e) => error!("Can't delete project '{}': {}", namespace, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryControlPlane, Operation};
    use serde_json::json;
    use tempfile::TempDir;

    async fn plane_with_project(name: &str) -> Arc<MemoryControlPlane> {
        let plane = Arc::new(MemoryControlPlane::new());
        plane
            .create(ResourceKind::Project, None, json!({"metadata": {"name": name}}))
            .await
            .unwrap();
        plane
    }

    fn cleaner(plane: &Arc<MemoryControlPlane>, wait: Duration) -> Cleaner {
        Cleaner::builder()
            .wait(wait)
            .namespace("sandbox-test")
            .control_plane(Arc::clone(plane) as Arc<dyn ControlPlane>)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_rejects_zero_wait() {
        let plane: Arc<dyn ControlPlane> = Arc::new(MemoryControlPlane::new());
        let result = Cleaner::builder()
            .namespace("sandbox-test")
            .control_plane(plane)
            .build();
        assert!(matches!(result, Err(ClusterError::InvalidInput(_))));
    }

    #[test]
    fn test_build_reads_namespace_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("namespace");
        std::fs::write(&path, "sandbox-jane-42").unwrap();
        let plane: Arc<dyn ControlPlane> = Arc::new(MemoryControlPlane::new());

        let cleaner = Cleaner::builder()
            .wait(Duration::from_secs(60))
            .namespace_file(&path)
            .control_plane(plane)
            .build()
            .unwrap();
        assert_eq!(cleaner.namespace(), "sandbox-jane-42");
        assert_eq!(cleaner.state(), CleanerState::Idle);
    }

    #[test]
    fn test_build_fails_without_identity() {
        let dir = TempDir::new().unwrap();
        let plane: Arc<dyn ControlPlane> = Arc::new(MemoryControlPlane::new());

        let result = Cleaner::builder()
            .wait(Duration::from_secs(60))
            .namespace_file(dir.path().join("missing"))
            .control_plane(plane)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_wait() {
        let plane = plane_with_project("sandbox-test").await;
        let mut cleaner = cleaner(&plane, Duration::from_secs(60));
        let started = tokio::time::Instant::now();

        cleaner.start().unwrap();
        assert_eq!(cleaner.state(), CleanerState::Armed);

        assert_eq!(cleaner.resolved().await, CleanerState::Fired);
        assert!(started.elapsed() >= Duration::from_secs(60));
        cleaner.stop().await.unwrap();

        assert_eq!(cleaner.state(), CleanerState::Fired);
        assert_eq!(plane.deleted(ResourceKind::Project), vec!["sandbox-test"]);
        assert!(!plane.contains(ResourceKind::Project, None, "sandbox-test"));
        assert!(plane.operations().contains(&Operation::Delete {
            kind: ResourceKind::Project,
            namespace: None,
            name: "sandbox-test".to_string(),
            grace_period_seconds: Some(GRACE_PERIOD_SECONDS),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_deadline_prevents_deletion() {
        let plane = plane_with_project("sandbox-test").await;
        let mut cleaner = cleaner(&plane, Duration::from_secs(60));

        cleaner.start().unwrap();
        tokio::time::sleep(Duration::from_secs(59)).await;
        cleaner.stop().await.unwrap();
        assert_eq!(cleaner.state(), CleanerState::Stopped);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(plane.deleted(ResourceKind::Project).is_empty());
        assert!(plane.contains(ResourceKind::Project, None, "sandbox-test"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_without_stop_cancels() {
        let plane = plane_with_project("sandbox-test").await;
        let mut cleaner = cleaner(&plane, Duration::from_secs(60));
        cleaner.start().unwrap();

        let mut state_rx = cleaner.state_rx.clone();
        cleaner.destroy();
        let state = *state_rx.wait_for(CleanerState::is_resolved).await.unwrap();
        assert_eq!(state, CleanerState::Stopped);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(plane.deleted(ResourceKind::Project).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fired_with_missing_project_is_not_retried() {
        let plane = Arc::new(MemoryControlPlane::new());
        let mut cleaner = cleaner(&plane, Duration::from_secs(1));

        cleaner.start().unwrap();
        assert_eq!(cleaner.resolved().await, CleanerState::Fired);
        cleaner.stop().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(plane.deleted(ResourceKind::Project).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_reports_stop() {
        let plane = plane_with_project("sandbox-test").await;

        let mut idle = cleaner(&plane, Duration::from_secs(60));
        idle.stop().await.unwrap();
        assert_eq!(idle.resolved().await, CleanerState::Stopped);

        let mut armed = cleaner(&plane, Duration::from_secs(60));
        armed.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        armed.stop().await.unwrap();
        assert_eq!(armed.resolved().await, CleanerState::Stopped);
        assert!(plane.deleted(ResourceKind::Project).is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_stop_when_idle() {
        let plane = plane_with_project("sandbox-test").await;

        let mut idle = cleaner(&plane, Duration::from_secs(60));
        idle.stop().await.unwrap();
        assert_eq!(idle.state(), CleanerState::Stopped);
        assert!(idle.start().is_err());

        let mut armed = cleaner(&plane, Duration::from_secs(60));
        armed.start().unwrap();
        assert!(armed.start().is_err());
        armed.stop().await.unwrap();
    }
}
