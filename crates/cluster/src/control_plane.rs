//! Control plane interface
//!
//! Defines the four operations the sandbox needs from the cluster, for every
//! resource kind: create, get, delete and watch.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::resource::{DeleteOptions, Resource, ResourceKind, WatchEvent};

/// Stream of change notifications for one object
pub type WatchStream = BoxStream<'static, Result<WatchEvent<Resource>>>;

/// Declarative resource API of the cluster
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create an object. Fails with `AlreadyExists` if the name is taken.
    async fn create(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        object: Value,
    ) -> Result<Resource>;

    /// Get the current state of an object
    async fn get(&self, kind: ResourceKind, namespace: Option<&str>, name: &str)
        -> Result<Resource>;

    /// Delete an object. Fails with `NotFound` if it doesn't exist.
    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        options: DeleteOptions,
    ) -> Result<()>;

    /// Watch one object. The stream starts with an `Added` event when the
    /// object already exists and ends once `timeout` elapses.
    async fn watch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        timeout: Duration,
    ) -> Result<WatchStream>;
}

/// Create an object, treating "already exists" as success
pub async fn ensure(
    plane: &dyn ControlPlane,
    kind: ResourceKind,
    namespace: Option<&str>,
    object: Value,
) -> Result<()> {
    match plane.create(kind, namespace, object).await {
        Ok(resource) => {
            debug!("Created {} '{}'", kind, resource.name());
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            debug!("{}", e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Delete an object, treating "not found" as already clean. Returns whether
/// something was deleted.
pub async fn delete_if_present(
    plane: &dyn ControlPlane,
    kind: ResourceKind,
    namespace: Option<&str>,
    name: &str,
    options: DeleteOptions,
) -> Result<bool> {
    match plane.delete(kind, namespace, name, options).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => {
            debug!("{} '{}' was already gone", kind, name);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClusterError;
    use crate::memory::MemoryControlPlane;
    use serde_json::json;

    #[tokio::test]
    async fn test_ensure_ignores_already_exists() {
        let plane = MemoryControlPlane::new();
        let account = json!({"metadata": {"name": "server"}});

        ensure(&plane, ResourceKind::ServiceAccount, Some("ns"), account.clone())
            .await
            .unwrap();
        ensure(&plane, ResourceKind::ServiceAccount, Some("ns"), account)
            .await
            .unwrap();

        assert!(plane.contains(ResourceKind::ServiceAccount, Some("ns"), "server"));
    }

    #[tokio::test]
    async fn test_ensure_propagates_other_errors() {
        let plane = MemoryControlPlane::new();
        plane.fail_creates(ResourceKind::Pod);

        let result = ensure(
            &plane,
            ResourceKind::Pod,
            Some("ns"),
            json!({"metadata": {"name": "server"}}),
        )
        .await;
        assert!(matches!(result, Err(ClusterError::Api { status: 403, .. })));
    }

    #[tokio::test]
    async fn test_delete_if_present() {
        let plane = MemoryControlPlane::new();
        plane
            .create(
                ResourceKind::Project,
                None,
                json!({"metadata": {"name": "sandbox-test"}}),
            )
            .await
            .unwrap();

        let deleted = delete_if_present(
            &plane,
            ResourceKind::Project,
            None,
            "sandbox-test",
            DeleteOptions::default(),
        )
        .await
        .unwrap();
        assert!(deleted);

        let deleted = delete_if_present(
            &plane,
            ResourceKind::Project,
            None,
            "sandbox-test",
            DeleteOptions::default(),
        )
        .await
        .unwrap();
        assert!(!deleted);
    }
}
