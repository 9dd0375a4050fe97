//! Resource kinds and snapshots exchanged with the control plane

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Kinds of objects that make up a sandbox environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// The environment itself, an OpenShift project
    Project,
    ServiceAccount,
    RoleBinding,
    Pod,
    Service,
    Route,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::ServiceAccount => "service account",
            Self::RoleBinding => "role binding",
            Self::Pod => "pod",
            Self::Service => "service",
            Self::Route => "route",
        }
    }

    /// Whether objects of this kind live inside a namespace
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, Self::Project)
    }

    /// Base path of the API group serving this kind
    pub(crate) fn api_path(&self) -> &'static str {
        match self {
            Self::Project => "/apis/project.openshift.io/v1",
            Self::ServiceAccount | Self::Pod | Self::Service => "/api/v1",
            Self::RoleBinding => "/apis/rbac.authorization.k8s.io/v1",
            Self::Route => "/apis/route.openshift.io/v1",
        }
    }

    pub(crate) fn plural(&self) -> &'static str {
        match self {
            Self::Project => "projects",
            Self::ServiceAccount => "serviceaccounts",
            Self::RoleBinding => "rolebindings",
            Self::Pod => "pods",
            Self::Service => "services",
            Self::Route => "routes",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of an object as returned by the control plane
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    kind: ResourceKind,
    object: Value,
}

impl Resource {
    pub fn new(kind: ResourceKind, object: Value) -> Self {
        Self { kind, object }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        self.object["metadata"]["name"].as_str().unwrap_or_default()
    }

    pub fn object(&self) -> &Value {
        &self.object
    }

    pub fn into_object(self) -> Value {
        self.object
    }

    /// Look up a nested field, e.g. `field(&["spec", "host"])`
    pub fn field(&self, path: &[&str]) -> Option<&Value> {
        path.iter()
            .try_fold(&self.object, |value, segment| value.get(*segment))
    }

    /// Decode a nested field into a typed view, `None` when it is missing or
    /// doesn't have the expected shape
    pub fn decode<T: DeserializeOwned>(&self, path: &[&str]) -> Option<T> {
        self.field(path)
            .and_then(|value| T::deserialize(value).ok())
    }
}

/// Condition entry shared by pod and route status
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: String,
}

impl Condition {
    /// Whether this is a condition of the given type with status `True`
    pub fn holds(&self, kind: &str) -> bool {
        self.kind == kind && self.status == "True"
    }
}

/// Change notification observed while watching an object
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// The control plane reported an error inside the stream
    Error(String),
}

impl<T> WatchEvent<T> {
    pub fn object(&self) -> Option<&T> {
        match self {
            Self::Added(object) | Self::Modified(object) | Self::Deleted(object) => Some(object),
            Self::Error(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Added(_) => "ADDED",
            Self::Modified(_) => "MODIFIED",
            Self::Deleted(_) => "DELETED",
            Self::Error(_) => "ERROR",
        }
    }
}

/// Options for delete calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub grace_period_seconds: Option<i64>,
}

impl DeleteOptions {
    pub fn grace(seconds: i64) -> Self {
        Self {
            grace_period_seconds: Some(seconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_accessors() {
        let route = Resource::new(
            ResourceKind::Route,
            json!({
                "metadata": {"name": "server"},
                "spec": {"host": "server-sandbox.apps.example.com"}
            }),
        );

        assert_eq!(route.name(), "server");
        assert_eq!(
            route.field(&["spec", "host"]).and_then(Value::as_str),
            Some("server-sandbox.apps.example.com")
        );
        assert!(route.field(&["spec", "tls"]).is_none());
    }

    #[test]
    fn test_decode_conditions() {
        let pod = Resource::new(
            ResourceKind::Pod,
            json!({
                "metadata": {"name": "server"},
                "status": {"conditions": [
                    {"type": "Initialized", "status": "True"},
                    {"type": "Ready", "status": "False"}
                ]}
            }),
        );

        let conditions: Vec<Condition> = pod.decode(&["status", "conditions"]).unwrap();
        assert_eq!(conditions.len(), 2);
        assert!(conditions[0].holds("Initialized"));
        assert!(!conditions[1].holds("Ready"));
    }

    #[test]
    fn test_kind_paths() {
        assert_eq!(ResourceKind::Pod.api_path(), "/api/v1");
        assert_eq!(ResourceKind::Route.plural(), "routes");
        assert!(!ResourceKind::Project.is_namespaced());
        assert!(ResourceKind::RoleBinding.is_namespaced());
    }
}
