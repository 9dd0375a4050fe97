//! In-memory control plane for tests

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::control_plane::{ControlPlane, WatchStream};
use crate::error::{ClusterError, Result};
use crate::resource::{DeleteOptions, Resource, ResourceKind, WatchEvent};

type Key = (ResourceKind, Option<String>, String);

/// Call recorded by [`MemoryControlPlane`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create {
        kind: ResourceKind,
        namespace: Option<String>,
        name: String,
    },
    Delete {
        kind: ResourceKind,
        namespace: Option<String>,
        name: String,
        grace_period_seconds: Option<i64>,
    },
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Key, Value>,
    operations: Vec<Operation>,
    failing_creates: HashSet<ResourceKind>,
}

/// Control plane that keeps objects in a map and publishes changes to
/// watchers. Nothing reconciles the objects: tests move them to the state
/// they need with [`MemoryControlPlane::replace`] or
/// [`MemoryControlPlane::set_status`].
pub struct MemoryControlPlane {
    inner: Mutex<Inner>,
    events: broadcast::Sender<(Key, WatchEvent<Resource>)>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Make every create of the given kind fail with a 403
    pub fn fail_creates(&self, kind: ResourceKind) {
        self.lock().failing_creates.insert(kind);
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    /// Names of the objects of one kind that were deleted, in order
    pub fn deleted(&self, kind: ResourceKind) -> Vec<String> {
        self.lock()
            .operations
            .iter()
            .filter_map(|operation| match operation {
                Operation::Delete { kind: k, name, .. } if *k == kind => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Names of the objects of one kind that were created, in order
    pub fn created(&self, kind: ResourceKind) -> Vec<String> {
        self.lock()
            .operations
            .iter()
            .filter_map(|operation| match operation {
                Operation::Create { kind: k, name, .. } if *k == kind => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn contains(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> bool {
        self.lock().objects.contains_key(&key(kind, namespace, name))
    }

    pub fn object(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Option<Value> {
        self.lock().objects.get(&key(kind, namespace, name)).cloned()
    }

    /// Store a new version of an existing object and notify watchers
    pub fn replace(&self, kind: ResourceKind, namespace: Option<&str>, object: Value) -> Result<()> {
        let name = object_name(&object)?;
        let key = key(kind, namespace, &name);
        {
            let mut inner = self.lock();
            if !inner.objects.contains_key(&key) {
                return Err(ClusterError::NotFound { kind, name });
            }
            inner.objects.insert(key.clone(), object.clone());
        }
        self.publish(key, WatchEvent::Modified(Resource::new(kind, object)));
        Ok(())
    }

    /// Overwrite the status of an existing object and notify watchers
    pub fn set_status(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        status: Value,
    ) -> Result<()> {
        let mut object = self
            .object(kind, namespace, name)
            .ok_or_else(|| ClusterError::NotFound {
                kind,
                name: name.to_string(),
            })?;
        object["status"] = status;
        self.replace(kind, namespace, object)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, key: Key, event: WatchEvent<Resource>) {
        // No receivers is fine, nobody is watching
        let _ = self.events.send((key, event));
    }
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

fn key(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Key {
    let namespace = if kind.is_namespaced() {
        namespace.map(str::to_string)
    } else {
        None
    };
    (kind, namespace, name.to_string())
}

fn object_name(object: &Value) -> Result<String> {
    object["metadata"]["name"]
        .as_str()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ClusterError::InvalidInput("object has no name".to_string()))
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn create(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        object: Value,
    ) -> Result<Resource> {
        let name = object_name(&object)?;
        let key = key(kind, namespace, &name);
        {
            let mut inner = self.lock();
            inner.operations.push(Operation::Create {
                kind,
                namespace: key.1.clone(),
                name: name.clone(),
            });
            if inner.failing_creates.contains(&kind) {
                return Err(ClusterError::Api {
                    operation: "create",
                    kind,
                    name,
                    status: 403,
                    message: "forbidden".to_string(),
                });
            }
            if inner.objects.contains_key(&key) {
                return Err(ClusterError::AlreadyExists { kind, name });
            }
            inner.objects.insert(key.clone(), object.clone());
        }
        let resource = Resource::new(kind, object);
        self.publish(key, WatchEvent::Added(resource.clone()));
        Ok(resource)
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Resource> {
        self.object(kind, namespace, name)
            .map(|object| Resource::new(kind, object))
            .ok_or_else(|| ClusterError::NotFound {
                kind,
                name: name.to_string(),
            })
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        options: DeleteOptions,
    ) -> Result<()> {
        let key = key(kind, namespace, name);
        let removed = {
            let mut inner = self.lock();
            inner.operations.push(Operation::Delete {
                kind,
                namespace: key.1.clone(),
                name: name.to_string(),
                grace_period_seconds: options.grace_period_seconds,
            });
            let object = inner.objects.remove(&key).ok_or_else(|| ClusterError::NotFound {
                kind,
                name: name.to_string(),
            })?;
            let mut removed = vec![(key, Resource::new(kind, object))];
            // Deleting a project takes everything inside it along
            if kind == ResourceKind::Project {
                let contained: Vec<Key> = inner
                    .objects
                    .keys()
                    .filter(|(_, ns, _)| ns.as_deref() == Some(name))
                    .cloned()
                    .collect();
                for contained_key in contained {
                    if let Some(object) = inner.objects.remove(&contained_key) {
                        let resource = Resource::new(contained_key.0, object);
                        removed.push((contained_key, resource));
                    }
                }
            }
            removed
        };
        for (key, resource) in removed {
            self.publish(key, WatchEvent::Deleted(resource));
        }
        Ok(())
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        timeout: Duration,
    ) -> Result<WatchStream> {
        let wanted = key(kind, namespace, name);
        // Subscribe before reading the current state so no change is lost
        let receiver = self.events.subscribe();
        let initial: Vec<Result<WatchEvent<Resource>>> = self
            .object(kind, namespace, name)
            .map(|object| Ok(WatchEvent::Added(Resource::new(kind, object))))
            .into_iter()
            .collect();

        let changes = stream::unfold(receiver, move |mut receiver| {
            let wanted = wanted.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok((key, event)) if key == wanted => return Some((Ok(event), receiver)),
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream::iter(initial)
            .chain(changes)
            .take_until(tokio::time::sleep(timeout))
            .boxed())
    }
}
