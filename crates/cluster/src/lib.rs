//! Cluster access for the sandbox
//!
//! This crate wraps everything that talks to the cluster control plane:
//! creating and deleting the objects that make up an environment, waiting
//! for them to become usable, and the timer that deletes an abandoned
//! environment.

pub mod cleaner;
mod config;
mod control_plane;
mod error;
mod http;
pub mod kubeconfig;
pub mod manifests;
#[cfg(any(test, feature = "test-util"))]
mod memory;
mod resource;
pub mod wait;

pub use cleaner::{Cleaner, CleanerBuilder, CleanerState};
pub use config::{build_http_client, read_namespace_file, ClusterConfig, SERVICE_ACCOUNT_DIR};
pub use control_plane::{delete_if_present, ensure, ControlPlane, WatchStream};
pub use error::{ClusterError, Result};
pub use http::HttpControlPlane;
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryControlPlane, Operation};
pub use resource::{Condition, DeleteOptions, Resource, ResourceKind, WatchEvent};
