//! Readiness waits
//!
//! Every wait has the same shape: observe a stream of state changes until a
//! predicate holds, the stream reports a failure, or time runs out. Objects
//! with a watch API feed [`observe_until`] directly; things that can only be
//! polled, like the HTTP endpoint of the server, go through [`poll_events`]
//! first.

use std::future::Future;
use std::time::Duration;

use futures::{future, stream, Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::control_plane::ControlPlane;
use crate::error::{ClusterError, Result};
use crate::resource::{Condition, Resource, ResourceKind, WatchEvent};

/// How long a watch based wait lasts
pub const WATCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Number of attempts of a polling wait
pub const PROBE_ATTEMPTS: u32 = 60;

/// Pause between two attempts of a polling wait
pub const PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Bound for a single HTTP probe
const PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Something to wait for: an object, and the predicate telling when it is
/// usable
#[derive(Debug, Clone)]
pub struct ReadinessTarget {
    pub kind: ResourceKind,
    pub name: String,
    pub predicate: fn(&Resource) -> bool,
    pub timeout: Duration,
}

impl ReadinessTarget {
    /// A pod with a `Ready` condition set to true
    pub fn pod(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Pod,
            name: name.into(),
            predicate: is_pod_ready,
            timeout: WATCH_TIMEOUT,
        }
    }

    /// A route admitted by every router that exposes it
    pub fn route(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Route,
            name: name.into(),
            predicate: is_route_admitted,
            timeout: WATCH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn description(&self) -> String {
        format!("{} '{}'", self.kind, self.name)
    }
}

/// Consume `events` until `predicate` accepts an added or modified object.
///
/// Fails with `Watch` when the object is deleted or the stream reports an
/// error, and with `Timeout` when `timeout` elapses or the stream ends first.
pub async fn observe_until<T, S, P>(
    what: &str,
    events: S,
    timeout: Duration,
    mut predicate: P,
) -> Result<T>
where
    S: Stream<Item = Result<WatchEvent<T>>>,
    P: FnMut(&T) -> bool,
{
    let observe = async {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            let event = event.map_err(|e| ClusterError::watch(what, e.to_string()))?;
            debug!("Received '{}' event for {}", event.type_name(), what);
            match event {
                WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                    if predicate(&object) {
                        debug!("{} is ready now", what);
                        return Ok(object);
                    }
                }
                WatchEvent::Deleted(_) => {
                    return Err(ClusterError::watch(
                        what,
                        "it was deleted while waiting for it to be ready",
                    ));
                }
                WatchEvent::Error(message) => {
                    return Err(ClusterError::watch(what, message));
                }
            }
        }
        Err(timeout_error(what, timeout))
    };

    tokio::time::timeout(timeout, observe)
        .await
        .map_err(|_| timeout_error(what, timeout))?
}

fn timeout_error(what: &str, timeout: Duration) -> ClusterError {
    ClusterError::Timeout {
        what: what.to_string(),
        seconds: timeout.as_secs(),
    }
}

/// Turn a polling probe into an event stream: `attempts` observations spaced
/// by `interval`, each reported as a modification. A probe error ends the
/// wait.
pub fn poll_events<T, F, Fut>(
    attempts: u32,
    interval: Duration,
    probe: F,
) -> impl Stream<Item = Result<WatchEvent<T>>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    stream::unfold((0_u32, probe), move |(attempt, mut probe)| async move {
        if attempt >= attempts {
            return None;
        }
        if attempt > 0 {
            tokio::time::sleep(interval).await;
        }
        let event = probe().await.map(WatchEvent::Modified);
        Some((event, (attempt + 1, probe)))
    })
}

/// Watch an object until its readiness predicate holds
pub async fn await_ready(
    plane: &dyn ControlPlane,
    namespace: &str,
    target: &ReadinessTarget,
) -> Result<Resource> {
    let what = target.description();
    debug!("Waiting for {} to be ready", what);
    let events = plane
        .watch(target.kind, Some(namespace), &target.name, target.timeout)
        .await?;
    let name = target.name.clone();
    let events = events.filter(move |event| {
        let relevant = match event {
            Ok(event) => event.object().map_or(true, |object| object.name() == name),
            Err(_) => true,
        };
        future::ready(relevant)
    });
    observe_until(&what, events, target.timeout, target.predicate).await
}

/// Wait till the given pod is ready
pub async fn wait_for_pod(
    plane: &dyn ControlPlane,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<Resource> {
    await_ready(plane, namespace, &ReadinessTarget::pod(name).with_timeout(timeout)).await
}

/// Wait till the given route is admitted
pub async fn wait_for_route(
    plane: &dyn ControlPlane,
    namespace: &str,
    name: &str,
    timeout: Duration,
) -> Result<Resource> {
    await_ready(plane, namespace, &ReadinessTarget::route(name).with_timeout(timeout)).await
}

/// Result of one HTTP probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// The connection failed
    Unreachable,
    Responded(StatusCode),
}

/// Wait till the backend behind `address` answers with something other than
/// 503, the status the router returns while the backend isn't available.
pub async fn wait_for_server(
    client: &Client,
    address: &str,
    attempts: u32,
    interval: Duration,
) -> Result<StatusCode> {
    let what = format!("server '{}'", address);
    debug!("Waiting for {} to respond", what);
    let events = poll_events(attempts, interval, || probe_server(client, address));
    let ceiling = (interval + PROBE_REQUEST_TIMEOUT) * attempts.max(1);
    match observe_until(&what, events, ceiling, is_server_responding).await? {
        Probe::Responded(status) => Ok(status),
        Probe::Unreachable => Err(ClusterError::watch(what, "server is unreachable")),
    }
}

async fn probe_server(client: &Client, address: &str) -> Result<Probe> {
    debug!("Checking if server '{}' is responding", address);
    match client
        .get(address)
        .timeout(PROBE_REQUEST_TIMEOUT)
        .send()
        .await
    {
        Ok(response) => {
            debug!(
                "Server '{}' responded with status code {}",
                address,
                response.status()
            );
            Ok(Probe::Responded(response.status()))
        }
        Err(e) if e.is_builder() => Err(ClusterError::transport_with_source(
            format!("can't build request for '{}'", address),
            e,
        )),
        Err(e) => {
            debug!("Server '{}' isn't responding: {}", address, e);
            Ok(Probe::Unreachable)
        }
    }
}

/// Whether the pod has a `Ready` condition with status true
pub fn is_pod_ready(pod: &Resource) -> bool {
    pod.decode::<Vec<Condition>>(&["status", "conditions"])
        .is_some_and(|conditions| conditions.iter().any(|c| c.holds("Ready")))
}

/// Whether the route has at least one ingress and all its ingresses are
/// admitted
pub fn is_route_admitted(route: &Resource) -> bool {
    let Some(ingresses) = route.field(&["status", "ingress"]).and_then(Value::as_array) else {
        return false;
    };
    !ingresses.is_empty()
        && ingresses.iter().all(|ingress| {
            ingress
                .get("conditions")
                .and_then(|value| Vec::<Condition>::deserialize(value).ok())
                .is_some_and(|conditions| conditions.iter().any(|c| c.holds("Admitted")))
        })
}

/// Whether the probe reached the real backend
pub fn is_server_responding(probe: &Probe) -> bool {
    matches!(probe, Probe::Responded(status) if *status != StatusCode::SERVICE_UNAVAILABLE)
}
