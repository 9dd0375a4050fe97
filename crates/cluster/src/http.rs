//! Control plane implementation speaking the Kubernetes/OpenShift REST API

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{build_http_client, ClusterConfig};
use crate::control_plane::{ControlPlane, WatchStream};
use crate::error::{ClusterError, Result};
use crate::resource::{DeleteOptions, Resource, ResourceKind, WatchEvent};

/// REST client for the cluster API server
pub struct HttpControlPlane {
    client: Client,
    server: String,
    token: Option<String>,
}

impl HttpControlPlane {
    pub fn new(config: &ClusterConfig) -> Result<Self> {
        let ca_pem = config.ca_pem()?;
        let client = build_http_client(config.proxy.as_deref(), config.insecure, ca_pem.as_deref())?;
        Ok(Self {
            client,
            server: config.server.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn collection_url(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<String> {
        if !kind.is_namespaced() {
            return Ok(format!("{}{}/{}", self.server, kind.api_path(), kind.plural()));
        }
        let namespace = namespace.ok_or_else(|| {
            ClusterError::InvalidInput(format!("a namespace is required for {} objects", kind))
        })?;
        Ok(format!(
            "{}{}/namespaces/{}/{}",
            self.server,
            kind.api_path(),
            namespace,
            kind.plural()
        ))
    }

    fn object_url(&self, kind: ResourceKind, namespace: Option<&str>, name: &str) -> Result<String> {
        Ok(format!("{}/{}", self.collection_url(kind, namespace)?, name))
    }

    /// Projects can't be created directly, regular users go through project
    /// requests
    fn create_url(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<String> {
        match kind {
            ResourceKind::Project => Ok(format!(
                "{}{}/projectrequests",
                self.server,
                kind.api_path()
            )),
            _ => self.collection_url(kind, namespace),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(
        &self,
        request: RequestBuilder,
        operation: &'static str,
        kind: ResourceKind,
        name: &str,
    ) -> Result<Response> {
        let response = self.authorize(request).send().await.map_err(|e| {
            ClusterError::transport_with_source(
                format!("can't {} {} '{}'", operation, kind, name),
                e,
            )
        })?;
        check_status(response, operation, kind, name).await
    }
}

/// Turn the status of a response into the matching error
async fn check_status(
    response: Response,
    operation: &'static str,
    kind: ResourceKind,
    name: &str,
) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let name = name.to_string();
    match status {
        StatusCode::CONFLICT if operation == "create" => {
            Err(ClusterError::AlreadyExists { kind, name })
        }
        StatusCode::NOT_FOUND => Err(ClusterError::NotFound { kind, name }),
        _ => {
            let body = response.text().await.unwrap_or_default();
            Err(ClusterError::Api {
                operation,
                kind,
                name,
                status: status.as_u16(),
                message: status_message(&body),
            })
        }
    }
}

/// Extract the human readable message from a `Status` body
fn status_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn create(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        object: Value,
    ) -> Result<Resource> {
        let name = object["metadata"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let url = self.create_url(kind, namespace)?;
        debug!("Creating {} '{}' at '{}'", kind, name, url);
        let response = self
            .send(self.client.post(&url).json(&object), "create", kind, &name)
            .await?;
        let created = response.json::<Value>().await.map_err(|e| {
            ClusterError::transport_with_source(format!("invalid answer creating {} '{}'", kind, name), e)
        })?;
        Ok(Resource::new(kind, created))
    }

    async fn get(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Resource> {
        let url = self.object_url(kind, namespace, name)?;
        let response = self.send(self.client.get(&url), "get", kind, name).await?;
        let object = response.json::<Value>().await.map_err(|e| {
            ClusterError::transport_with_source(format!("invalid answer getting {} '{}'", kind, name), e)
        })?;
        Ok(Resource::new(kind, object))
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        options: DeleteOptions,
    ) -> Result<()> {
        let url = self.object_url(kind, namespace, name)?;
        let mut body = json!({"kind": "DeleteOptions", "apiVersion": "v1"});
        if let Some(seconds) = options.grace_period_seconds {
            body["gracePeriodSeconds"] = json!(seconds);
        }
        self.send(self.client.delete(&url).json(&body), "delete", kind, name)
            .await?;
        Ok(())
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        name: &str,
        timeout: Duration,
    ) -> Result<WatchStream> {
        let url = self.collection_url(kind, namespace)?;
        let selector = format!("metadata.name={}", name);
        let seconds = timeout.as_secs().max(1).to_string();
        let request = self.client.get(&url).query(&[
            ("watch", "true"),
            ("fieldSelector", selector.as_str()),
            ("timeoutSeconds", seconds.as_str()),
        ]);
        let response = self.send(request, "watch", kind, name).await?;

        let body = response.bytes_stream().boxed();
        let events = stream::unfold(
            (body, WatchDecoder::new(kind), VecDeque::new(), false),
            |(mut body, mut decoder, mut pending, mut done)| async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((event, (body, decoder, pending, done)));
                    }
                    if done {
                        return None;
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                        Some(Err(e)) => {
                            pending.push_back(Err(ClusterError::transport_with_source(
                                "watch stream failed",
                                e,
                            )));
                            done = true;
                        }
                        None => {
                            pending.extend(decoder.finish());
                            done = true;
                        }
                    }
                }
            },
        );
        Ok(events.boxed())
    }
}

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: Value,
}

/// Splits a watch response body into events. The body is a sequence of JSON
/// documents, one per line, that can be cut at any byte.
struct WatchDecoder {
    kind: ResourceKind,
    buffer: Vec<u8>,
}

impl WatchDecoder {
    fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            buffer: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<Result<WatchEvent<Resource>>> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(index) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=index).collect();
            events.extend(self.decode_line(&line));
        }
        events
    }

    fn finish(&mut self) -> Vec<Result<WatchEvent<Resource>>> {
        let line = std::mem::take(&mut self.buffer);
        self.decode_line(&line).into_iter().collect()
    }

    fn decode_line(&self, line: &[u8]) -> Option<Result<WatchEvent<Resource>>> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return None;
        }
        let raw: RawWatchEvent = match serde_json::from_slice(line) {
            Ok(raw) => raw,
            Err(e) => return Some(Err(e.into())),
        };
        let resource = Resource::new(self.kind, raw.object);
        match raw.kind.as_str() {
            "ADDED" => Some(Ok(WatchEvent::Added(resource))),
            "MODIFIED" => Some(Ok(WatchEvent::Modified(resource))),
            "DELETED" => Some(Ok(WatchEvent::Deleted(resource))),
            "ERROR" => Some(Ok(WatchEvent::Error(status_message(
                &resource.object().to_string(),
            )))),
            "BOOKMARK" => None,
            other => {
                warn!(
                    "Unknown type of event '{}' while watching {}, will ignore it",
                    other, self.kind
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plane() -> HttpControlPlane {
        HttpControlPlane::new(&ClusterConfig {
            server: "https://api.example.com:6443/".to_string(),
            token: Some("abc".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_urls() {
        let plane = plane();
        assert_eq!(
            plane.collection_url(ResourceKind::Pod, Some("sb")).unwrap(),
            "https://api.example.com:6443/api/v1/namespaces/sb/pods"
        );
        assert_eq!(
            plane
                .object_url(ResourceKind::Route, Some("sb"), "server")
                .unwrap(),
            "https://api.example.com:6443/apis/route.openshift.io/v1/namespaces/sb/routes/server"
        );
        assert_eq!(
            plane.object_url(ResourceKind::Project, None, "sb").unwrap(),
            "https://api.example.com:6443/apis/project.openshift.io/v1/projects/sb"
        );
        assert_eq!(
            plane.create_url(ResourceKind::Project, None).unwrap(),
            "https://api.example.com:6443/apis/project.openshift.io/v1/projectrequests"
        );
        assert!(plane.collection_url(ResourceKind::Service, None).is_err());
    }

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = WatchDecoder::new(ResourceKind::Pod);
        let body = concat!(
            r#"{"type":"ADDED","object":{"metadata":{"name":"server"}}}"#,
            "\n",
            r#"{"type":"MODIFIED","object":{"metadata":{"name":"server"},"status":{}}}"#,
            "\n",
        )
        .as_bytes();
        let (first, second) = body.split_at(30);

        assert!(decoder.push(first).is_empty());
        let events = decoder.push(second);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Ok(WatchEvent::Added(_))));
        match &events[1] {
            Ok(WatchEvent::Modified(pod)) => assert_eq!(pod.name(), "server"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_decoder_error_and_bookmark_events() {
        let mut decoder = WatchDecoder::new(ResourceKind::Route);
        let events = decoder.push(
            concat!(
                r#"{"type":"BOOKMARK","object":{}}"#,
                "\n",
                r#"{"type":"ERROR","object":{"kind":"Status","message":"too old resource version"}}"#,
            )
            .as_bytes(),
        );
        assert!(events.is_empty());

        let events = decoder.finish();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            Ok(WatchEvent::Error(message)) if message == "too old resource version"
        ));
    }

    #[test]
    fn test_decoder_rejects_garbage() {
        let mut decoder = WatchDecoder::new(ResourceKind::Pod);
        let events = decoder.push(b"not json\n");
        assert!(matches!(events[0], Err(ClusterError::Serialization(_))));
    }

    #[test]
    fn test_status_message() {
        assert_eq!(
            status_message(r#"{"kind":"Status","message":"forbidden"}"#),
            "forbidden"
        );
        assert_eq!(status_message("plain text\n"), "plain text");
    }
}
