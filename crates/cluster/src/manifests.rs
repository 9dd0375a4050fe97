//! Objects that make up a sandbox environment

use std::time::Duration;

use serde_json::{json, Value};

/// Label used to select the pods of each component
pub const APP_LABEL: &str = "app";
pub const SERVER_APP: &str = "server";
pub const CLEANER_APP: &str = "cleaner";

/// Port the server listens on inside its pod
pub const SERVER_PORT: u16 = 8000;
/// Where the work volume of the server is mounted
pub const SERVER_WORK: &str = "/var/cache/sandbox";
/// Environment variable that carries the authentication token to the server
pub const TOKEN_ENV: &str = "SANDBOX_TOKEN";

pub const SANDBOX_COMMAND: &str = "/usr/local/bin/sandbox";
pub const DEFAULT_IMAGE: &str = "quay.io/sandbox-rs/sandbox:latest";

const WORK_VOLUME: &str = "work";
const ROUTER_TIMEOUT_ANNOTATION: &str = "haproxy.router.openshift.io/timeout";
const ROUTER_TIMEOUT: &str = "10m";

pub fn project_request(name: &str) -> Value {
    json!({
        "apiVersion": "project.openshift.io/v1",
        "kind": "ProjectRequest",
        "metadata": {"name": name},
    })
}

pub fn service_account(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": {"name": name},
    })
}

/// Grants the `admin` cluster role inside `namespace` to the service account
/// with the same name as the binding
pub fn admin_role_binding(name: &str, namespace: &str) -> Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "RoleBinding",
        "metadata": {"name": name},
        "subjects": [{
            "kind": "ServiceAccount",
            "name": name,
            "namespace": namespace,
        }],
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "ClusterRole",
            "name": "admin",
        },
    })
}

/// Pod that deletes the environment after `wait` unless it is stopped
pub fn cleaner_pod(image: &str, wait: Duration) -> Value {
    pod(
        CLEANER_APP,
        image,
        vec![
            SANDBOX_COMMAND.to_string(),
            "clean-after-delay".to_string(),
            format!("--wait={}s", wait.as_secs().max(1)),
        ],
    )
}

/// Pod that runs the server. The token goes in the environment, never in
/// the command line.
pub fn server_pod(image: &str, token: &str) -> Value {
    let mut pod = pod(
        SERVER_APP,
        image,
        vec![
            SANDBOX_COMMAND.to_string(),
            "serve".to_string(),
            format!("--listen=0.0.0.0:{}", SERVER_PORT),
            format!("--work={}", SERVER_WORK),
        ],
    );
    pod["spec"]["volumes"] = json!([{"name": WORK_VOLUME, "emptyDir": {}}]);
    let container = &mut pod["spec"]["containers"][0];
    container["env"] = json!([{"name": TOKEN_ENV, "value": token}]);
    container["ports"] = json!([{"containerPort": SERVER_PORT, "protocol": "TCP"}]);
    container["volumeMounts"] = json!([{"name": WORK_VOLUME, "mountPath": SERVER_WORK}]);
    pod
}

fn pod(app: &str, image: &str, command: Vec<String>) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": app,
            "labels": {APP_LABEL: app},
        },
        "spec": {
            "serviceAccountName": app,
            "containers": [{
                "name": app,
                "image": image,
                "imagePullPolicy": "Always",
                "command": command,
            }],
        },
    })
}

pub fn server_service() -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": SERVER_APP,
            "labels": {APP_LABEL: SERVER_APP},
        },
        "spec": {
            "selector": {APP_LABEL: SERVER_APP},
            "ports": [{"port": SERVER_PORT, "targetPort": SERVER_PORT}],
        },
    })
}

/// Edge terminated route to the server service. Test runs can be long, so
/// the router timeout is raised.
pub fn server_route() -> Value {
    json!({
        "apiVersion": "route.openshift.io/v1",
        "kind": "Route",
        "metadata": {
            "name": SERVER_APP,
            "labels": {APP_LABEL: SERVER_APP},
            "annotations": {ROUTER_TIMEOUT_ANNOTATION: ROUTER_TIMEOUT},
        },
        "spec": {
            "to": {"kind": "Service", "name": SERVER_APP},
            "tls": {"termination": "edge"},
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_pod() {
        let pod = server_pod("example.com/sandbox:1", "secret");
        let container = &pod["spec"]["containers"][0];

        assert_eq!(pod["metadata"]["name"], "server");
        assert_eq!(pod["metadata"]["labels"]["app"], "server");
        assert_eq!(pod["spec"]["serviceAccountName"], "server");
        assert_eq!(container["image"], "example.com/sandbox:1");
        assert_eq!(container["imagePullPolicy"], "Always");
        assert_eq!(
            container["command"],
            json!([
                "/usr/local/bin/sandbox",
                "serve",
                "--listen=0.0.0.0:8000",
                "--work=/var/cache/sandbox"
            ])
        );
        assert_eq!(
            container["env"],
            json!([{"name": "SANDBOX_TOKEN", "value": "secret"}])
        );
        assert_eq!(container["ports"][0]["containerPort"], 8000);
        assert_eq!(container["volumeMounts"][0]["mountPath"], SERVER_WORK);
        assert!(!container["command"].to_string().contains("secret"));
    }

    #[test]
    fn test_cleaner_pod() {
        let pod = cleaner_pod(DEFAULT_IMAGE, Duration::from_secs(3600));
        let command = &pod["spec"]["containers"][0]["command"];
        assert_eq!(command[1], "clean-after-delay");
        assert_eq!(command[2], "--wait=3600s");
        assert_eq!(pod["spec"]["serviceAccountName"], "cleaner");
    }

    #[test]
    fn test_role_binding_and_route() {
        let binding = admin_role_binding("cleaner", "sandbox-jane-1");
        assert_eq!(binding["subjects"][0]["namespace"], "sandbox-jane-1");
        assert_eq!(binding["roleRef"]["name"], "admin");

        let route = server_route();
        assert_eq!(route["spec"]["tls"]["termination"], "edge");
        assert_eq!(
            route["metadata"]["annotations"]["haproxy.router.openshift.io/timeout"],
            "10m"
        );
        assert_eq!(server_service()["spec"]["ports"][0]["port"], 8000);
    }
}
