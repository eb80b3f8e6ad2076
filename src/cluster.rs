//! Cluster client interface.
//!
//! The orchestrator creates pods and services and waits on readiness
//! through the [`ClusterClient`] trait. [`KubectlClusterClient`] is the
//! shipped implementation, driving the `kubectl` command line with
//! generated JSON manifests; tests substitute an in-memory recording
//! client.

use crate::compose::{HealthProbe, PortBinding, Readiness};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// One cluster-side volume mount derived from a bind declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMountPlan {
    /// Volume name within the pod (`vol1`…`volN`).
    pub volume: String,
    /// Mount point inside the container.
    pub mount_path: String,
    /// Mount read-only.
    pub read_only: bool,
    /// Whether the backing host path was a directory; decides between a
    /// per-file sub-path and a whole-directory mount.
    pub host_is_dir: bool,
}

/// Everything the cluster needs to create one service's pod.
#[derive(Debug, Clone, PartialEq)]
pub struct PodDefinition {
    /// Pod name (the service name).
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// User to run as; populated only when the caller opted in.
    pub user: Option<String>,
    /// Environment variables, sorted by name.
    pub environment: Vec<(String, String)>,
    /// Published ports.
    pub ports: Vec<PortBinding>,
    /// Volume mounts backed by the volume-init image.
    pub mounts: Vec<VolumeMountPlan>,
    /// Volume-init image ID, when the service declares bind mounts.
    pub volume_init_image: Option<String>,
    /// Readiness probe.
    pub probe: Option<HealthProbe>,
}

/// A cluster service publishing a pod's ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Service name (the composition service name).
    pub name: String,
    /// Published ports.
    pub ports: Vec<PortBinding>,
}

/// Pod/service creation and readiness interface.
///
/// Implementations must be safe for concurrent use; the orchestrator runs
/// one readiness waiter per service against the same client.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Creates a pod.
    async fn create_pod(&self, pod: &PodDefinition) -> Result<()>;

    /// Creates a service publishing a pod's ports.
    async fn create_service(&self, service: &ServiceDefinition) -> Result<()>;

    /// Blocks until the named pod reaches the given readiness level.
    async fn wait_for_pod(&self, name: &str, readiness: Readiness) -> Result<()>;
}

// =============================================================================
// kubectl Implementation
// =============================================================================

/// [`ClusterClient`] backed by the `kubectl` command-line client.
#[derive(Debug, Clone)]
pub struct KubectlClusterClient {
    program: String,
    namespace: Option<String>,
    wait_timeout_secs: u64,
}

impl Default for KubectlClusterClient {
    fn default() -> Self {
        Self::new("kubectl", None)
    }
}

impl KubectlClusterClient {
    /// Creates a client invoking `program`, optionally pinned to a
    /// namespace.
    pub fn new(program: &str, namespace: Option<&str>) -> Self {
        Self {
            program: program.to_string(),
            namespace: namespace.map(str::to_string),
            wait_timeout_secs: 600,
        }
    }

    async fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<String> {
        let mut cmd = tokio::process::Command::new(&self.program);
        if let Some(ns) = &self.namespace {
            cmd.arg("--namespace").arg(ns);
        }
        cmd.args(args);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|e| Error::Subprocess {
            command: format!("{} {}", self.program, args.join(" ")),
            reason: e.to_string(),
        })?;
        if let Some(content) = stdin {
            let mut handle = child.stdin.take().expect("stdin was piped");
            handle.write_all(content).await?;
            drop(handle);
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::Subprocess {
                command: format!("{} {}", self.program, args.join(" ")),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn pod_manifest(&self, pod: &PodDefinition) -> serde_json::Value {
        let env: Vec<serde_json::Value> = pod
            .environment
            .iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();
        let ports: Vec<serde_json::Value> = pod
            .ports
            .iter()
            .map(|p| json!({"containerPort": p.container}))
            .collect();
        let mounts: Vec<serde_json::Value> = pod
            .mounts
            .iter()
            .map(|m| {
                json!({
                    "name": m.volume,
                    "mountPath": m.mount_path,
                    "readOnly": m.read_only,
                    "subPath": staged_sub_path(m),
                })
            })
            .collect();
        let volumes: Vec<serde_json::Value> = pod
            .mounts
            .iter()
            .map(|m| json!({"name": m.volume, "emptyDir": {}}))
            .collect();

        let mut container = json!({
            "name": pod.name,
            "image": pod.image,
            "env": env,
            "ports": ports,
            "volumeMounts": mounts,
        });
        if let Some(entrypoint) = &pod.entrypoint {
            container["command"] = json!(entrypoint);
        }
        if let Some(working_dir) = &pod.working_dir {
            container["workingDir"] = json!(working_dir);
        }
        if let Some(probe) = &pod.probe {
            container["readinessProbe"] = json!({
                "exec": {"command": probe_command(probe)},
                "periodSeconds": probe.interval.as_secs(),
                "timeoutSeconds": probe.timeout.as_secs(),
                "failureThreshold": probe.retries,
            });
        }

        let mut spec = json!({
            "containers": [container],
            "volumes": volumes,
        });
        if let Some(image) = &pod.volume_init_image {
            let init_mounts: Vec<serde_json::Value> = pod
                .mounts
                .iter()
                .enumerate()
                .map(|(idx, m)| json!({"name": m.volume, "mountPath": format!("/mnt/vol{}", idx + 1)}))
                .collect();
            spec["initContainers"] = json!([{
                "name": "volume-init",
                "image": image,
                "volumeMounts": init_mounts,
            }]);
        }
        if let Some(uid) = pod.user.as_deref().and_then(|u| u.parse::<u64>().ok()) {
            spec["securityContext"] = json!({"runAsUser": uid});
        }

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": pod.name, "labels": {"app": pod.name}},
            "spec": spec,
        })
    }

    fn service_manifest(&self, service: &ServiceDefinition) -> serde_json::Value {
        let ports: Vec<serde_json::Value> = service
            .ports
            .iter()
            .map(|p| {
                json!({
                    "port": p.host.unwrap_or(p.container),
                    "targetPort": p.container,
                })
            })
            .collect();
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": service.name},
            "spec": {"selector": {"app": service.name}, "ports": ports},
        })
    }
}

/// Sub-path into the staged volume for one mount.
///
/// A directory bind uses a whole-directory mount of the staged tree; a
/// file bind uses a per-file sub-path to the single staged entry. The
/// volume-init entrypoint copies either shape to the volume's `root`
/// entry, so both strategies currently name the same sub-path — the
/// branch stays explicit because the flag is what selects between them,
/// and a different staging layout would diverge here.
#[allow(clippy::if_same_then_else)]
fn staged_sub_path(mount: &VolumeMountPlan) -> &'static str {
    if mount.host_is_dir {
        // Whole staged directory tree.
        "root"
    } else {
        // The single staged file.
        "root"
    }
}

/// Translates a probe's `CMD`/`CMD-SHELL` vector to an exec command.
fn probe_command(probe: &HealthProbe) -> Vec<String> {
    match probe.test.split_first() {
        Some((head, rest)) if head == "CMD-SHELL" => {
            let mut cmd = vec!["/bin/sh".to_string(), "-c".to_string()];
            cmd.extend(rest.iter().cloned());
            cmd
        }
        Some((head, rest)) if head == "CMD" => rest.to_vec(),
        _ => probe.test.clone(),
    }
}

#[async_trait]
impl ClusterClient for KubectlClusterClient {
    async fn create_pod(&self, pod: &PodDefinition) -> Result<()> {
        let manifest = serde_json::to_vec(&self.pod_manifest(pod))
            .expect("pod manifest serializes");
        debug!(pod = %pod.name, "creating pod");
        self.run(&["apply", "-f", "-"], Some(&manifest)).await?;
        Ok(())
    }

    async fn create_service(&self, service: &ServiceDefinition) -> Result<()> {
        let manifest = serde_json::to_vec(&self.service_manifest(service))
            .expect("service manifest serializes");
        debug!(service = %service.name, "creating service");
        self.run(&["apply", "-f", "-"], Some(&manifest)).await?;
        Ok(())
    }

    async fn wait_for_pod(&self, name: &str, readiness: Readiness) -> Result<()> {
        let timeout = format!("--timeout={}s", self.wait_timeout_secs);
        let condition = match readiness {
            Readiness::Started => "--for=jsonpath={.status.phase}=Running",
            Readiness::Healthy => "--for=condition=Ready",
        };
        let pod = format!("pod/{name}");
        debug!(pod = name, %readiness, "waiting for pod");
        self.run(&["wait", &pod, condition, &timeout], None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_probe_command_forms() {
        let shell = HealthProbe {
            test: vec!["CMD-SHELL".to_string(), "curl -f localhost".to_string()],
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            retries: 3,
        };
        assert_eq!(
            probe_command(&shell),
            vec!["/bin/sh", "-c", "curl -f localhost"]
        );
        let cmd = HealthProbe {
            test: vec!["CMD".to_string(), "pg_isready".to_string()],
            ..shell
        };
        assert_eq!(probe_command(&cmd), vec!["pg_isready"]);
    }

    #[test]
    fn test_pod_manifest_shape() {
        let client = KubectlClusterClient::default();
        let pod = PodDefinition {
            name: "web".to_string(),
            image: "nginx:latest".to_string(),
            entrypoint: None,
            working_dir: None,
            user: Some("1000".to_string()),
            environment: vec![("MODE".to_string(), "dev".to_string())],
            ports: vec![PortBinding { host: Some(80), container: 8080 }],
            mounts: vec![
                VolumeMountPlan {
                    volume: "vol1".to_string(),
                    mount_path: "/var/data".to_string(),
                    read_only: true,
                    host_is_dir: true,
                },
                VolumeMountPlan {
                    volume: "vol2".to_string(),
                    mount_path: "/etc/app.conf".to_string(),
                    read_only: false,
                    host_is_dir: false,
                },
            ],
            volume_init_image: Some(
                "sha256:1111111111111111111111111111111111111111111111111111111111111111"
                    .to_string(),
            ),
            probe: None,
        };
        let manifest = client.pod_manifest(&pod);
        assert_eq!(manifest["kind"], "Pod");
        assert_eq!(manifest["spec"]["containers"][0]["image"], "nginx:latest");
        assert_eq!(
            manifest["spec"]["initContainers"][0]["volumeMounts"][0]["mountPath"],
            "/mnt/vol1"
        );
        assert_eq!(manifest["spec"]["securityContext"]["runAsUser"], 1000);
        // Whole-directory and per-file mounts both address the staged
        // `root` entry.
        let mounts = &manifest["spec"]["containers"][0]["volumeMounts"];
        assert_eq!(mounts[0]["subPath"], "root");
        assert_eq!(mounts[0]["readOnly"], true);
        assert_eq!(mounts[1]["subPath"], "root");
        assert_eq!(mounts[1]["mountPath"], "/etc/app.conf");
        assert_eq!(
            manifest["spec"]["initContainers"][0]["volumeMounts"][1]["mountPath"],
            "/mnt/vol2"
        );
    }
}
