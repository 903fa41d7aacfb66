//! `ClusterClient` backed by the `kubectl` binary.
//!
//! Every call runs one `kubectl` subprocess with JSON output and maps the
//! result into kestrel types. Failures are classified from stderr so the
//! controller can tell an unreachable cluster from a missing object.
//!
//! Streams are long-lived subprocesses: `kubectl logs` for log streams and
//! one `kubectl port-forward` per forwarded connection. The child is killed
//! when the returned stream is dropped.

use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use kestrel_core::config::ClusterConfig;
use kestrel_core::{
    ClientError, ClientResult, ClusterClient, ComponentRef, Condition, ConditionStatus,
    ForwardStream, ForwardTarget, ImagePatch, LogOptions, LogSource, LogStream, Revision,
    WorkloadStatus,
};

const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// How long `kubectl port-forward` gets to report its local port.
const FORWARD_READY_TIMEOUT: Duration = Duration::from_secs(15);

/// Drives a cluster through `kubectl`.
#[derive(Debug, Clone)]
pub struct KubectlClient {
    binary: String,
    context: Option<String>,
    kubeconfig: Option<String>,
}

impl KubectlClient {
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            binary: config.kubectl.clone(),
            context: config.context.clone(),
            kubeconfig: config.kubeconfig.clone(),
        }
    }

    /// Global flags followed by `args`.
    fn args<'a>(&'a self, args: &[&'a str]) -> Vec<&'a str> {
        let mut all = Vec::with_capacity(args.len() + 4);
        if let Some(ctx) = &self.context {
            all.push("--context");
            all.push(ctx.as_str());
        }
        if let Some(cfg) = &self.kubeconfig {
            all.push("--kubeconfig");
            all.push(cfg.as_str());
        }
        all.extend_from_slice(args);
        all
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args(args))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Run kubectl to completion and return stdout.
    async fn run(&self, args: &[&str]) -> ClientResult<Vec<u8>> {
        debug!(args = ?args, "kubectl");
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| spawn_error(&self.binary, e))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(classify_stderr(stderr.trim()))
        }
    }

    async fn run_json<T: DeserializeOwned>(&self, args: &[&str]) -> ClientResult<T> {
        let stdout = self.run(args).await?;
        serde_json::from_slice(&stdout).map_err(|e| ClientError::Decode(e.to_string()))
    }
}

fn spawn_error(binary: &str, e: std::io::Error) -> ClientError {
    ClientError::Unreachable(format!("failed to execute {binary}: {e}"))
}

/// Map kubectl's stderr to a client error class.
pub fn classify_stderr(stderr: &str) -> ClientError {
    let lower = stderr.to_lowercase();
    let message = stderr.to_string();

    if lower.contains("unable to connect to the server")
        || lower.contains("connection refused")
        || lower.contains("no such host")
        || lower.contains("i/o timeout")
        || lower.contains("tls handshake timeout")
        || lower.contains("context deadline exceeded")
    {
        return ClientError::Unreachable(message);
    }
    if lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("must be logged in")
        || lower.contains("provide credentials")
    {
        return ClientError::Unauthorized(message);
    }
    if lower.contains("namespaces \"") && lower.contains("not found") {
        return ClientError::NamespaceNotFound(message);
    }
    if lower.contains("notfound") || lower.contains("not found") {
        return ClientError::NotFound(message);
    }
    ClientError::Command(message)
}

// ── JSON shapes ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: Option<String>,
    #[serde(default)]
    generation: u64,
    creation_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    annotations: std::collections::HashMap<String, String>,
    #[serde(default)]
    owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Deserialize)]
struct OwnerReference {
    kind: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct Container {
    name: String,
    image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct PodTemplate {
    spec: PodSpec,
}

#[derive(Debug, Deserialize)]
struct WorkloadSpec {
    replicas: Option<u32>,
    template: PodTemplate,
}

#[derive(Debug, Deserialize)]
struct RawCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
    reason: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentStatus {
    #[serde(default)]
    observed_generation: u64,
    #[serde(default)]
    available_replicas: u32,
    #[serde(default)]
    updated_replicas: u32,
    #[serde(default)]
    conditions: Vec<RawCondition>,
}

#[derive(Debug, Deserialize)]
struct Deployment {
    metadata: ObjectMeta,
    spec: WorkloadSpec,
    #[serde(default)]
    status: DeploymentStatus,
}

#[derive(Debug, Deserialize)]
struct ReplicaSet {
    metadata: ObjectMeta,
    spec: WorkloadSpec,
}

#[derive(Debug, Deserialize)]
struct List<T> {
    items: Vec<T>,
}

fn container_image(spec: &PodSpec, container: &str) -> Option<String> {
    spec.containers
        .iter()
        .find(|c| c.name == container)
        .or_else(|| spec.containers.first())
        .and_then(|c| c.image.clone())
}

fn workload_status(deployment: Deployment, container: &str) -> WorkloadStatus {
    WorkloadStatus {
        // kubectl omits replicas when it is the default of 1.
        desired_replicas: deployment.spec.replicas.unwrap_or(1),
        available_replicas: deployment.status.available_replicas,
        updated_replicas: deployment.status.updated_replicas,
        generation: deployment.metadata.generation,
        observed_generation: deployment.status.observed_generation,
        image: container_image(&deployment.spec.template.spec, container),
        conditions: deployment
            .status
            .conditions
            .into_iter()
            .map(|c| Condition {
                kind: c.kind,
                status: ConditionStatus::parse(&c.status),
                reason: c.reason,
                message: c.message,
            })
            .collect(),
    }
}

/// Build the revision history from the ReplicaSets a Deployment owns.
fn revision_history(sets: Vec<ReplicaSet>, deployment: &str, container: &str) -> Vec<Revision> {
    let mut revisions: Vec<Revision> = sets
        .into_iter()
        .filter(|rs| {
            rs.metadata
                .owner_references
                .iter()
                .any(|o| o.kind == "Deployment" && o.name == deployment)
        })
        .filter_map(|rs| {
            let revision = rs
                .metadata
                .annotations
                .get(REVISION_ANNOTATION)?
                .parse::<u64>()
                .ok()?;
            Some(Revision {
                revision,
                image: container_image(&rs.spec.template.spec, container).unwrap_or_default(),
                created_at: rs.metadata.creation_timestamp.unwrap_or_default(),
            })
        })
        .collect();
    revisions.sort_by_key(|r| r.revision);
    revisions
}

/// Strategic-merge patch setting the container image and rolling budget.
fn image_patch_body(patch: &ImagePatch) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "strategy": {
                "type": "RollingUpdate",
                "rollingUpdate": {
                    "maxSurge": patch.max_surge,
                    "maxUnavailable": patch.max_unavailable,
                }
            },
            "template": {
                "spec": {
                    "containers": [
                        { "name": patch.container, "image": patch.image }
                    ]
                }
            }
        }
    })
}

/// Parse the local port from `Forwarding from 127.0.0.1:43127 -> 8080`.
fn parse_forwarding_line(line: &str) -> Option<u16> {
    let rest = line.trim().strip_prefix("Forwarding from ")?;
    let addr = rest.split(" -> ").next()?;
    addr.rsplit(':').next()?.parse().ok()
}

// ── Streams ────────────────────────────────────────────────────────

/// stdout of a running `kubectl logs`. Kills the child on drop.
struct ChildStream {
    _child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for ChildStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

/// A TCP connection through a `kubectl port-forward` child.
struct ForwardConn {
    _child: Child,
    stream: TcpStream,
}

/// Read `output` line by line until it closes, logging each line. A child
/// whose pipes are never read blocks once the pipe buffer fills.
fn drain_lines<R>(target: String, stream: &'static str, output: R) -> JoinHandle<usize>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        let mut count = 0;
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(%target, stream, %line, "kubectl port-forward output");
            count += 1;
        }
        count
    })
}

impl AsyncRead for ForwardConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for ForwardConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[async_trait]
impl ClusterClient for KubectlClient {
    async fn check_namespace(&self, namespace: &str) -> ClientResult<()> {
        let name = format!("namespace/{namespace}");
        match self.run(&["get", &name, "-o", "name"]).await {
            Ok(_) => Ok(()),
            Err(ClientError::NotFound(_)) => Err(ClientError::NamespaceNotFound(namespace.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn get_status(&self, target: &ComponentRef) -> ClientResult<WorkloadStatus> {
        let deployment: Deployment = self
            .run_json(&[
                "get",
                "deployment",
                &target.name,
                "-n",
                &target.namespace,
                "-o",
                "json",
            ])
            .await?;
        Ok(workload_status(deployment, target.container_name()))
    }

    async fn patch_image(&self, target: &ComponentRef, patch: &ImagePatch) -> ClientResult<()> {
        let body = image_patch_body(patch).to_string();
        self.run(&[
            "patch",
            "deployment",
            &target.name,
            "-n",
            &target.namespace,
            "--type",
            "strategic",
            "-p",
            &body,
        ])
        .await?;
        Ok(())
    }

    async fn get_history(&self, target: &ComponentRef) -> ClientResult<Vec<Revision>> {
        // Surface a missing deployment as NotFound rather than an empty history.
        let deployment: Deployment = self
            .run_json(&[
                "get",
                "deployment",
                &target.name,
                "-n",
                &target.namespace,
                "-o",
                "json",
            ])
            .await?;
        let deployment_name = deployment.metadata.name.unwrap_or_else(|| target.name.clone());

        let sets: List<ReplicaSet> = self
            .run_json(&["get", "replicasets", "-n", &target.namespace, "-o", "json"])
            .await?;
        Ok(revision_history(
            sets.items,
            &deployment_name,
            target.container_name(),
        ))
    }

    async fn undo(&self, target: &ComponentRef) -> ClientResult<()> {
        let resource = format!("deployment/{}", target.name);
        self.run(&["rollout", "undo", &resource, "-n", &target.namespace])
            .await?;
        Ok(())
    }

    async fn open_log_stream(
        &self,
        source: &LogSource,
        opts: &LogOptions,
    ) -> ClientResult<LogStream> {
        let (namespace, resource, container) = match source {
            LogSource::Component(c) => (
                c.namespace.clone(),
                format!("deployment/{}", c.name),
                Some(c.container_name().to_string()),
            ),
            LogSource::Pod { namespace, name } => (namespace.clone(), name.clone(), None),
        };
        let tail = opts.tail.to_string();
        let mut args = vec!["logs", resource.as_str(), "-n", namespace.as_str(), "--tail", tail.as_str()];
        if opts.follow {
            args.push("--follow");
        }
        if opts.previous {
            args.push("--previous");
        }
        if let Some(c) = &container {
            args.push("-c");
            args.push(c.as_str());
        }

        debug!(args = ?args, "kubectl logs");
        let mut child = self
            .command(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| spawn_error(&self.binary, e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Io("kubectl logs has no stdout".to_string()))?;
        Ok(Box::new(ChildStream {
            _child: child,
            stdout,
        }))
    }

    async fn open_forward(&self, target: &ForwardTarget) -> ClientResult<ForwardStream> {
        let resource = format!("{}/{}", target.kind.prefix(), target.name);
        let ports = format!(":{}", target.remote_port);
        let args = [
            "port-forward",
            resource.as_str(),
            ports.as_str(),
            "-n",
            target.namespace.as_str(),
            "--address",
            "127.0.0.1",
        ];

        let mut child = self
            .command(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.binary, e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Io("kubectl port-forward has no stdout".to_string()))?;

        let mut lines = BufReader::new(stdout).lines();
        let ready = tokio::time::timeout(FORWARD_READY_TIMEOUT, async {
            while let Some(line) = lines.next_line().await? {
                if let Some(port) = parse_forwarding_line(&line) {
                    return Ok(Some(port));
                }
            }
            Ok::<_, std::io::Error>(None)
        })
        .await;

        let port = match ready {
            Ok(Ok(Some(port))) => port,
            Ok(Ok(None)) | Ok(Err(_)) => {
                let mut stderr = String::new();
                if let Some(mut err) = child.stderr.take() {
                    use tokio::io::AsyncReadExt;
                    let _ = err.read_to_string(&mut stderr).await;
                }
                return Err(classify_stderr(stderr.trim()));
            }
            Err(_) => {
                warn!(%target, "kubectl port-forward did not report a local port");
                return Err(ClientError::Unreachable(format!(
                    "port-forward to {target} not ready after {}s",
                    FORWARD_READY_TIMEOUT.as_secs()
                )));
            }
        };

        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        drain_lines(target.to_string(), "stdout", lines.into_inner());
        if let Some(stderr) = child.stderr.take() {
            drain_lines(target.to_string(), "stderr", stderr);
        }
        Ok(Box::new(ForwardConn {
            _child: child,
            stream,
        }))
    }
}
