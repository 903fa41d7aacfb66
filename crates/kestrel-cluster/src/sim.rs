//! In-memory simulated cluster.
//!
//! `SimCluster` implements [`ClusterClient`] against a scripted model of a
//! few workloads. Readiness is driven by the tokio clock, so tests running
//! with paused time can move a rollout past its deadline instantly. Call
//! counters let tests assert exactly which mutations were issued.
//!
//! Revisions follow the same rules as a Deployment: patching to a new
//! image appends a revision, patching to the live image is a no-op, and
//! undo re-activates the second-to-last image as a new revision.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::time::Instant;
use tracing::debug;

use kestrel_core::{
    ClientError, ClientResult, ClusterClient, ComponentRef, Condition, ConditionStatus,
    ForwardStream, ForwardTarget, ImagePatch, KestrelConfig, LogOptions, LogSource, LogStream,
    Revision, TargetKind, WorkloadStatus,
};

const PIPE_CAPACITY: usize = 64 * 1024;

/// How a workload behaves after being rolled to a given image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageBehavior {
    /// Converges once this much time has passed since the rollout started.
    ReadyAfter(Duration),
    /// Never converges and never reports an explicit failure.
    Never,
    /// Reports `Progressing=False` with this reason.
    Stalls(String),
}

/// How a forwarded connection behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardBehavior {
    /// Echo every byte back.
    Echo,
    /// Accept the connection but never read, write, or close it.
    Hang,
    /// Accept the connection and close the remote end at once.
    Close,
    /// Fail to open with this error.
    Fail(ClientError),
}

/// Number of calls made against the simulated cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub status: u32,
    pub patch: u32,
    pub history: u32,
    pub undo: u32,
    pub logs: u32,
    pub forwards: u32,
}

#[derive(Debug)]
struct SimWorkload {
    replicas: u32,
    image: String,
    generation: u64,
    /// When the live image was rolled out. `None` for seeded revisions,
    /// which start converged.
    rolled_at: Option<Instant>,
    history: Vec<Revision>,
}

#[derive(Debug, Clone)]
struct SimLog {
    payload: Vec<u8>,
    hold_open: bool,
}

#[derive(Debug, Default)]
struct SimState {
    namespaces: HashSet<String>,
    workloads: HashMap<(String, String), SimWorkload>,
    behaviors: HashMap<String, ImageBehavior>,
    default_behavior: Option<ImageBehavior>,
    unreachable: bool,
    unauthorized: bool,
    status_failures: u32,
    calls: CallCounts,
    logs: HashMap<LogSource, SimLog>,
    forwards: HashMap<ForwardTarget, ForwardBehavior>,
    /// Stream ends kept alive so their peers never see EOF.
    parked: Vec<DuplexStream>,
}

impl SimState {
    fn check_transport(&self) -> ClientResult<()> {
        if self.unreachable {
            return Err(ClientError::Unreachable(
                "dial tcp 10.0.0.1:6443: connect: connection refused".to_string(),
            ));
        }
        if self.unauthorized {
            return Err(ClientError::Unauthorized(
                "the server has asked for the client to provide credentials".to_string(),
            ));
        }
        Ok(())
    }

    fn workload_mut(&mut self, target: &ComponentRef) -> ClientResult<&mut SimWorkload> {
        if !self.namespaces.contains(&target.namespace) {
            return Err(ClientError::NamespaceNotFound(target.namespace.clone()));
        }
        self.workloads
            .get_mut(&key(target))
            .ok_or_else(|| ClientError::NotFound(format!("deployment {target}")))
    }

    fn behavior(&self, image: &str) -> ImageBehavior {
        self.behaviors
            .get(image)
            .cloned()
            .or_else(|| self.default_behavior.clone())
            .unwrap_or(ImageBehavior::ReadyAfter(Duration::ZERO))
    }
}

fn key(target: &ComponentRef) -> (String, String) {
    (target.namespace.clone(), target.name.clone())
}

fn next_revision(history: &[Revision]) -> u64 {
    history.last().map(|r| r.revision + 1).unwrap_or(1)
}

/// A scripted, in-memory cluster.
#[derive(Clone, Default)]
pub struct SimCluster {
    inner: Arc<Mutex<SimState>>,
}

impl SimCluster {
    /// Create an empty simulated cluster.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a simulated cluster from configuration: every configured
    /// component exists in `env` with one revision, converges after 10s,
    /// echoes forwarded bytes, and has a short log.
    pub fn from_config(config: &KestrelConfig, env: &str) -> Self {
        let sim = Self::new().with_namespace(&config.namespace_for(env));
        sim.state().default_behavior = Some(ImageBehavior::ReadyAfter(Duration::from_secs(10)));

        let mut names: Vec<&String> = config.components.keys().collect();
        names.sort();
        for name in names {
            let resolved = config.component(name);
            let target = config.component_ref(env, name);
            let image = config.components[name]
                .image
                .clone()
                .unwrap_or_else(|| format!("{}:stable", resolved.deployment));
            sim.add_workload(&target, 2, &[image.as_str()]);
            sim.add_log(
                &LogSource::Component(target.clone()),
                format!("{name}: listening on :{}\n{name}: ready\n", resolved.port).as_bytes(),
                true,
            );
            sim.add_forward(
                &ForwardTarget {
                    namespace: target.namespace.clone(),
                    kind: TargetKind::Service,
                    name: resolved.service.clone(),
                    remote_port: resolved.port,
                },
                ForwardBehavior::Echo,
            );
        }
        sim
    }

    pub fn with_namespace(self, namespace: &str) -> Self {
        self.state().namespaces.insert(namespace.to_string());
        self
    }

    /// Add a workload whose revision history is `images` (oldest first).
    /// The last image is live and already converged.
    pub fn with_workload(self, target: &ComponentRef, replicas: u32, images: &[&str]) -> Self {
        self.add_workload(target, replicas, images);
        self
    }

    fn add_workload(&self, target: &ComponentRef, replicas: u32, images: &[&str]) {
        let now = Utc::now();
        let history: Vec<Revision> = images
            .iter()
            .enumerate()
            .map(|(i, image)| Revision {
                revision: i as u64 + 1,
                image: image.to_string(),
                created_at: now,
            })
            .collect();
        let image = images.last().map(|s| s.to_string()).unwrap_or_default();

        let mut state = self.state();
        state.namespaces.insert(target.namespace.clone());
        state.workloads.insert(
            key(target),
            SimWorkload {
                replicas,
                image,
                generation: 1,
                rolled_at: None,
                history,
            },
        );
    }

    /// Script how the workload behaves once rolled to `image`.
    pub fn with_behavior(self, image: &str, behavior: ImageBehavior) -> Self {
        self.set_behavior(image, behavior);
        self
    }

    pub fn set_behavior(&self, image: &str, behavior: ImageBehavior) {
        self.state().behaviors.insert(image.to_string(), behavior);
    }

    pub fn with_log(self, source: &LogSource, payload: &[u8], hold_open: bool) -> Self {
        self.add_log(source, payload, hold_open);
        self
    }

    fn add_log(&self, source: &LogSource, payload: &[u8], hold_open: bool) {
        self.state().logs.insert(
            source.clone(),
            SimLog {
                payload: payload.to_vec(),
                hold_open,
            },
        );
    }

    pub fn with_forward(self, target: &ForwardTarget, behavior: ForwardBehavior) -> Self {
        self.add_forward(target, behavior);
        self
    }

    fn add_forward(&self, target: &ForwardTarget, behavior: ForwardBehavior) {
        self.state().forwards.insert(target.clone(), behavior);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.state().unauthorized = unauthorized;
    }

    /// Make the next `n` status calls fail with a transient error.
    pub fn fail_next_status(&self, n: u32) {
        self.state().status_failures = n;
    }

    pub fn calls(&self) -> CallCounts {
        self.state().calls
    }

    pub fn undo_calls(&self) -> u32 {
        self.state().calls.undo
    }

    pub fn patch_calls(&self) -> u32 {
        self.state().calls.patch
    }

    /// Live image of a workload.
    pub fn current_image(&self, target: &ComponentRef) -> Option<String> {
        self.state()
            .workloads
            .get(&key(target))
            .map(|w| w.image.clone())
    }

    /// Revision history of a workload, oldest first.
    pub fn history(&self, target: &ComponentRef) -> Vec<Revision> {
        self.state()
            .workloads
            .get(&key(target))
            .map(|w| w.history.clone())
            .unwrap_or_default()
    }

    /// Write `payload` into a new pipe and return its read end.
    fn spawn_log_pipe(&self, log: SimLog) -> LogStream {
        let (reader, mut writer) = tokio::io::duplex(PIPE_CAPACITY);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if writer.write_all(&log.payload).await.is_err() {
                return;
            }
            if log.hold_open {
                inner
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .parked
                    .push(writer);
            }
        });
        Box::new(reader)
    }
}

#[async_trait]
impl ClusterClient for SimCluster {
    async fn check_namespace(&self, namespace: &str) -> ClientResult<()> {
        let state = self.state();
        state.check_transport()?;
        if state.namespaces.contains(namespace) {
            Ok(())
        } else {
            Err(ClientError::NamespaceNotFound(namespace.to_string()))
        }
    }

    async fn get_status(&self, target: &ComponentRef) -> ClientResult<WorkloadStatus> {
        let mut state = self.state();
        state.calls.status += 1;
        state.check_transport()?;
        if state.status_failures > 0 {
            state.status_failures -= 1;
            return Err(ClientError::Command(
                "etcdserver: request timed out".to_string(),
            ));
        }

        let (replicas, image, generation, elapsed) = {
            let w = state.workload_mut(target)?;
            (w.replicas, w.image.clone(), w.generation, w.rolled_at.map(|t| t.elapsed()))
        };

        let mut status = WorkloadStatus {
            desired_replicas: replicas,
            available_replicas: replicas,
            updated_replicas: replicas,
            generation,
            observed_generation: generation,
            image: Some(image.clone()),
            conditions: vec![
                Condition::new("Available", ConditionStatus::True)
                    .with_reason("MinimumReplicasAvailable"),
                Condition::new("Progressing", ConditionStatus::True)
                    .with_reason("NewReplicaSetAvailable"),
            ],
        };

        let converged = match state.behavior(&image) {
            _ if elapsed.is_none() => true,
            ImageBehavior::ReadyAfter(after) => elapsed.is_some_and(|e| e >= after),
            ImageBehavior::Never => false,
            ImageBehavior::Stalls(reason) => {
                status.conditions[1] =
                    Condition::new("Progressing", ConditionStatus::False).with_reason(&reason);
                false
            }
        };
        if !converged {
            status.available_replicas = replicas.saturating_sub(1);
            status.updated_replicas = replicas / 2;
            status.conditions[0] = Condition::new("Available", ConditionStatus::False)
                .with_reason("MinimumReplicasUnavailable");
        }

        debug!(component = %target, converged, "sim status");
        Ok(status)
    }

    async fn patch_image(&self, target: &ComponentRef, patch: &ImagePatch) -> ClientResult<()> {
        let mut state = self.state();
        state.calls.patch += 1;
        state.check_transport()?;
        let w = state.workload_mut(target)?;
        if w.image == patch.image {
            return Ok(());
        }
        let revision = next_revision(&w.history);
        w.history.push(Revision {
            revision,
            image: patch.image.clone(),
            created_at: Utc::now(),
        });
        w.image = patch.image.clone();
        w.generation += 1;
        w.rolled_at = Some(Instant::now());
        Ok(())
    }

    async fn get_history(&self, target: &ComponentRef) -> ClientResult<Vec<Revision>> {
        let mut state = self.state();
        state.calls.history += 1;
        state.check_transport()?;
        Ok(state.workload_mut(target)?.history.clone())
    }

    async fn undo(&self, target: &ComponentRef) -> ClientResult<()> {
        let mut state = self.state();
        state.calls.undo += 1;
        state.check_transport()?;
        let w = state.workload_mut(target)?;
        if w.history.len() < 2 {
            return Err(ClientError::Command(format!(
                "no rollout history found for deployment {target}"
            )));
        }
        let previous = w.history[w.history.len() - 2].image.clone();
        let revision = next_revision(&w.history);
        w.history.push(Revision {
            revision,
            image: previous.clone(),
            created_at: Utc::now(),
        });
        w.image = previous;
        w.generation += 1;
        w.rolled_at = Some(Instant::now());
        Ok(())
    }

    async fn open_log_stream(
        &self,
        source: &LogSource,
        opts: &LogOptions,
    ) -> ClientResult<LogStream> {
        let log = {
            let mut state = self.state();
            state.calls.logs += 1;
            state.check_transport()?;
            let mut log = state
                .logs
                .get(source)
                .cloned()
                .ok_or_else(|| ClientError::NotFound(format!("log source {source}")))?;
            log.hold_open &= opts.follow;
            log
        };
        Ok(self.spawn_log_pipe(log))
    }

    async fn open_forward(&self, target: &ForwardTarget) -> ClientResult<ForwardStream> {
        let behavior = {
            let mut state = self.state();
            state.calls.forwards += 1;
            state.check_transport()?;
            state
                .forwards
                .get(target)
                .cloned()
                .ok_or_else(|| ClientError::NotFound(format!("forward target {target}")))?
        };

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        match behavior {
            ForwardBehavior::Echo => {
                tokio::spawn(async move {
                    let (mut r, mut w) = tokio::io::split(remote);
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
            ForwardBehavior::Hang => self.state().parked.push(remote),
            ForwardBehavior::Close => drop(remote),
            ForwardBehavior::Fail(e) => return Err(e),
        }
        Ok(Box::new(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn api() -> ComponentRef {
        ComponentRef::new("shop-dev", "api")
    }

    fn patch(image: &str) -> ImagePatch {
        ImagePatch {
            container: "api".to_string(),
            image: image.to_string(),
            max_surge: 1,
            max_unavailable: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn patch_then_converge_after_delay() {
        let sim = SimCluster::new()
            .with_workload(&api(), 3, &["repo/api:v1"])
            .with_behavior("repo/api:v2", ImageBehavior::ReadyAfter(Duration::from_secs(10)));

        sim.patch_image(&api(), &patch("repo/api:v2")).await.unwrap();
        let status = sim.get_status(&api()).await.unwrap();
        assert_eq!(status.available_replicas, 2);
        assert_eq!(status.generation, 2);

        tokio::time::advance(Duration::from_secs(10)).await;
        let status = sim.get_status(&api()).await.unwrap();
        assert_eq!(status.available_replicas, 3);
        assert_eq!(status.updated_replicas, 3);
        assert_eq!(sim.history(&api()).len(), 2);
    }

    #[tokio::test]
    async fn patch_to_same_image_is_noop() {
        let sim = SimCluster::new().with_workload(&api(), 1, &["repo/api:v1"]);
        sim.patch_image(&api(), &patch("repo/api:v1")).await.unwrap();
        assert_eq!(sim.history(&api()).len(), 1);
        assert_eq!(sim.patch_calls(), 1);
    }

    #[tokio::test]
    async fn undo_reactivates_second_to_last() {
        let sim = SimCluster::new().with_workload(&api(), 1, &["v1", "v2", "v3"]);
        sim.undo(&api()).await.unwrap();

        let history = sim.history(&api());
        assert_eq!(history.len(), 4);
        assert_eq!(history[3].image, "v2");
        assert_eq!(history[3].revision, 4);
        assert_eq!(sim.current_image(&api()).as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn undo_without_history_fails() {
        let sim = SimCluster::new().with_workload(&api(), 1, &["v1"]);
        assert!(sim.undo(&api()).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_fails_every_call() {
        let sim = SimCluster::new().with_workload(&api(), 1, &["v1"]);
        sim.set_unreachable(true);
        let err = sim.get_status(&api()).await.unwrap_err();
        assert!(err.is_transport());
        let err = sim.patch_image(&api(), &patch("v2")).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn missing_component_and_namespace() {
        let sim = SimCluster::new().with_workload(&api(), 1, &["v1"]);
        let err = sim
            .get_status(&ComponentRef::new("shop-dev", "web"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
        let err = sim.check_namespace("nope").await.unwrap_err();
        assert!(matches!(err, ClientError::NamespaceNotFound(_)));
    }

    #[tokio::test]
    async fn log_stream_ends_without_follow() {
        let source = LogSource::Component(api());
        let sim = SimCluster::new().with_log(&source, b"a\nb\n", true);
        let mut stream = sim
            .open_log_stream(&source, &LogOptions::default())
            .await
            .unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "a\nb\n");
    }

    #[tokio::test]
    async fn echo_forward_round_trips() {
        let target = ForwardTarget {
            namespace: "shop-dev".to_string(),
            kind: TargetKind::Service,
            name: "api".to_string(),
            remote_port: 80,
        };
        let sim = SimCluster::new().with_forward(&target, ForwardBehavior::Echo);
        let mut conn = sim.open_forward(&target).await.unwrap();
        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn from_config_seeds_components() {
        let config: KestrelConfig = toml::from_str(
            r#"
[components.api]
image = "repo/api:v1"
port = 8080
"#,
        )
        .unwrap();
        let sim = SimCluster::from_config(&config, "dev");
        let target = config.component_ref("dev", "api");
        assert_eq!(sim.current_image(&target).as_deref(), Some("repo/api:v1"));
    }
}
