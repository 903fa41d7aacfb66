//! Shared types used across kestrel crates.
//!
//! These describe what the controller knows about a workload: how to
//! address it, what the control plane reports about it, and what a
//! rollout was asked to do.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RequestError, RequestResult};

// ── Addressing ─────────────────────────────────────────────────────

/// A named deployable unit inside a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentRef {
    pub namespace: String,
    /// Name of the workload object (a Deployment for kubectl).
    pub name: String,
    /// Container whose image is patched. Defaults to `name`.
    pub container: Option<String>,
}

impl ComponentRef {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            container: None,
        }
    }

    pub fn with_container(mut self, container: &str) -> Self {
        self.container = Some(container.to_string());
        self
    }

    /// The container name the image patch targets.
    pub fn container_name(&self) -> &str {
        self.container.as_deref().unwrap_or(&self.name)
    }
}

impl fmt::Display for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ── Workload status ────────────────────────────────────────────────

/// Tri-state status of a workload condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }
}

/// A single condition reported by the control plane (`Available`, `Progressing`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: String,
    pub status: ConditionStatus,
    pub reason: Option<String>,
    pub message: Option<String>,
}

impl Condition {
    pub fn new(kind: &str, status: ConditionStatus) -> Self {
        Self {
            kind: kind.to_string(),
            status,
            reason: None,
            message: None,
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

/// Observed state of a workload, as returned by `ClusterClient::get_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub desired_replicas: u32,
    pub available_replicas: u32,
    pub updated_replicas: u32,
    /// Generation of the desired spec.
    pub generation: u64,
    /// Generation last processed by the workload controller.
    pub observed_generation: u64,
    /// Image currently set on the patched container, if known.
    pub image: Option<String>,
    pub conditions: Vec<Condition>,
}

impl WorkloadStatus {
    /// Look up a condition by kind.
    pub fn condition(&self, kind: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }
}

// ── Revisions ──────────────────────────────────────────────────────

/// A recorded historical state of a component's desired image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub revision: u64,
    pub image: String,
    pub created_at: DateTime<Utc>,
}

/// Revision history, ordered oldest to newest. The live revision is last.
pub type RevisionHistory = Vec<Revision>;

// ── Rollout requests ───────────────────────────────────────────────

/// Image change sent to the control plane, together with the rolling
/// update budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePatch {
    pub container: String,
    pub image: String,
    pub max_surge: u32,
    pub max_unavailable: u32,
}

/// Immutable input to one `update()` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutRequest {
    pub environment: String,
    pub component: ComponentRef,
    pub target_image: String,
    pub timeout_secs: u64,
    pub max_surge: u32,
    pub max_unavailable: u32,
}

impl RolloutRequest {
    /// Build a request with the default budget (300s, surge 1, unavailable 0).
    pub fn new(environment: &str, component: ComponentRef, target_image: &str) -> Self {
        Self {
            environment: environment.to_string(),
            component,
            target_image: target_image.to_string(),
            timeout_secs: 300,
            max_surge: 1,
            max_unavailable: 0,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.component.namespace
    }

    /// Check the preconditions that do not need the cluster.
    pub fn validate(&self) -> RequestResult<()> {
        if self.component.namespace.trim().is_empty() {
            return Err(RequestError::Missing("namespace"));
        }
        if self.component.name.trim().is_empty() {
            return Err(RequestError::Missing("component"));
        }
        if self.target_image.trim().is_empty() {
            return Err(RequestError::Missing("target image"));
        }
        if self.timeout_secs == 0 {
            return Err(RequestError::Invalid {
                field: "timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_surge == 0 && self.max_unavailable == 0 {
            return Err(RequestError::Invalid {
                field: "max-surge",
                reason: "max-surge and max-unavailable cannot both be zero".to_string(),
            });
        }
        Ok(())
    }

    /// The patch this request sends to the control plane.
    pub fn image_patch(&self) -> ImagePatch {
        ImagePatch {
            container: self.component.container_name().to_string(),
            image: self.target_image.clone(),
            max_surge: self.max_surge,
            max_unavailable: self.max_unavailable,
        }
    }
}

// ── Session targets ────────────────────────────────────────────────

/// Kind of object a forwarded connection terminates at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Pod,
    Service,
}

impl TargetKind {
    /// Resource prefix as used by kubectl (`pod/x`, `svc/x`).
    pub fn prefix(&self) -> &'static str {
        match self {
            TargetKind::Pod => "pod",
            TargetKind::Service => "svc",
        }
    }
}

/// Remote endpoint of a port-forward session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForwardTarget {
    pub namespace: String,
    pub kind: TargetKind,
    pub name: String,
    pub remote_port: u16,
}

impl fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.namespace,
            self.kind.prefix(),
            self.name,
            self.remote_port
        )
    }
}

/// Source of a log stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogSource {
    /// Logs of a component's workload (kubectl picks a pod).
    Component(ComponentRef),
    /// Logs of one named pod.
    Pod { namespace: String, name: String },
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Component(c) => write!(f, "{c}"),
            LogSource::Pod { namespace, name } => write!(f, "{namespace}/pod/{name}"),
        }
    }
}

/// Options for opening a log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogOptions {
    pub follow: bool,
    pub tail: u32,
    pub previous: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: false,
            tail: 100,
            previous: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RolloutRequest {
        RolloutRequest::new("dev", ComponentRef::new("shop-dev", "api"), "repo/api:v2")
            .with_timeout_secs(60)
    }

    #[test]
    fn valid_request_passes() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn empty_image_is_rejected() {
        let mut req = request();
        req.target_image = "  ".to_string();
        let err = req.validate().unwrap_err();
        assert_eq!(err.to_string(), "missing required field: target image");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let req = request().with_timeout_secs(0);
        let err = req.validate().unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn zero_budget_is_rejected() {
        let mut req = request();
        req.max_surge = 0;
        req.max_unavailable = 0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn patch_defaults_container_to_component_name() {
        let patch = request().image_patch();
        assert_eq!(patch.container, "api");
        assert_eq!(patch.image, "repo/api:v2");
        assert_eq!(patch.max_surge, 1);
        assert_eq!(patch.max_unavailable, 0);

        let mut req = request();
        req.component = req.component.with_container("server");
        assert_eq!(req.image_patch().container, "server");
    }

    #[test]
    fn display_formats() {
        assert_eq!(ComponentRef::new("ns", "api").to_string(), "ns/api");
        let target = ForwardTarget {
            namespace: "ns".to_string(),
            kind: TargetKind::Service,
            name: "api".to_string(),
            remote_port: 8080,
        };
        assert_eq!(target.to_string(), "ns/svc/api:8080");
    }

    #[test]
    fn condition_status_parse() {
        assert_eq!(ConditionStatus::parse("True"), ConditionStatus::True);
        assert_eq!(ConditionStatus::parse("False"), ConditionStatus::False);
        assert_eq!(ConditionStatus::parse("maybe"), ConditionStatus::Unknown);
    }
}
