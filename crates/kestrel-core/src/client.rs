//! The control-plane collaborator.
//!
//! `ClusterClient` is everything the controller needs from a cluster:
//! observe a workload, patch its image, read and undo revisions, and
//! open byte streams for logs and forwarded connections. Implementations
//! must be safe to share between concurrent rollouts and sessions.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ClientResult;
use crate::types::{
    ComponentRef, ForwardTarget, ImagePatch, LogOptions, LogSource, Revision, WorkloadStatus,
};

/// Read half of a log stream. Dropping it closes the stream.
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

/// A bidirectional byte stream to a remote port.
pub trait ForwardIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ForwardIo for T {}

/// A forwarded connection. Dropping it closes the connection.
pub type ForwardStream = Box<dyn ForwardIo>;

/// Typed interface to the cluster control plane.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Verify the namespace exists and the control plane answers.
    async fn check_namespace(&self, namespace: &str) -> ClientResult<()>;

    /// Current status of a workload. `ClientError::NotFound` if absent.
    async fn get_status(&self, target: &ComponentRef) -> ClientResult<WorkloadStatus>;

    /// Set the container image (and rolling-update budget). Idempotent
    /// when the image is unchanged.
    async fn patch_image(&self, target: &ComponentRef, patch: &ImagePatch) -> ClientResult<()>;

    /// Revision history, oldest first.
    async fn get_history(&self, target: &ComponentRef) -> ClientResult<Vec<Revision>>;

    /// Reactivate the previous revision.
    async fn undo(&self, target: &ComponentRef) -> ClientResult<()>;

    /// Open a read-only log stream.
    async fn open_log_stream(
        &self,
        source: &LogSource,
        opts: &LogOptions,
    ) -> ClientResult<LogStream>;

    /// Open one forwarded connection to the target's remote port.
    async fn open_forward(&self, target: &ForwardTarget) -> ClientResult<ForwardStream>;
}
