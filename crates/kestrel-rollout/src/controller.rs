//! Rollout coordinator — drives one image update to a terminal outcome.
//!
//! Steps run strictly in order: apply the image, verify convergence, and
//! on timeout or an explicit stall roll back once and verify again. There
//! is never a second automatic rollback. Transport failures while applying
//! are fatal and are not retried here.
//!
//! Cancellation only stops local waiting. A patch that was already applied
//! stays applied, and no further cluster mutation is issued.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use kestrel_core::cancel::{self, CancelSignal};
use kestrel_core::{ClusterClient, RolloutRequest};
use kestrel_health::{HealthVerifier, Verdict};

use crate::lock::ComponentLocks;
use crate::rollback::{RollbackManager, RollbackOutcome};
use crate::session::{RolloutSession, RolloutState};

/// Terminal result of `update()`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Outcome {
    /// The new image converged.
    Ready,
    /// The new image did not converge; the previous revision was restored.
    /// The requested change still failed.
    RolledBack { reason: String },
    /// Terminal failure. The reason names the phase that produced it.
    Failed(String),
    /// Stopped by the operator before reaching a verdict.
    Cancelled,
}

impl Outcome {
    /// Whether the requested change is live.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Ready)
    }
}

/// Runs rollouts against a cluster.
///
/// Cheap to clone. Clones share the per-component lock, so concurrent
/// `update()` calls for the same component are refused.
#[derive(Clone)]
pub struct RolloutCoordinator {
    client: Arc<dyn ClusterClient>,
    verifier: HealthVerifier,
    rollback: RollbackManager,
    locks: ComponentLocks,
}

impl RolloutCoordinator {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            verifier: HealthVerifier::new(client.clone()),
            rollback: RollbackManager::new(client.clone()),
            locks: ComponentLocks::new(),
            client,
        }
    }

    /// The rollback manager used after failed verification.
    pub fn rollback_manager(&self) -> &RollbackManager {
        &self.rollback
    }

    /// Apply `req`, wait for convergence, and roll back on failure.
    pub async fn update(&self, req: &RolloutRequest, mut cancel: CancelSignal) -> Outcome {
        let mut session = RolloutSession::new(req);
        let outcome = self.run(req, &mut session, &mut cancel).await;
        match &outcome {
            Outcome::Ready => info!(component = %session.component, attempts = session.attempts, "update ready"),
            Outcome::RolledBack { reason } => {
                warn!(component = %session.component, %reason, "update rolled back")
            }
            Outcome::Failed(reason) => {
                error!(component = %session.component, %reason, "update failed")
            }
            Outcome::Cancelled => warn!(component = %session.component, state = ?session.state, "update cancelled"),
        }
        outcome
    }

    async fn run(
        &self,
        req: &RolloutRequest,
        session: &mut RolloutSession,
        cancel: &mut CancelSignal,
    ) -> Outcome {
        let target = &req.component;

        if let Err(e) = req.validate() {
            let reason = format!("invalid request: {e}");
            session.fail(&reason);
            return Outcome::Failed(reason);
        }

        let Some(_guard) = self.locks.try_acquire(target) else {
            let reason = format!("update already in progress for {target}");
            session.fail(&reason);
            return Outcome::Failed(reason);
        };

        // The component must already exist. No retries.
        if let Err(e) = self.client.get_status(target).await {
            let reason = if e.is_not_found() {
                format!("component not found: {target}")
            } else {
                format!("precondition failed: {e}")
            };
            session.fail(&reason);
            return Outcome::Failed(reason);
        }

        if cancel::is_cancelled(cancel) {
            session.advance(RolloutState::Cancelled);
            return Outcome::Cancelled;
        }

        // ── Apply ──────────────────────────────────────────────────
        session.advance(RolloutState::Updating);
        if let Err(e) = self.client.patch_image(target, &req.image_patch()).await {
            let reason = format!("apply failed: {e}");
            session.fail(&reason);
            return Outcome::Failed(reason);
        }

        // ── Verify ─────────────────────────────────────────────────
        session.advance(RolloutState::Verifying);
        let timeout = Duration::from_secs(req.timeout_secs);
        session.restart_deadline(timeout);
        let verification = self.verifier.verify(target, session.deadline, cancel).await;
        session.attempts += verification.attempts;
        session.last_error = verification.last_error.clone();

        match &verification.verdict {
            Verdict::Ready => {
                session.advance(RolloutState::Ready);
                return Outcome::Ready;
            }
            Verdict::Cancelled => {
                session.advance(RolloutState::Cancelled);
                return Outcome::Cancelled;
            }
            Verdict::Timeout | Verdict::Failed(_) => {}
        }
        let verify_reason = format!("verify: {}", verification.describe());

        // ── Roll back ──────────────────────────────────────────────
        session.advance(RolloutState::RollingBack);
        let (rollback, report) = self
            .rollback
            .rollback_with_report(target, timeout, cancel)
            .await;
        if let Some(report) = report {
            session.attempts += report.attempts;
        }

        match rollback {
            RollbackOutcome::Succeeded { restored } => {
                session.advance(RolloutState::RolledBack);
                Outcome::RolledBack {
                    reason: format!(
                        "{verify_reason}; restored revision {} ({})",
                        restored.revision, restored.image
                    ),
                }
            }
            RollbackOutcome::Failed(reason) => {
                let reason = format!("rollback failed: {reason} (after {verify_reason})");
                session.fail(&reason);
                Outcome::Failed(reason)
            }
            RollbackOutcome::Cancelled => {
                session.advance(RolloutState::Cancelled);
                Outcome::Cancelled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_cluster::{ImageBehavior, SimCluster};
    use kestrel_core::ComponentRef;

    fn api() -> ComponentRef {
        ComponentRef::new("shop-dev", "api")
    }

    fn request(image: &str, timeout_secs: u64) -> RolloutRequest {
        RolloutRequest::new("dev", api(), image).with_timeout_secs(timeout_secs)
    }

    #[tokio::test(start_paused = true)]
    async fn ready_on_first_poll_never_undoes() {
        let sim = SimCluster::new().with_workload(&api(), 3, &["repo/api:v1"]);
        let coordinator = RolloutCoordinator::new(Arc::new(sim.clone()));

        let outcome = coordinator
            .update(&request("repo/api:v2", 60), cancel::never())
            .await;
        assert_eq!(outcome, Outcome::Ready);
        assert_eq!(sim.undo_calls(), 0);
        assert_eq!(sim.patch_calls(), 1);
        assert_eq!(sim.current_image(&api()).as_deref(), Some("repo/api:v2"));
    }

    #[tokio::test]
    async fn unreachable_cluster_fails_fast() {
        let sim = SimCluster::new().with_workload(&api(), 3, &["repo/api:v1"]);
        sim.set_unreachable(true);
        let coordinator = RolloutCoordinator::new(Arc::new(sim.clone()));

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            coordinator.update(&request("repo/api:v2", 300), cancel::never()),
        )
        .await
        .expect("update must not wait for the deadline");
        match outcome {
            Outcome::Failed(reason) => assert!(reason.starts_with("precondition failed")),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(sim.patch_calls(), 0);
        assert_eq!(sim.undo_calls(), 0);
    }

    #[tokio::test]
    async fn patch_transport_failure_is_fatal() {
        let sim = SimCluster::new().with_workload(&api(), 3, &["repo/api:v1"]);
        let coordinator = RolloutCoordinator::new(Arc::new(RevokeOnPatch(sim.clone())));

        let outcome = coordinator
            .update(&request("repo/api:v2", 60), cancel::never())
            .await;
        match outcome {
            Outcome::Failed(reason) => {
                assert!(reason.starts_with("apply failed: unauthorized"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(sim.undo_calls(), 0);
        assert_eq!(sim.current_image(&api()).as_deref(), Some("repo/api:v1"));
    }

    /// Revokes credentials just before the patch lands.
    struct RevokeOnPatch(SimCluster);

    #[async_trait::async_trait]
    impl ClusterClient for RevokeOnPatch {
        async fn check_namespace(&self, ns: &str) -> kestrel_core::ClientResult<()> {
            self.0.check_namespace(ns).await
        }
        async fn get_status(
            &self,
            t: &ComponentRef,
        ) -> kestrel_core::ClientResult<kestrel_core::WorkloadStatus> {
            self.0.get_status(t).await
        }
        async fn patch_image(
            &self,
            t: &ComponentRef,
            p: &kestrel_core::ImagePatch,
        ) -> kestrel_core::ClientResult<()> {
            self.0.set_unauthorized(true);
            self.0.patch_image(t, p).await
        }
        async fn get_history(
            &self,
            t: &ComponentRef,
        ) -> kestrel_core::ClientResult<Vec<kestrel_core::Revision>> {
            self.0.get_history(t).await
        }
        async fn undo(&self, t: &ComponentRef) -> kestrel_core::ClientResult<()> {
            self.0.undo(t).await
        }
        async fn open_log_stream(
            &self,
            s: &kestrel_core::LogSource,
            o: &kestrel_core::LogOptions,
        ) -> kestrel_core::ClientResult<kestrel_core::LogStream> {
            self.0.open_log_stream(s, o).await
        }
        async fn open_forward(
            &self,
            t: &kestrel_core::ForwardTarget,
        ) -> kestrel_core::ClientResult<kestrel_core::ForwardStream> {
            self.0.open_forward(t).await
        }
    }

    #[tokio::test]
    async fn missing_component_is_a_precondition_failure() {
        let sim = SimCluster::new().with_workload(&api(), 3, &["repo/api:v1"]);
        let coordinator = RolloutCoordinator::new(Arc::new(sim.clone()));
        let req = RolloutRequest::new("dev", ComponentRef::new("shop-dev", "web"), "repo/web:v2");

        let outcome = coordinator.update(&req, cancel::never()).await;
        assert_eq!(
            outcome,
            Outcome::Failed("component not found: shop-dev/web".to_string())
        );
        assert_eq!(sim.calls().status, 1);
        assert_eq!(sim.patch_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_request_never_touches_cluster() {
        let sim = SimCluster::new().with_workload(&api(), 3, &["repo/api:v1"]);
        let coordinator = RolloutCoordinator::new(Arc::new(sim.clone()));

        let outcome = coordinator.update(&request("", 60), cancel::never()).await;
        match outcome {
            Outcome::Failed(reason) => assert!(reason.contains("target image")),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(sim.calls(), kestrel_cluster::CallCounts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn stall_triggers_rollback() {
        let sim = SimCluster::new()
            .with_workload(&api(), 3, &["repo/api:v1"])
            .with_behavior(
                "repo/api:v2",
                ImageBehavior::Stalls("ProgressDeadlineExceeded".to_string()),
            );
        let coordinator = RolloutCoordinator::new(Arc::new(sim.clone()));

        let outcome = coordinator
            .update(&request("repo/api:v2", 60), cancel::never())
            .await;
        match outcome {
            Outcome::RolledBack { reason } => assert!(reason.contains("ProgressDeadlineExceeded")),
            other => panic!("expected RolledBack, got {other:?}"),
        }
        assert_eq!(sim.undo_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn first_deploy_failure_cannot_roll_back() {
        // Only the broken revision will exist once it is applied over an empty history.
        let sim = SimCluster::new()
            .with_workload(&api(), 3, &[])
            .with_behavior("repo/api:v1", ImageBehavior::Never);
        let coordinator = RolloutCoordinator::new(Arc::new(sim.clone()));

        let outcome = coordinator
            .update(&request("repo/api:v1", 30), cancel::never())
            .await;
        match outcome {
            Outcome::Failed(reason) => {
                assert!(reason.starts_with("rollback failed: no previous revision"))
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(sim.undo_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rollback_is_fatal_and_not_repeated() {
        let sim = SimCluster::new()
            .with_workload(&api(), 3, &["repo/api:v1"])
            .with_behavior("repo/api:v1", ImageBehavior::Never)
            .with_behavior("repo/api:v2", ImageBehavior::Never);
        let coordinator = RolloutCoordinator::new(Arc::new(sim.clone()));

        let outcome = coordinator
            .update(&request("repo/api:v2", 20), cancel::never())
            .await;
        match outcome {
            Outcome::Failed(reason) => {
                assert!(reason.starts_with("rollback failed: rollback did not stabilize"))
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(sim.undo_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_mid_verification_keeps_patch() {
        let sim = SimCluster::new()
            .with_workload(&api(), 3, &["repo/api:v1"])
            .with_behavior("repo/api:v2", ImageBehavior::Never);
        let coordinator = RolloutCoordinator::new(Arc::new(sim.clone()));
        let (tx, rx) = cancel::cancel_pair();

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.update(&request("repo/api:v2", 300), rx).await })
        };
        tokio::time::sleep(Duration::from_secs(12)).await;
        tx.send(true).unwrap();

        assert_eq!(task.await.unwrap(), Outcome::Cancelled);
        assert_eq!(sim.undo_calls(), 0);
        assert_eq!(sim.current_image(&api()).as_deref(), Some("repo/api:v2"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_rollback_wait_stops_after_one_undo() {
        let sim = SimCluster::new()
            .with_workload(&api(), 3, &["repo/api:v1"])
            .with_behavior("repo/api:v1", ImageBehavior::Never)
            .with_behavior("repo/api:v2", ImageBehavior::Never);
        let coordinator = RolloutCoordinator::new(Arc::new(sim.clone()));
        let (tx, rx) = cancel::cancel_pair();

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.update(&request("repo/api:v2", 20), rx).await })
        };
        // Verification gives up at 20s and the undo follows at once.
        tokio::time::sleep(Duration::from_secs(23)).await;
        assert_eq!(sim.undo_calls(), 1);
        tx.send(true).unwrap();

        assert_eq!(task.await.unwrap(), Outcome::Cancelled);
        assert_eq!(sim.undo_calls(), 1);
        assert_eq!(sim.patch_calls(), 1);
        assert_eq!(sim.current_image(&api()).as_deref(), Some("repo/api:v1"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_update_of_same_component_is_refused() {
        let sim = SimCluster::new()
            .with_workload(&api(), 3, &["repo/api:v1"])
            .with_behavior("repo/api:v2", ImageBehavior::ReadyAfter(Duration::from_secs(20)));
        let coordinator = RolloutCoordinator::new(Arc::new(sim.clone()));

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .update(&request("repo/api:v2", 60), cancel::never())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        let second = coordinator
            .update(&request("repo/api:v3", 60), cancel::never())
            .await;
        match second {
            Outcome::Failed(reason) => assert!(reason.starts_with("update already in progress")),
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(first.await.unwrap(), Outcome::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn reapplying_converged_image_is_ready() {
        let sim = SimCluster::new().with_workload(&api(), 3, &["repo/api:v1", "repo/api:v2"]);
        let coordinator = RolloutCoordinator::new(Arc::new(sim.clone()));

        let outcome = coordinator
            .update(&request("repo/api:v2", 60), cancel::never())
            .await;
        assert_eq!(outcome, Outcome::Ready);
        assert_eq!(sim.history(&api()).len(), 2);
    }
}
