//! Rollback manager — restores the previous revision and re-verifies it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use kestrel_core::cancel::{self, CancelSignal};
use kestrel_core::{ClientResult, ClusterClient, ComponentRef, Revision};
use kestrel_health::{HealthVerifier, Verdict, Verification};

/// Used when a caller passes a zero timeout; waits are never unbounded.
pub const DEFAULT_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Result of a rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackOutcome {
    /// The previous revision is live and healthy.
    Succeeded { restored: Revision },
    Failed(String),
    Cancelled,
}

/// Reads revision history, issues undo, and verifies the result.
#[derive(Clone)]
pub struct RollbackManager {
    client: Arc<dyn ClusterClient>,
    verifier: HealthVerifier,
}

impl RollbackManager {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            verifier: HealthVerifier::new(client.clone()),
            client,
        }
    }

    /// Revision history of `target`, oldest first. Read-only.
    pub async fn history(&self, target: &ComponentRef) -> ClientResult<Vec<Revision>> {
        self.client.get_history(target).await
    }

    /// Re-activate the second-to-last revision and wait up to `timeout`
    /// for it to converge.
    pub async fn rollback(
        &self,
        target: &ComponentRef,
        timeout: Duration,
        cancel: &mut CancelSignal,
    ) -> RollbackOutcome {
        self.rollback_with_report(target, timeout, cancel).await.0
    }

    /// Like [`rollback`](Self::rollback), also returning the verification
    /// report when verification ran.
    pub async fn rollback_with_report(
        &self,
        target: &ComponentRef,
        timeout: Duration,
        cancel: &mut CancelSignal,
    ) -> (RollbackOutcome, Option<Verification>) {
        let history = match self.client.get_history(target).await {
            Ok(h) => h,
            Err(e) => {
                return (
                    RollbackOutcome::Failed(format!("history unavailable: {e}")),
                    None,
                );
            }
        };

        if history.len() < 2 {
            warn!(component = %target, revisions = history.len(), "no previous revision to roll back to");
            return (
                RollbackOutcome::Failed("no previous revision".to_string()),
                None,
            );
        }
        let restored = history[history.len() - 2].clone();

        if cancel::is_cancelled(cancel) {
            return (RollbackOutcome::Cancelled, None);
        }

        info!(
            component = %target,
            revision = restored.revision,
            image = %restored.image,
            "rolling back"
        );
        if let Err(e) = self.client.undo(target).await {
            return (RollbackOutcome::Failed(format!("undo failed: {e}")), None);
        }

        let timeout = if timeout.is_zero() {
            DEFAULT_ROLLBACK_TIMEOUT
        } else {
            timeout
        };
        let verification = self
            .verifier
            .verify(target, Instant::now() + timeout, cancel)
            .await;

        let outcome = match &verification.verdict {
            Verdict::Ready => {
                info!(component = %target, revision = restored.revision, "rollback converged");
                RollbackOutcome::Succeeded { restored }
            }
            Verdict::Timeout => RollbackOutcome::Failed("rollback did not stabilize".to_string()),
            Verdict::Failed(reason) => {
                RollbackOutcome::Failed(format!("rollback did not stabilize: {reason}"))
            }
            Verdict::Cancelled => RollbackOutcome::Cancelled,
        };
        (outcome, Some(verification))
    }
}
