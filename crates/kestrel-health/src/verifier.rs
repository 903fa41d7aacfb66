//! Health verifier — polls a workload until it converges or a deadline passes.
//!
//! The deadline is the only bound. A poll that errors is logged and
//! counted like any other not-ready poll; it never ends verification on
//! its own. Polls run every [`POLL_INTERVAL`], and the last poll lands on
//! the deadline itself.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use kestrel_core::cancel::{self, CancelSignal};
use kestrel_core::{ClusterClient, ComponentRef};

use crate::readiness::{Readiness, assess};

/// Fixed interval between status polls.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How verification ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The workload converged.
    Ready,
    /// The deadline passed before convergence.
    Timeout,
    /// The control plane reported the rollout as failed.
    Failed(String),
    /// Verification was cancelled. Nothing was changed on the cluster.
    Cancelled,
}

/// Outcome of one `verify` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub verdict: Verdict,
    /// Number of status polls issued.
    pub attempts: u32,
    /// Most recent poll error, if any.
    pub last_error: Option<String>,
    /// Most recent reason the workload was not ready.
    pub last_reason: Option<String>,
}

impl Verification {
    fn new(verdict: Verdict, attempts: u32) -> Self {
        Self {
            verdict,
            attempts,
            last_error: None,
            last_reason: None,
        }
    }

    /// A short description of why verification did not succeed.
    pub fn describe(&self) -> String {
        match &self.verdict {
            Verdict::Ready => "ready".to_string(),
            Verdict::Cancelled => "cancelled".to_string(),
            Verdict::Failed(reason) => format!("rollout failed: {reason}"),
            Verdict::Timeout => {
                let mut msg = format!("not ready after {} polls", self.attempts);
                if let Some(reason) = &self.last_reason {
                    msg.push_str(&format!(" ({reason})"));
                }
                if let Some(err) = &self.last_error {
                    msg.push_str(&format!("; last error: {err}"));
                }
                msg
            }
        }
    }
}

/// Polls workload status through a `ClusterClient`.
#[derive(Clone)]
pub struct HealthVerifier {
    client: Arc<dyn ClusterClient>,
    interval: Duration,
}

impl HealthVerifier {
    /// Create a verifier polling every [`POLL_INTERVAL`].
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            interval: POLL_INTERVAL,
        }
    }

    /// Poll `target` until it is ready, explicitly failed, the deadline
    /// passes, or `cancel` fires.
    pub async fn verify(
        &self,
        target: &ComponentRef,
        deadline: Instant,
        cancel: &mut CancelSignal,
    ) -> Verification {
        let mut result = Verification::new(Verdict::Timeout, 0);

        loop {
            if cancel::is_cancelled(cancel) {
                result.verdict = Verdict::Cancelled;
                return result;
            }

            result.attempts += 1;
            // A hung poll may run past the deadline by at most one interval.
            let poll_deadline = deadline.max(Instant::now() + self.interval);
            let polled = tokio::select! {
                _ = cancel::cancelled(cancel) => {
                    result.verdict = Verdict::Cancelled;
                    return result;
                }
                r = tokio::time::timeout_at(poll_deadline, self.client.get_status(target)) => r,
            };

            match polled {
                Ok(Ok(status)) => match assess(&status) {
                    Readiness::Ready => {
                        info!(component = %target, attempts = result.attempts, "workload ready");
                        result.verdict = Verdict::Ready;
                        return result;
                    }
                    Readiness::Stalled { reason } => {
                        warn!(component = %target, %reason, "workload stalled");
                        result.verdict = Verdict::Failed(reason);
                        return result;
                    }
                    Readiness::Progressing { reason } => {
                        debug!(component = %target, attempt = result.attempts, %reason, "not ready yet");
                        result.last_reason = Some(reason);
                    }
                },
                Ok(Err(e)) => {
                    warn!(component = %target, attempt = result.attempts, error = %e, "status poll failed");
                    result.last_error = Some(e.to_string());
                }
                Err(_) => {
                    warn!(component = %target, attempt = result.attempts, "status poll timed out");
                    result.last_error = Some("status poll timed out".to_string());
                }
            }

            let now = Instant::now();
            if now >= deadline {
                info!(component = %target, attempts = result.attempts, "verification deadline passed");
                result.verdict = Verdict::Timeout;
                return result;
            }

            let wake = (now + self.interval).min(deadline);
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = cancel::cancelled(cancel) => {
                    result.verdict = Verdict::Cancelled;
                    return result;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_cluster::{ImageBehavior, SimCluster};
    use kestrel_core::ImagePatch;

    fn api() -> ComponentRef {
        ComponentRef::new("shop-dev", "api")
    }

    async fn rolled_to(behavior: ImageBehavior) -> SimCluster {
        let sim = SimCluster::new()
            .with_workload(&api(), 3, &["repo/api:v1"])
            .with_behavior("repo/api:v2", behavior);
        sim.patch_image(
            &api(),
            &ImagePatch {
                container: "api".to_string(),
                image: "repo/api:v2".to_string(),
                max_surge: 1,
                max_unavailable: 0,
            },
        )
        .await
        .unwrap();
        sim
    }

    #[tokio::test(start_paused = true)]
    async fn ready_on_first_poll() {
        let sim = SimCluster::new().with_workload(&api(), 2, &["repo/api:v1"]);
        let verifier = HealthVerifier::new(Arc::new(sim.clone()));
        let deadline = Instant::now() + Duration::from_secs(60);

        let v = verifier
            .verify(&api(), deadline, &mut cancel::never())
            .await;
        assert_eq!(v.verdict, Verdict::Ready);
        assert_eq!(v.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_ten_seconds() {
        let sim = rolled_to(ImageBehavior::ReadyAfter(Duration::from_secs(10))).await;
        let verifier = HealthVerifier::new(Arc::new(sim));
        let start = Instant::now();

        let v = verifier
            .verify(&api(), start + Duration::from_secs(60), &mut cancel::never())
            .await;
        assert_eq!(v.verdict, Verdict::Ready);
        // Polls at 0s, 5s, 10s.
        assert_eq!(v.attempts, 3);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_deadline() {
        let sim = rolled_to(ImageBehavior::Never).await;
        let verifier = HealthVerifier::new(Arc::new(sim.clone()));
        let start = Instant::now();

        let v = verifier
            .verify(&api(), start + Duration::from_secs(12), &mut cancel::never())
            .await;
        assert_eq!(v.verdict, Verdict::Timeout);
        // Polls at 0s, 5s, 10s, and the deadline at 12s.
        assert_eq!(v.attempts, 4);
        assert!(start.elapsed() >= Duration::from_secs(12));
        assert!(start.elapsed() < Duration::from_secs(13));
        assert!(v.describe().contains("replicas"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let sim = SimCluster::new().with_workload(&api(), 2, &["repo/api:v1"]);
        sim.fail_next_status(2);
        let verifier = HealthVerifier::new(Arc::new(sim.clone()));

        let v = verifier
            .verify(
                &api(),
                Instant::now() + Duration::from_secs(60),
                &mut cancel::never(),
            )
            .await;
        assert_eq!(v.verdict, Verdict::Ready);
        assert_eq!(v.attempts, 3);
        assert!(v.last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn errors_until_deadline_time_out() {
        let sim = SimCluster::new().with_workload(&api(), 2, &["repo/api:v1"]);
        sim.set_unreachable(true);
        let verifier = HealthVerifier::new(Arc::new(sim.clone()));

        let v = verifier
            .verify(
                &api(),
                Instant::now() + Duration::from_secs(20),
                &mut cancel::never(),
            )
            .await;
        assert_eq!(v.verdict, Verdict::Timeout);
        assert!(v.describe().contains("unreachable"));
    }

    #[tokio::test(start_paused = true)]
    async fn stall_fails_early() {
        let sim = rolled_to(ImageBehavior::Stalls("ProgressDeadlineExceeded".to_string())).await;
        let verifier = HealthVerifier::new(Arc::new(sim));

        let v = verifier
            .verify(
                &api(),
                Instant::now() + Duration::from_secs(300),
                &mut cancel::never(),
            )
            .await;
        assert_eq!(
            v.verdict,
            Verdict::Failed("ProgressDeadlineExceeded".to_string())
        );
        assert_eq!(v.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_polling() {
        let sim = rolled_to(ImageBehavior::Never).await;
        let verifier = HealthVerifier::new(Arc::new(sim));
        let (tx, mut rx) = cancel::cancel_pair();

        let handle = tokio::spawn(async move {
            verifier
                .verify(&api(), Instant::now() + Duration::from_secs(300), &mut rx)
                .await
        });
        tokio::time::sleep(Duration::from_secs(7)).await;
        tx.send(true).unwrap();

        let v = handle.await.unwrap();
        assert_eq!(v.verdict, Verdict::Cancelled);
        assert_eq!(v.attempts, 2);
    }
}
