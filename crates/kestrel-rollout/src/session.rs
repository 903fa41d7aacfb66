//! Rollout session — the state owned by one `update()` call.
//!
//! A session is created when `update()` starts and discarded when it
//! returns. It only moves forward through the states below; every move is
//! logged.
//!
//! ```text
//! Idle → Updating → Verifying → Ready
//!                       └──→ RollingBack → RolledBack
//!                                    └──→ Failed
//! ```
//!
//! `Failed` is also reachable from `Idle` (precondition) and `Updating`
//! (apply). `Cancelled` is reachable from every non-terminal state.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use kestrel_core::RolloutRequest;

/// Current state of a rollout session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RolloutState {
    Idle,
    /// Image patch issued.
    Updating,
    /// Waiting for the new image to converge.
    Verifying,
    /// Converged on the new image.
    Ready,
    /// Restoring the previous revision.
    RollingBack,
    /// Previous revision restored and healthy.
    RolledBack,
    /// Terminal failure.
    Failed,
    /// Local waiting stopped by the operator.
    Cancelled,
}

impl RolloutState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RolloutState::Ready
                | RolloutState::RolledBack
                | RolloutState::Failed
                | RolloutState::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: RolloutState) -> bool {
        use RolloutState::*;
        if next == Cancelled {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Idle, Updating)
                | (Idle, Failed)
                | (Updating, Verifying)
                | (Updating, Failed)
                | (Verifying, Ready)
                | (Verifying, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, Failed)
        )
    }
}

/// Mutable state of one rollout.
#[derive(Debug, Clone)]
pub struct RolloutSession {
    pub component: String,
    pub target_image: String,
    pub state: RolloutState,
    pub started_at: Instant,
    /// Absolute verification deadline: start + timeout.
    pub deadline: Instant,
    /// Health polls issued so far, across verify and rollback.
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl RolloutSession {
    /// Start a session for `req`. The deadline counts from now.
    pub fn new(req: &RolloutRequest) -> Self {
        let started_at = Instant::now();
        Self {
            component: req.component.to_string(),
            target_image: req.target_image.clone(),
            state: RolloutState::Idle,
            started_at,
            deadline: started_at + Duration::from_secs(req.timeout_secs),
            attempts: 0,
            last_error: None,
        }
    }

    /// Move to `next`. Illegal moves are logged and ignored.
    pub fn advance(&mut self, next: RolloutState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!(
                component = %self.component,
                from = ?self.state,
                to = ?next,
                "ignoring illegal rollout transition"
            );
            return false;
        }
        info!(
            component = %self.component,
            image = %self.target_image,
            from = ?self.state,
            to = ?next,
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "rollout transition"
        );
        self.state = next;
        true
    }

    /// Record a failure reason and move to `Failed`.
    pub fn fail(&mut self, reason: &str) {
        self.last_error = Some(reason.to_string());
        self.advance(RolloutState::Failed);
    }

    /// Reset the deadline to `timeout` from now.
    pub fn restart_deadline(&mut self, timeout: Duration) {
        self.deadline = Instant::now() + timeout;
    }
}
