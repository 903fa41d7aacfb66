//! kestrel rollouts — apply an image, verify it, roll back on failure.
//!
//! ```text
//!   RolloutRequest
//!        │
//!        ▼
//!  ┌──────────────┐  patch   ┌──────────────┐
//!  │  Rollout     │─────────▶│ ClusterClient│
//!  │  Coordinator │◀─────────│              │
//!  └──────┬───────┘  status  └──────────────┘
//!         │ not ready by deadline / stalled
//!         ▼
//!  ┌──────────────┐  undo + verify (once)
//!  │  Rollback    │──────────────────────▶ RolledBack | Failed
//!  │  Manager     │
//!  └──────────────┘
//! ```
//!
//! # Components
//!
//! - **`controller`** — `RolloutCoordinator::update`, the top-level flow
//! - **`session`** — per-update state machine
//! - **`rollback`** — history lookup, undo, and post-rollback verification
//! - **`lock`** — refuses concurrent updates of one component

pub mod controller;
pub mod lock;
pub mod rollback;
pub mod session;

pub use controller::{Outcome, RolloutCoordinator};
pub use lock::{ComponentGuard, ComponentLocks};
pub use rollback::{DEFAULT_ROLLBACK_TIMEOUT, RollbackManager, RollbackOutcome};
pub use session::{RolloutSession, RolloutState};
