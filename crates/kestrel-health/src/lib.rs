//! kestrel-health — convergence checks for rolled-out workloads.
//!
//! Decides whether a workload has converged after an image change, by
//! polling its status through the cluster client until a deadline.
//!
//! # Architecture
//!
//! ```text
//! HealthVerifier::verify(component, deadline, cancel)
//!   ├── ClusterClient::get_status()   every 5s
//!   ├── assess(status) → Ready | Progressing | Stalled
//!   └── Verdict: Ready | Timeout | Failed(reason) | Cancelled
//! ```
//!
//! Poll errors are transient: they are logged and the loop keeps going
//! until the deadline. Only the deadline, an explicit stall reported by
//! the control plane, or cancellation end verification early.

pub mod readiness;
pub mod verifier;

pub use readiness::{Readiness, assess};
pub use verifier::{HealthVerifier, POLL_INTERVAL, Verdict, Verification};
