//! kestrel-cluster — concrete cluster clients.
//!
//! - **`kubectl`** — [`KubectlClient`], which drives a real cluster through
//!   the `kubectl` binary
//! - **`sim`** — [`SimCluster`], an in-memory cluster with scripted
//!   readiness, used by tests and by `kestrel --simulate`

pub mod kubectl;
pub mod sim;

pub use kubectl::KubectlClient;
pub use sim::{CallCounts, ForwardBehavior, ImageBehavior, SimCluster};
