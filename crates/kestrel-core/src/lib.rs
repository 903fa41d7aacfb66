//! kestrel-core — shared types, the cluster client interface, and configuration.
//!
//! Every other kestrel crate talks to the control plane through the
//! [`ClusterClient`] trait defined here, so rollout and session logic can
//! be exercised against a simulated cluster.

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod types;

pub use cancel::CancelSignal;
pub use client::{ClusterClient, ForwardIo, ForwardStream, LogStream};
pub use config::{KestrelConfig, ResolvedComponent};
pub use error::{ClientError, ClientResult, ConfigError, RequestError};
pub use types::*;
