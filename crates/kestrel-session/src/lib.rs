//! kestrel ephemeral sessions — log tails and port forwards.
//!
//! ```text
//!             open()                       close() / EOF / Ctrl-C
//!  caller ───────────▶ SessionManager ─────────────────────────────┐
//!                        │  registry (id → session, local ports)   │
//!                        ├─▶ logs pump    cluster ─▶ sink           │
//!                        └─▶ forward pump 127.0.0.1:port ⇄ remote   │
//!                                      Lease dropped ◀──────────────┘
//! ```
//!
//! A session is registered before any I/O happens and deregistered by
//! dropping its lease, so the registry never holds a dead entry and no
//! two live sessions share a local port.

pub mod error;
mod forward;
pub mod logs;
pub mod manager;
pub mod registry;

pub use error::{SessionError, SessionResult};
pub use logs::{LogSink, stdout_sink};
pub use manager::{OpenRequest, SessionHandle, SessionManager};
pub use registry::{ProcessState, SessionId, SessionInfo, SessionTarget};
