//! Session registry — the only shared mutable state of a `SessionManager`.
//!
//! Allocating a local port and registering the session that owns it happen
//! under one lock, so two concurrent opens can never hold the same port.
//! Nothing inside the lock performs I/O.
//!
//! Every registered session is represented by a [`Lease`]. Dropping the
//! lease removes the entry, frees its port, and publishes `Closed`, so
//! cleanup runs on every exit path: explicit close, stream end, task abort.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use kestrel_core::{ForwardTarget, LogSource};

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Opening,
    Streaming,
    Closing,
    Closed,
}

/// What a session streams. Tagged `type`; the wrapped targets carry
/// their own `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionTarget {
    LogStream(LogSource),
    PortForward(ForwardTarget),
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionTarget::LogStream(source) => write!(f, "logs {source}"),
            SessionTarget::PortForward(target) => write!(f, "forward {target}"),
        }
    }
}

/// Snapshot of one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub target: SessionTarget,
    /// Bound local port. Log sessions have none.
    pub local_port: Option<u16>,
    pub state: ProcessState,
}

struct Entry {
    info: SessionInfo,
    cancel: watch::Sender<bool>,
    state_rx: watch::Receiver<ProcessState>,
}

#[derive(Default)]
struct Table {
    next_id: u64,
    entries: BTreeMap<SessionId, Entry>,
}

impl Table {
    fn port_taken(&self, port: u16) -> bool {
        self.entries
            .values()
            .any(|e| e.info.local_port == Some(port))
    }
}

/// How a session wants its local port chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortChoice {
    Exact(u16),
    /// First free port in `base..base + count`.
    Scan { base: u16, count: u16 },
}

/// Outcome of a port reservation attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Reserved {
    Port(u16),
    Taken(u16),
    Exhausted,
}

/// Shared session table.
#[derive(Clone, Default)]
pub(crate) struct Registry {
    table: Arc<Mutex<Table>>,
}

impl Registry {
    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new session in `Opening` with no port yet.
    pub(crate) fn register(&self, target: SessionTarget) -> (Lease, watch::Receiver<bool>) {
        let (cancel, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ProcessState::Opening);
        let mut table = self.table();
        table.next_id += 1;
        let id = SessionId(table.next_id);
        table.entries.insert(
            id,
            Entry {
                info: SessionInfo {
                    id,
                    target,
                    local_port: None,
                    state: ProcessState::Opening,
                },
                cancel,
                state_rx,
            },
        );
        drop(table);
        debug!(session = %id, "session registered");
        (
            Lease {
                id,
                registry: self.clone(),
                state: state_tx,
            },
            cancel_rx,
        )
    }

    /// Pick a local port for `id` and record it, atomically with respect
    /// to every other reservation. `skip` lists ports that failed to bind.
    pub(crate) fn reserve_port(
        &self,
        id: SessionId,
        choice: PortChoice,
        skip: &HashSet<u16>,
    ) -> Reserved {
        let mut table = self.table();
        let port = match choice {
            PortChoice::Exact(port) => {
                if table.port_taken(port) {
                    return Reserved::Taken(port);
                }
                port
            }
            PortChoice::Scan { base, count } => {
                let found = (0..count as u32)
                    .map(|i| base as u32 + i)
                    .take_while(|p| *p <= u16::MAX as u32)
                    .map(|p| p as u16)
                    .find(|p| !skip.contains(p) && !table.port_taken(*p));
                match found {
                    Some(port) => port,
                    None => return Reserved::Exhausted,
                }
            }
        };
        if let Some(entry) = table.entries.get_mut(&id) {
            entry.info.local_port = Some(port);
        }
        Reserved::Port(port)
    }

    /// Send cancel to a session and mark it `Closing`. Returns a receiver
    /// that observes its state, or `None` if the session is gone.
    pub(crate) fn request_close(&self, id: SessionId) -> Option<watch::Receiver<ProcessState>> {
        let mut table = self.table();
        let entry = table.entries.get_mut(&id)?;
        if entry.info.state != ProcessState::Closed {
            entry.info.state = ProcessState::Closing;
        }
        let _ = entry.cancel.send(true);
        Some(entry.state_rx.clone())
    }

    pub(crate) fn ids(&self) -> Vec<SessionId> {
        self.table().entries.keys().copied().collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<SessionInfo> {
        self.table()
            .entries
            .values()
            .map(|e| e.info.clone())
            .collect()
    }

    fn set_state(&self, id: SessionId, state: ProcessState) {
        if let Some(entry) = self.table().entries.get_mut(&id) {
            // A close request wins over a late `Streaming`.
            if entry.info.state == ProcessState::Closing && state == ProcessState::Streaming {
                return;
            }
            entry.info.state = state;
        }
    }

    fn remove(&self, id: SessionId) {
        self.table().entries.remove(&id);
    }
}

/// Ownership of one registry entry. Dropping it closes the session.
pub(crate) struct Lease {
    id: SessionId,
    registry: Registry,
    state: watch::Sender<ProcessState>,
}

impl Lease {
    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: ProcessState) {
        self.registry.set_state(self.id, state);
        self.state.send_replace(state);
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        self.state.send_replace(ProcessState::Closed);
        debug!(session = %self.id, "session closed");
    }
}
