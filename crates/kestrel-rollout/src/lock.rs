//! Per-component advisory lock.
//!
//! Two `update()` calls for the same component in one process would race
//! on the control plane. The second caller is turned away instead. The
//! lock is in-process only.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use kestrel_core::ComponentRef;

/// Set of components with an update in flight.
#[derive(Debug, Clone, Default)]
pub struct ComponentLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl ComponentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `target`, or `None` if it is already held.
    pub fn try_acquire(&self, target: &ComponentRef) -> Option<ComponentGuard> {
        let key = target.to_string();
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key.clone()) {
            return None;
        }
        Some(ComponentGuard {
            held: self.held.clone(),
            key,
        })
    }

    pub fn is_held(&self, target: &ComponentRef) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&target.to_string())
    }
}

/// Releases the component lock when dropped.
#[derive(Debug)]
pub struct ComponentGuard {
    held: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for ComponentGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.key);
    }
}
