//! Per-plugin operation serialization
//!
//! Lifecycle operations against one plugin id are totally ordered by holding
//! that id's async mutex for the duration of the operation. Different ids
//! never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

/// Keyed set of async mutexes
#[derive(Clone, Default)]
pub struct PluginLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl PluginLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `plugin_id`
    pub async fn acquire(&self, plugin_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(plugin_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Try to take the lock without waiting
    pub fn try_acquire(&self, plugin_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry(plugin_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.try_lock_owned().ok()
    }

    /// Drop the entry for a removed plugin.
    ///
    /// Holders of an outstanding guard keep their mutex alive; the next
    /// `acquire` creates a fresh one.
    pub fn forget(&self, plugin_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(plugin_id);
    }
}

impl std::fmt::Debug for PluginLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.locks.lock().map(|l| l.len()).unwrap_or_default();
        f.debug_struct("PluginLocks").field("keys", &count).finish()
    }
}
