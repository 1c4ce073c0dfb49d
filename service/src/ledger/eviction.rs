//! Scheduled deletion of consumed nonces
//!
//! Every accepted nonce gets a fire-once task that deletes its record after
//! the retention window. Tasks live in a registry keyed by nonce value so a
//! graceful shutdown can cancel whatever is still pending instead of
//! orphaning timers. A failed delete is logged and dropped: replay safety
//! comes from the record's presence, so a record that outlives its window
//! only wastes space. Timers do not survive a restart; the bulk sweep
//! ([`super::NonceStore::purge_expired`]) reclaims those records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use super::{NonceRecord, NonceStore};

#[derive(Debug, Default)]
pub struct EvictionScheduler {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl EvictionScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule deletion of `record` after `delay`. A pending eviction for
    /// the same nonce value is replaced.
    pub fn schedule(&self, store: Arc<dyn NonceStore>, record: NonceRecord, delay: Duration) {
        let value = record.value.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = store.delete(&record.value, Some(record.timestamp)).await {
                // Best-effort cleanup; the record stays until the next sweep.
                warn!(nonce = %record.value, error = %err, "nonce eviction failed");
            }
        });

        let Ok(mut tasks) = self.tasks.lock() else {
            warn!(nonce = %value, "eviction registry lock poisoned; relying on bulk sweep");
            handle.abort();
            return;
        };
        // Lazy cleanup of entries whose timers already fired.
        tasks.retain(|_, handle| !handle.is_finished());
        if let Some(previous) = tasks.insert(value, handle) {
            previous.abort();
        }
    }

    /// Number of evictions not yet fired.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tasks
            .lock()
            .map(|mut tasks| {
                tasks.retain(|_, handle| !handle.is_finished());
                tasks.len()
            })
            .unwrap_or(0)
    }

    /// Abort every pending eviction.
    pub fn shutdown(&self) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

impl Drop for EvictionScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
