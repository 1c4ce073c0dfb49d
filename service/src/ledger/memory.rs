//! In-memory nonce store
//!
//! Backs unit tests and single-process deployments that do not need the
//! ledger to survive restarts. Entries carry their insertion instant so the
//! age-based purge works without a database.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{NonceRecord, NonceStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryNonceStore {
    records: Mutex<HashMap<String, Entry>>,
}

#[derive(Debug, Clone)]
struct Entry {
    timestamp: i64,
    inserted_at: Instant,
}

impl MemoryNonceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    ///
    /// # Errors
    ///
    /// Fails if the map lock is poisoned.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }

    /// Whether the store holds no records.
    ///
    /// # Errors
    ///
    /// Fails if the map lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        // A poisoned lock means a writer panicked mid-update; failing the
        // operation beats silently admitting replays.
        self.records
            .lock()
            .map_err(|_| StoreError::Backend(anyhow::anyhow!("nonce map lock poisoned")))
    }
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
    async fn find(&self, value: &str) -> Result<Option<NonceRecord>, StoreError> {
        let records = self.lock()?;
        Ok(records.get(value).map(|entry| NonceRecord {
            value: value.to_string(),
            timestamp: entry.timestamp,
        }))
    }

    async fn insert(&self, record: &NonceRecord) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        if records.contains_key(&record.value) {
            return Err(StoreError::Duplicate);
        }
        records.insert(
            record.value.clone(),
            Entry {
                timestamp: record.timestamp,
                inserted_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, value: &str, timestamp: Option<i64>) -> Result<u64, StoreError> {
        let mut records = self.lock()?;
        let matches = match (records.get(value), timestamp) {
            (Some(entry), Some(ts)) => entry.timestamp == ts,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            records.remove(value);
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn purge_expired(&self, max_age_secs: u64) -> Result<u64, StoreError> {
        let mut records = self.lock()?;
        let before = records.len();
        let max_age = Duration::from_secs(max_age_secs);
        let now = Instant::now();
        records.retain(|_, entry| now.duration_since(entry.inserted_at) <= max_age);
        Ok((before - records.len()) as u64)
    }
}
