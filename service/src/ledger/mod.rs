//! Nonce admission and retention
//!
//! Decides whether a `(nonce, timestamp)` pair accompanying a signed launch
//! is admissible: the timestamp must be fresh and the nonce unseen. Accepted
//! nonces are recorded in the backing store and scheduled for eviction once
//! the retention window elapses. The store is the sole source of truth; no
//! in-process cache of records is kept, so multiple processes can share one
//! ledger table safely.

pub mod eviction;
pub mod memory;
pub mod pg;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::timestamp::{is_fresh, Clock, SystemClock, DEFAULT_LIFETIME_SECS};
use eviction::EvictionScheduler;

pub use memory::MemoryNonceStore;
pub use pg::PgNonceStore;

/// Default seconds a consumed nonce stays blocked from reuse (90 minutes).
pub const DEFAULT_RETENTION_SECS: u64 = 5400;

/// Maximum accepted nonce length, bounding storage abuse.
pub const MAX_NONCE_LENGTH: usize = 64;

/// A consumed nonce as stored. Immutable once written; at most one live
/// record exists per `value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceRecord {
    pub value: String,
    pub timestamp: i64,
}

/// Errors from the storage contract.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("nonce already recorded")]
    Duplicate,
    #[error("storage backend error: {0}")]
    Backend(anyhow::Error),
}

/// Persistence contract for consumed nonces.
///
/// Any backend with a uniqueness guarantee on `value` can satisfy this;
/// the crate ships a Postgres implementation ([`PgNonceStore`]) and an
/// in-memory one ([`MemoryNonceStore`]).
#[async_trait]
pub trait NonceStore: Send + Sync {
    /// Look up the live record for `value`, if any.
    async fn find(&self, value: &str) -> Result<Option<NonceRecord>, StoreError>;

    /// Insert a record. Must fail with [`StoreError::Duplicate`] when a
    /// record for the same `value` already exists, atomically with respect
    /// to concurrent inserts.
    async fn insert(&self, record: &NonceRecord) -> Result<(), StoreError>;

    /// Delete the record for `value`, optionally matching `timestamp` too.
    /// Deleting zero rows is not an error; returns the rows removed.
    async fn delete(&self, value: &str, timestamp: Option<i64>) -> Result<u64, StoreError>;

    /// Bulk-delete records older than `max_age_secs`. Covers records whose
    /// per-record eviction was lost to a process restart.
    async fn purge_expired(&self, max_age_secs: u64) -> Result<u64, StoreError>;
}

/// Why an admission was refused. Expected protocol outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    TimestampExpired,
    NonceReplayed,
}

/// Outcome of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Rejected(RejectReason),
}

/// Errors from ledger operations.
///
/// `InvalidArgument` means the call itself was malformed and is returned
/// before any storage round-trip; `Storage` wraps infrastructure failures
/// unmodified. Policy rejections travel in [`Admission`], never here.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Replay-prevention ledger over a [`NonceStore`].
///
/// Configuration is fixed at construction. The retention window (how long a
/// consumed nonce stays blocked) and the freshness window (how old a
/// presented timestamp may be) are independent knobs.
pub struct NonceLedger {
    store: Arc<dyn NonceStore>,
    clock: Arc<dyn Clock>,
    retention_secs: u64,
    freshness_secs: i64,
    evictions: EvictionScheduler,
}

impl NonceLedger {
    /// Create a ledger with the given windows, in seconds.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidArgument`] if `freshness_secs` is not
    /// positive.
    pub fn new(
        store: Arc<dyn NonceStore>,
        retention_secs: u64,
        freshness_secs: i64,
    ) -> Result<Self, LedgerError> {
        Self::with_clock(store, retention_secs, freshness_secs, Arc::new(SystemClock))
    }

    /// Create a ledger with the protocol-recommended windows.
    ///
    /// # Errors
    ///
    /// Never fails for the default windows; kept fallible for parity with
    /// [`NonceLedger::new`].
    pub fn with_defaults(store: Arc<dyn NonceStore>) -> Result<Self, LedgerError> {
        Self::new(store, DEFAULT_RETENTION_SECS, DEFAULT_LIFETIME_SECS)
    }

    /// Create a ledger with an explicit clock. Tests use this to pin "now".
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidArgument`] if `freshness_secs` is not
    /// positive.
    pub fn with_clock(
        store: Arc<dyn NonceStore>,
        retention_secs: u64,
        freshness_secs: i64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LedgerError> {
        if freshness_secs <= 0 {
            return Err(LedgerError::InvalidArgument(format!(
                "freshness window must be a positive number of seconds; got {freshness_secs}"
            )));
        }
        Ok(Self {
            store,
            clock,
            retention_secs,
            freshness_secs,
            evictions: EvictionScheduler::new(),
        })
    }

    #[must_use]
    pub const fn retention_secs(&self) -> u64 {
        self.retention_secs
    }

    #[must_use]
    pub const fn freshness_secs(&self) -> i64 {
        self.freshness_secs
    }

    /// Number of evictions still pending.
    #[must_use]
    pub fn pending_evictions(&self) -> usize {
        self.evictions.pending()
    }

    /// Admit a `(nonce, timestamp)` pair: check freshness, check the nonce
    /// is unseen, then record it.
    ///
    /// Exactly one [`Admission`] is produced per attempt. On `Accepted`,
    /// one record was durably written and one eviction scheduled; on
    /// `Rejected` the store is untouched. Retrying an already-accepted
    /// nonce yields `Rejected(NonceReplayed)`, never a double accept.
    ///
    /// Two concurrent admits for the same nonce can both pass the lookup;
    /// the store's conditional insert resolves that race, and the loser is
    /// reported as `Rejected(NonceReplayed)`.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidArgument`] for an empty or oversized nonce or
    /// a non-positive timestamp, before any storage call.
    /// [`LedgerError::Storage`] if the store fails.
    pub async fn admit(&self, nonce: &str, timestamp: i64) -> Result<Admission, LedgerError> {
        check_args(nonce, timestamp)?;

        let fresh = is_fresh(timestamp, self.freshness_secs, &*self.clock)
            .map_err(|e| LedgerError::InvalidArgument(e.to_string()))?;
        if !fresh {
            debug!(nonce, timestamp, "admission rejected: expired timestamp");
            return Ok(Admission::Rejected(RejectReason::TimestampExpired));
        }

        if self.store.find(nonce).await?.is_some() {
            debug!(nonce, "admission rejected: nonce replayed");
            return Ok(Admission::Rejected(RejectReason::NonceReplayed));
        }

        match self.record_unchecked(nonce, timestamp).await {
            Ok(()) => {
                debug!(nonce, timestamp, "admission accepted");
                Ok(Admission::Accepted)
            }
            // Lost the race against a concurrent admit for the same nonce.
            Err(StoreError::Duplicate) => {
                debug!(nonce, "admission rejected: nonce replayed (concurrent)");
                Ok(Admission::Rejected(RejectReason::NonceReplayed))
            }
            Err(e) => Err(LedgerError::Storage(e)),
        }
    }

    /// Record a nonce as consumed without freshness or duplicate checks.
    ///
    /// Pre-seeds the nonce as used; the record is scheduled for eviction
    /// after the retention window like any admitted nonce. Unlike
    /// [`NonceLedger::admit`], a duplicate here surfaces as a storage
    /// error rather than a policy rejection.
    ///
    /// # Errors
    ///
    /// [`LedgerError::InvalidArgument`] for malformed arguments,
    /// [`LedgerError::Storage`] on any store failure including
    /// [`StoreError::Duplicate`].
    pub async fn record(&self, nonce: &str, timestamp: i64) -> Result<(), LedgerError> {
        check_args(nonce, timestamp)?;
        self.record_unchecked(nonce, timestamp)
            .await
            .map_err(LedgerError::Storage)
    }

    async fn record_unchecked(&self, nonce: &str, timestamp: i64) -> Result<(), StoreError> {
        let record = NonceRecord {
            value: nonce.to_string(),
            timestamp,
        };
        self.store.insert(&record).await?;
        self.evictions.schedule(
            Arc::clone(&self.store),
            record,
            Duration::from_secs(self.retention_secs),
        );
        Ok(())
    }

    /// Cancel all pending evictions. Call on graceful shutdown; records
    /// whose timers are cancelled are reclaimed later by the bulk sweep.
    pub fn shutdown(&self) {
        self.evictions.shutdown();
    }
}

fn check_args(nonce: &str, timestamp: i64) -> Result<(), LedgerError> {
    if nonce.is_empty() {
        return Err(LedgerError::InvalidArgument(
            "nonce must be a non-empty string".into(),
        ));
    }
    if nonce.len() > MAX_NONCE_LENGTH {
        return Err(LedgerError::InvalidArgument(format!(
            "nonce exceeds {MAX_NONCE_LENGTH} bytes"
        )));
    }
    if timestamp <= 0 {
        return Err(LedgerError::InvalidArgument(format!(
            "timestamp must be a positive whole number of unix seconds; got {timestamp}"
        )));
    }
    Ok(())
}
