//! Postgres nonce store
//!
//! Persists consumed nonces in a table with a primary key on the nonce
//! value. The primary key is what makes admission safe across concurrent
//! requests and across processes: the insert is conditional, so of two
//! racing admits for the same nonce exactly one lands a row.
//!
//! Table shape (see `migrations/`):
//!
//! ```sql
//! CREATE TABLE nonce_store (
//!     value      TEXT PRIMARY KEY,
//!     timestamp  BIGINT NOT NULL,
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! ```

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::{LedgerError, NonceRecord, NonceStore, StoreError};

/// Default table name for the ledger.
pub const DEFAULT_TABLE: &str = "nonce_store";

/// [`NonceStore`] backed by a Postgres table.
#[derive(Debug, Clone)]
pub struct PgNonceStore {
    pool: PgPool,
    table: String,
}

impl PgNonceStore {
    /// Create a store against the given table.
    ///
    /// The table name is interpolated into SQL text, so it must be a plain
    /// identifier; anything else is rejected up front.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidArgument`] if `table` is not a valid
    /// unquoted SQL identifier.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Result<Self, LedgerError> {
        let table = table.into();
        if !is_safe_identifier(&table) {
            return Err(LedgerError::InvalidArgument(format!(
                "table name '{table}' is not a plain SQL identifier"
            )));
        }
        Ok(Self { pool, table })
    }

    /// Create a store against the default `nonce_store` table.
    #[must_use]
    pub fn with_default_table(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE.to_string(),
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }
}

#[async_trait]
impl NonceStore for PgNonceStore {
    async fn find(&self, value: &str) -> Result<Option<NonceRecord>, StoreError> {
        let row = sqlx::query(&format!(
            r#"SELECT value, "timestamp" FROM {} WHERE value = $1"#,
            self.table
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|row| {
            Ok(NonceRecord {
                value: row.try_get("value").map_err(db_error)?,
                timestamp: row.try_get("timestamp").map_err(db_error)?,
            })
        })
        .transpose()
    }

    async fn insert(&self, record: &NonceRecord) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            r#"INSERT INTO {} (value, "timestamp") VALUES ($1, $2) ON CONFLICT (value) DO NOTHING"#,
            self.table
        ))
        .bind(&record.value)
        .bind(record.timestamp)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate);
        }
        Ok(())
    }

    async fn delete(&self, value: &str, timestamp: Option<i64>) -> Result<u64, StoreError> {
        let result = match timestamp {
            Some(ts) => sqlx::query(&format!(
                r#"DELETE FROM {} WHERE value = $1 AND "timestamp" = $2"#,
                self.table
            ))
            .bind(value)
            .bind(ts)
            .execute(&self.pool)
            .await
            .map_err(db_error)?,
            None => sqlx::query(&format!("DELETE FROM {} WHERE value = $1", self.table))
                .bind(value)
                .execute(&self.pool)
                .await
                .map_err(db_error)?,
        };
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, max_age_secs: u64) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE created_at < now() - make_interval(secs => $1::float8)",
            self.table
        ))
        .bind(i64::try_from(max_age_secs).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }
}

fn db_error(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.into())
}

/// Whether `name` can be spliced into SQL text as an unquoted identifier.
pub(crate) fn is_safe_identifier(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_boundaries() {
        let cases = [
            ("nonce_store", true, "default table"),
            ("_private", true, "leading underscore"),
            ("t1", true, "trailing digit"),
            ("", false, "empty"),
            ("1table", false, "leading digit"),
            ("nonce-store", false, "hyphen"),
            ("nonce store", false, "space"),
            ("store;drop table x", false, "injection attempt"),
        ];

        for (name, should_pass, desc) in cases {
            assert_eq!(is_safe_identifier(name), should_pass, "case '{desc}'");
        }

        assert!(is_safe_identifier(&"x".repeat(63)));
        assert!(!is_safe_identifier(&"x".repeat(64)));
    }
}
