//! Postgres nonce store integration tests.
//!
//! Each test starts a disposable Postgres container. They are ignored by
//! default so the suite passes on machines without Docker; run them with
//! `cargo test -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use nonce_ledger::config::DatabaseConfig;
use nonce_ledger::db::{seed_demo_nonce, setup_database, DEMO_NONCE, DEMO_TIMESTAMP};
use nonce_ledger::ledger::{
    Admission, LedgerError, NonceLedger, NonceRecord, NonceStore, PgNonceStore, RejectReason,
    StoreError,
};
use testcontainers::{runners::AsyncRunner, ContainerAsync, GenericImage, ImageExt};

/// Start a Postgres container and return it alongside a migrated pool.
/// The container must stay alive for the duration of the test.
async fn start_postgres() -> (ContainerAsync<GenericImage>, sqlx::PgPool) {
    let container = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.into())
        .with_wait_for(testcontainers::core::WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "nonce-ledger")
        .start()
        .await
        .expect("start postgres container");

    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("postgres port");

    let config = DatabaseConfig {
        host: "127.0.0.1".into(),
        port,
        name: "nonce-ledger".into(),
        user: "postgres".into(),
        password: "postgres".into(),
        max_connections: 5,
        migrations_dir: None,
    };

    // setup_database retries while the container finishes its first boot,
    // then applies the migrations.
    let pool = setup_database(&config).await.expect("setup database");
    (container, pool)
}

#[tokio::test]
#[ignore = "requires docker"]
async fn conditional_insert_rejects_duplicate() {
    let (_container, pool) = start_postgres().await;
    let store = PgNonceStore::with_default_table(pool);

    let record = NonceRecord {
        value: "pg-nonce-1".into(),
        timestamp: 1_530_626_551,
    };
    store.insert(&record).await.expect("first insert");

    let err = store.insert(&record).await.expect_err("duplicate insert");
    assert!(matches!(err, StoreError::Duplicate));

    let found = store.find("pg-nonce-1").await.expect("find");
    assert_eq!(found, Some(record));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn ledger_accepts_once_then_rejects_replay() {
    let (_container, pool) = start_postgres().await;
    let store = Arc::new(PgNonceStore::with_default_table(pool));
    let ledger = NonceLedger::with_defaults(store).expect("ledger");

    let now = chrono::Utc::now().timestamp();
    let first = ledger.admit("pg-launch-nonce", now).await.expect("admit");
    assert_eq!(first, Admission::Accepted);

    let second = ledger.admit("pg-launch-nonce", now).await.expect("admit");
    assert_eq!(second, Admission::Rejected(RejectReason::NonceReplayed));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn per_record_eviction_clears_the_row() {
    let (_container, pool) = start_postgres().await;
    let store = Arc::new(PgNonceStore::with_default_table(pool));
    let ledger = NonceLedger::new(store.clone(), 1, 5400).expect("ledger");

    let now = chrono::Utc::now().timestamp();
    ledger.admit("short-lived", now).await.expect("admit");
    assert!(store.find("short-lived").await.expect("find").is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(store.find("short-lived").await.expect("find").is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn purge_removes_only_aged_records() {
    let (_container, pool) = start_postgres().await;
    let store = PgNonceStore::with_default_table(pool.clone());

    store
        .insert(&NonceRecord {
            value: "old-nonce".into(),
            timestamp: 1_530_626_551,
        })
        .await
        .expect("insert old");
    store
        .insert(&NonceRecord {
            value: "new-nonce".into(),
            timestamp: 1_530_626_552,
        })
        .await
        .expect("insert new");

    // Backdate one row past the retention window.
    sqlx::query("UPDATE nonce_store SET created_at = now() - interval '2 hours' WHERE value = $1")
        .bind("old-nonce")
        .execute(&pool)
        .await
        .expect("backdate");

    let deleted = store.purge_expired(5400).await.expect("purge");
    assert_eq!(deleted, 1);
    assert!(store.find("old-nonce").await.expect("find").is_none());
    assert!(store.find("new-nonce").await.expect("find").is_some());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn missing_table_surfaces_as_storage_error() {
    let (_container, pool) = start_postgres().await;
    let store = Arc::new(PgNonceStore::new(pool, "launch_nonces").expect("valid table name"));
    let ledger = NonceLedger::with_defaults(store).expect("ledger");

    let now = chrono::Utc::now().timestamp();
    let err = ledger
        .admit("any-nonce", now)
        .await
        .expect_err("table does not exist");
    assert!(matches!(err, LedgerError::Storage(StoreError::Backend(_))));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn seeded_demo_nonce_is_expired_and_blocked() {
    let (_container, pool) = start_postgres().await;
    seed_demo_nonce(&pool, "nonce_store").await.expect("seed");
    // Seeding twice is a no-op.
    seed_demo_nonce(&pool, "nonce_store").await.expect("reseed");

    let store = Arc::new(PgNonceStore::with_default_table(pool));
    assert_eq!(
        store.find(DEMO_NONCE).await.expect("find"),
        Some(NonceRecord {
            value: DEMO_NONCE.into(),
            timestamp: DEMO_TIMESTAMP,
        })
    );

    // Against the real clock the fixture's 2018 timestamp is long expired,
    // so freshness rejects it before the replay check even runs.
    let ledger = NonceLedger::with_defaults(store).expect("ledger");
    let outcome = ledger.admit(DEMO_NONCE, DEMO_TIMESTAMP).await.expect("admit");
    assert_eq!(outcome, Admission::Rejected(RejectReason::TimestampExpired));
}
