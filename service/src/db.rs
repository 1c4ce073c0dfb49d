use sqlx_core::migrate::Migrator;
use sqlx_postgres::{PgPool, PgPoolOptions};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::DatabaseConfig;

/// Nonce value of the demo fixture row, from a captured 2018 launch.
pub const DEMO_NONCE: &str = "72eb4648a1ea65ae644dc415bf7318cf";
/// Timestamp presented alongside [`DEMO_NONCE`].
pub const DEMO_TIMESTAMP: i64 = 1_530_626_551;

/// Connect to the database and run migrations
///
/// # Errors
///
/// Fails when Postgres stays unreachable past the retry budget or when a
/// migration cannot be applied.
pub async fn setup_database(config: &DatabaseConfig) -> Result<PgPool, anyhow::Error> {
    let retry_deadline = Duration::from_secs(60); // overall retry budget
    let max_interval = Duration::from_secs(30); // cap single waits
    let mut delay = Duration::from_millis(500);
    let start = Instant::now();

    let pool = loop {
        info!("Attempting to connect to Postgres...");

        match PgPoolOptions::new()
            .max_connections(config.max_connections)
            // Allow extra time to acquire a connection during startup bursts
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.connection_url())
            .await
        {
            Ok(pool) => break pool,
            Err(err) => {
                if start.elapsed() >= retry_deadline {
                    warn!(error = %err, "Postgres not ready; retries exhausted");
                    return Err(err.into());
                }

                warn!(error = %err, "Postgres not ready yet; retrying");
                sleep(delay).await;
                delay = (delay.saturating_mul(2)).min(max_interval);
            }
        }
    };

    // Run database migrations from the crate's migrations directory unless
    // the config points elsewhere
    let default_dir = concat!(env!("CARGO_MANIFEST_DIR"), "/migrations");
    let migrations_dir = config.migrations_dir.as_deref().unwrap_or(default_dir);
    let migrator = Migrator::new(std::path::Path::new(migrations_dir)).await?;
    migrator.run(&pool).await?;
    info!("Migrations applied");
    Ok(pool)
}

/// Insert the demo nonce fixture into `table`, idempotently.
///
/// The fixture is a nonce that was consumed long ago; admitting it again
/// demonstrates both the replay rejection and, evaluated against today's
/// clock, the expired-timestamp rejection. Test and demo data only.
/// `table` must already be a validated identifier (config validation
/// guarantees this for `ledger.table_name`).
///
/// # Errors
///
/// Returns the underlying error if the insert fails.
pub async fn seed_demo_nonce(pool: &PgPool, table: &str) -> Result<(), sqlx::Error> {
    let result = sqlx::query(&format!(
        r#"INSERT INTO {table} (value, "timestamp") VALUES ($1, $2) ON CONFLICT (value) DO NOTHING"#,
    ))
    .bind(DEMO_NONCE)
    .bind(DEMO_TIMESTAMP)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        info!(nonce = DEMO_NONCE, "demo nonce already present");
    } else {
        info!(nonce = DEMO_NONCE, "demo nonce seeded");
    }
    Ok(())
}
