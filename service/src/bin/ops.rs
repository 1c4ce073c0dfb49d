#![deny(
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::unwrap_used
)]

use clap::{Parser, Subcommand};
use nonce_ledger::config::Config;
use nonce_ledger::db::{seed_demo_nonce, setup_database};
use nonce_ledger::ledger::{NonceStore, PgNonceStore};

/// Operational tasks for the nonce ledger: schema setup, demo seeding, and
/// the bulk sweep that reclaims records whose eviction timers were lost to
/// a restart.
#[derive(Parser)]
#[command(name = "ops", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect to the database and apply pending migrations
    Migrate,
    /// Insert the demo nonce fixture (idempotent)
    Seed,
    /// Delete consumed nonces older than the retention window
    Sweep {
        /// Override the configured retention window, in seconds
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Load and validate configuration first (fail-fast)
    let config = Config::load().map_err(|e| anyhow::anyhow!("{e}"))?;

    // Set up logging from config
    std::env::set_var("RUST_LOG", &config.logging.level);
    tracing_subscriber::fmt::init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "nonce-ledger ops starting"
    );

    let pool = setup_database(&config.database).await?;

    match cli.command {
        Command::Migrate => {
            // setup_database already applied migrations
            tracing::info!("database schema is up to date");
        }
        Command::Seed => {
            seed_demo_nonce(&pool, &config.ledger.table_name).await?;
        }
        Command::Sweep { max_age_secs } => {
            let store = PgNonceStore::new(pool, config.ledger.table_name.clone())?;
            let max_age = max_age_secs.unwrap_or(config.ledger.retention_secs);
            let deleted = store.purge_expired(max_age).await?;
            tracing::info!(deleted, max_age_secs = max_age, "sweep complete");
        }
    }

    Ok(())
}
