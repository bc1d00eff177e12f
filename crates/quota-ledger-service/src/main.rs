//! Quota Ledger Service
//!
//! Opens the ledger store and runs the reservation sweeper until the
//! process is interrupted.

use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quota_ledger_service::{Ledger, LedgerConfig, Sweeper};
use quota_ledger_store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,quota_ledger=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Quota Ledger Service");

    // Load configuration from environment
    let config = LedgerConfig::from_env();

    tracing::info!(
        data_dir = %config.data_dir,
        refresh_interval = config.refresh_interval,
        reservation_ttl_seconds = config.reservation_ttl_seconds,
        sweep_interval_seconds = config.sweep_interval_seconds,
        expire_on_request = config.expire_on_request,
        lock_timeout_ms = config.lock_timeout_ms,
        "Service configuration loaded"
    );

    #[cfg(feature = "rocksdb-backend")]
    let store = {
        tracing::info!(path = %config.data_dir, "Opening RocksDB store");
        quota_ledger_store::RocksStore::open_with_lock_timeout(
            &config.data_dir,
            config.lock_timeout(),
        )?
    };

    #[cfg(not(feature = "rocksdb-backend"))]
    let store = {
        tracing::warn!("RocksDB backend not enabled - ledger state is kept in memory only");
        quota_ledger_store::MemoryStore::with_lock_timeout(config.lock_timeout())
    };

    run(Arc::new(store), config).await
}

async fn run<S: Store + 'static>(
    store: Arc<S>,
    config: LedgerConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let ledger = Ledger::new(config);

    // Release whatever expired while the service was down
    let sweeper = Sweeper::new(store, ledger);
    let expired = sweeper.sweep().await?;
    tracing::info!(count = expired.len(), "Startup sweep finished");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = sweeper.spawn(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    shutdown_tx.send(true)?;
    handle.await?;

    tracing::info!("Quota Ledger Service stopped");
    Ok(())
}
