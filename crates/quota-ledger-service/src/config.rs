//! Ledger configuration.

use std::time::Duration;

/// Ledger configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Path to `RocksDB` data directory (default: "/data/quota-ledger").
    pub data_dir: String,

    /// Quota decisions a usage row informs before it must be resynchronized
    /// (default: 0, never).
    pub refresh_interval: i64,

    /// Lifetime of a reservation created without an explicit expiry
    /// (default: 86400).
    pub reservation_ttl_seconds: i64,

    /// Seconds between expiry sweeps (default: 60).
    pub sweep_interval_seconds: u64,

    /// Sweep expired reservations before serving each reservation request
    /// (default: false).
    pub expire_on_request: bool,

    /// Row lock wait in milliseconds (default: 1000).
    pub lock_timeout_ms: u64,

    /// Refreshes run concurrently by the refresher (default: 8).
    pub refresh_concurrency: usize,
}

impl LedgerConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            refresh_interval: std::env::var("REFRESH_INTERVAL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.refresh_interval),
            reservation_ttl_seconds: std::env::var("RESERVATION_TTL_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.reservation_ttl_seconds),
            sweep_interval_seconds: std::env::var("SWEEP_INTERVAL_SECONDS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.sweep_interval_seconds),
            expire_on_request: std::env::var("EXPIRE_ON_REQUEST")
                .ok()
                .map_or(defaults.expire_on_request, |s| parse_flag(&s)),
            lock_timeout_ms: std::env::var("LOCK_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.lock_timeout_ms),
            refresh_concurrency: std::env::var("REFRESH_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.refresh_concurrency),
        }
    }

    /// Default reservation lifetime.
    #[must_use]
    pub fn reservation_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.reservation_ttl_seconds)
    }

    /// Time between expiry sweeps.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// Row lock wait.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: "/data/quota-ledger".into(),
            refresh_interval: 0,
            reservation_ttl_seconds: 86_400,
            sweep_interval_seconds: 60,
            expire_on_request: false,
            lock_timeout_ms: 1000,
            refresh_concurrency: 8,
        }
    }
}
