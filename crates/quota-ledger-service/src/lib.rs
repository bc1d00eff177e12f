//! Quota ledger engine.
//!
//! This crate provides the accounting engine of the quota ledger, including:
//!
//! - Service, category and resource registration
//! - Usage rows and their refresh protocol
//! - Quota records and most-specific-first quota resolution
//! - Reservations: reserve, commit, rollback and expiry
//!
//! plus the background pieces a deployment runs next to it: the
//! [`Sweeper`] that expires abandoned reservations and the [`Refresher`]
//! that resynchronizes usage with the client services.
//!
//! # Transactions
//!
//! Engine operations never begin or commit transactions. They take the open
//! transaction of a [`quota_ledger_store::Store`] as their first argument so
//! callers control the unit of work.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Some engine methods only need the transaction
#![allow(clippy::unused_self)]

pub mod config;
pub mod ledger;
pub mod refresh;
pub mod sweeper;

pub use config::LedgerConfig;
pub use ledger::{Ledger, NewUsage, RefreshTicket, ReservationReceipt, Reserved};
pub use refresh::{Refresher, UsageCounter};
pub use sweeper::Sweeper;

use quota_ledger_core::{LedgerError, Result};

/// Run store work on tokio's blocking pool so row lock waits never stall a
/// runtime worker.
async fn offload<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LedgerError::Storage(format!("store task failed: {e}")))?
}
