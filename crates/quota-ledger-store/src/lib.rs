//! Transactional storage layer for the quota ledger.
//!
//! This crate provides the storage seam the ledger engine runs against. The
//! engine never opens connections itself: a caller begins a transaction on a
//! [`Store`], passes the handle into each ledger operation, and commits or
//! rolls back when done.
//!
//! # Architecture
//!
//! - [`KvTransaction`]: the raw, column-family keyed transaction each backend
//!   implements. `get_for_update` and every write take a row lock that is
//!   held until the transaction ends.
//! - [`Tables`]: typed record access and unique indexes, implemented once
//!   on top of any [`KvTransaction`].
//! - [`MemoryStore`]: in-process backend.
//! - `RocksStore`: `RocksDB` `TransactionDB` backend (feature
//!   `rocksdb-backend`).
//!
//! # Example
//!
//! ```no_run
//! use quota_ledger_core::LedgerError;
//! use quota_ledger_store::{MemoryStore, Store, Tables};
//!
//! let store = MemoryStore::new();
//! let services = store.transaction(|tx| {
//!     Ok::<_, LedgerError>(tx.services()?)
//! })?;
//! # Ok::<(), LedgerError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod memory;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
pub mod schema;
pub mod tables;

pub use error::{Result, StoreError};
pub use memory::{MemoryStore, MemoryTransaction};
#[cfg(feature = "rocksdb-backend")]
pub use rocks::{RocksStore, RocksTransaction};
pub use tables::Tables;

use std::time::Duration;

/// Default time a transaction waits for a row lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(1000);

/// A transaction over column-family keyed rows.
///
/// Reads see the transaction's own uncommitted writes. Dropping a
/// transaction without committing rolls it back and releases its locks.
pub trait KvTransaction {
    /// Read a row without locking it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Lock a row (present or not) until the transaction ends, then read its
    /// latest committed value.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LockTimeout` if another transaction holds the lock
    /// for longer than the configured timeout.
    fn get_for_update(&mut self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Write a row, locking it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LockTimeout` if the row is locked elsewhere.
    fn put(&mut self, cf: &'static str, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete a row, locking it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LockTimeout` if the row is locked elsewhere.
    fn delete(&mut self, cf: &'static str, key: &[u8]) -> Result<()>;

    /// Read every row whose key starts with `prefix`, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn scan_prefix(&self, cf: &'static str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Read every row with `start <= key < end`, in key order. Rows past
    /// `end` are never read.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn scan_range(
        &self,
        cf: &'static str,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply every write atomically and release all locks.
    ///
    /// # Errors
    ///
    /// Returns an error if the database rejects the commit; nothing is
    /// applied in that case.
    fn commit(self) -> Result<()>
    where
        Self: Sized;

    /// Discard every write and release all locks.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn rollback(self) -> Result<()>
    where
        Self: Sized;
}

/// A store that hands out transactions.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., `RocksDB`, in-memory for testing).
pub trait Store: Send + Sync {
    /// The transaction type of this backend.
    type Transaction<'a>: KvTransaction
    where
        Self: 'a;

    /// Begin a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot start a transaction.
    fn begin(&self) -> Result<Self::Transaction<'_>>;

    /// Run `f` in a fresh transaction, committing if it returns `Ok` and
    /// rolling back if it returns `Err`.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or the storage error of begin/commit.
    fn transaction<'s, T, E, F>(&'s self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Self::Transaction<'s>) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let mut tx = self.begin()?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(error = %rollback_err, "Failed to roll back transaction");
                }
                Err(err)
            }
        }
    }
}
