//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait,
//! backed by a pessimistic `TransactionDB`: `get_for_update` and every write
//! lock their row until the transaction commits or rolls back.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode, MultiThreaded,
    Options, Transaction, TransactionDB, TransactionDBOptions,
};

use crate::error::{Result, StoreError};
use crate::schema::all_column_families;
use crate::{KvTransaction, Store, DEFAULT_LOCK_TIMEOUT};

type Db = TransactionDB<MultiThreaded>;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<Db>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_lock_timeout(path, DEFAULT_LOCK_TIMEOUT)
    }

    /// Open or create a database whose transactions wait at most
    /// `lock_timeout` for a row lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open_with_lock_timeout<P: AsRef<Path>>(path: P, lock_timeout: Duration) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(i64::try_from(lock_timeout.as_millis()).unwrap_or(i64::MAX));

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = Db::open_cf_descriptors(&opts, &txn_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::debug!(path = %path.as_ref().display(), "Opened RocksDB store");
        Ok(Self { db: Arc::new(db) })
    }
}

impl Store for RocksStore {
    type Transaction<'a> = RocksTransaction<'a>;

    fn begin(&self) -> Result<RocksTransaction<'_>> {
        Ok(RocksTransaction {
            db: &self.db,
            txn: self.db.transaction(),
        })
    }
}

/// A transaction on a [`RocksStore`].
pub struct RocksTransaction<'a> {
    db: &'a Db,
    txn: Transaction<'a, Db>,
}

impl RocksTransaction<'_> {
    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Iterate forward from `start`, stopping at the first key outside
    /// `within`.
    fn scan(
        &self,
        cf: &'static str,
        start: &[u8],
        within: impl Fn(&[u8]) -> bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let handle = self.cf(cf)?;
        let mut rows = Vec::new();
        for item in self
            .txn
            .iterator_cf(&handle, IteratorMode::From(start, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| map_err(cf, &e))?;
            if !within(&key) {
                break;
            }
            rows.push((key.to_vec(), value.to_vec()));
        }
        Ok(rows)
    }
}

/// Classify a `RocksDB` error, keeping lock contention retryable.
fn map_err(table: &'static str, err: &rocksdb::Error) -> StoreError {
    match err.kind() {
        ErrorKind::TimedOut => StoreError::LockTimeout { table },
        ErrorKind::Busy | ErrorKind::TryAgain => StoreError::Busy(err.to_string()),
        _ => StoreError::Database(err.to_string()),
    }
}

impl KvTransaction for RocksTransaction<'_> {
    fn get(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let handle = self.cf(cf)?;
        self.txn.get_cf(&handle, key).map_err(|e| map_err(cf, &e))
    }

    fn get_for_update(&mut self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let handle = self.cf(cf)?;
        self.txn
            .get_for_update_cf(&handle, key, true)
            .map_err(|e| map_err(cf, &e))
    }

    fn put(&mut self, cf: &'static str, key: &[u8], value: &[u8]) -> Result<()> {
        let handle = self.cf(cf)?;
        self.txn.put_cf(&handle, key, value).map_err(|e| map_err(cf, &e))
    }

    fn delete(&mut self, cf: &'static str, key: &[u8]) -> Result<()> {
        let handle = self.cf(cf)?;
        self.txn.delete_cf(&handle, key).map_err(|e| map_err(cf, &e))
    }

    fn scan_prefix(&self, cf: &'static str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan(cf, prefix, |key| key.starts_with(prefix))
    }

    fn scan_range(
        &self,
        cf: &'static str,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan(cf, start, |key| key < end)
    }

    fn commit(self) -> Result<()> {
        self.txn.commit().map_err(|e| map_err("commit", &e))
    }

    fn rollback(self) -> Result<()> {
        self.txn
            .rollback()
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}
