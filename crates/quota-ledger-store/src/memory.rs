//! In-memory storage implementation.
//!
//! Rows live in one ordered map per column family. A transaction buffers its
//! writes and applies them under a single mutex at commit, so other
//! transactions only ever observe committed state. Row locks are tracked in a
//! shared table; a transaction waiting on a held lock parks on a condition
//! variable until the holder finishes or the lock timeout elapses.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{Result, StoreError};
use crate::{KvTransaction, Store, DEFAULT_LOCK_TIMEOUT};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;
type RowKey = (&'static str, Vec<u8>);

struct Shared {
    data: Mutex<HashMap<&'static str, Table>>,
    locks: Mutex<HashMap<RowKey, u64>>,
    released: Condvar,
    next_txn: AtomicU64,
    lock_timeout: Duration,
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Database("memory store mutex poisoned".to_string())
}

/// In-memory store, used by tests and by deployments without `RocksDB`.
///
/// Cloning is cheap and every clone shares the same data.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create an empty store with the default lock timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Create an empty store whose transactions wait at most `timeout` for a
    /// row lock.
    #[must_use]
    pub fn with_lock_timeout(timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                data: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                released: Condvar::new(),
                next_txn: AtomicU64::new(1),
                lock_timeout: timeout,
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    type Transaction<'a> = MemoryTransaction;

    fn begin(&self) -> Result<MemoryTransaction> {
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            id: self.shared.next_txn.fetch_add(1, Ordering::Relaxed),
            writes: BTreeMap::new(),
            held: HashSet::new(),
            finished: false,
        })
    }
}

/// A transaction on a [`MemoryStore`].
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    id: u64,
    writes: BTreeMap<RowKey, Option<Vec<u8>>>,
    held: HashSet<RowKey>,
    finished: bool,
}

impl MemoryTransaction {
    fn data(&self) -> Result<MutexGuard<'_, HashMap<&'static str, Table>>> {
        self.shared.data.lock().map_err(poisoned)
    }

    /// Take the row lock on `(table, key)`, waiting up to the lock timeout.
    fn acquire(&mut self, table: &'static str, key: &[u8]) -> Result<()> {
        let row = (table, key.to_vec());
        if self.held.contains(&row) {
            return Ok(());
        }

        let deadline = Instant::now() + self.shared.lock_timeout;
        let mut locks = self.shared.locks.lock().map_err(poisoned)?;
        while locks.contains_key(&row) {
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(txn = self.id, table, "Row lock wait timed out");
                return Err(StoreError::LockTimeout { table });
            }
            let (guard, _) = self
                .shared
                .released
                .wait_timeout(locks, deadline - now)
                .map_err(poisoned)?;
            locks = guard;
        }
        locks.insert(row.clone(), self.id);
        drop(locks);

        self.held.insert(row);
        Ok(())
    }

    /// Rows from `start` onward while `within` holds, committed state merged
    /// with this transaction's writes.
    fn scan(
        &self,
        cf: &'static str,
        start: &[u8],
        within: impl Fn(&[u8]) -> bool,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut rows: Table = self
            .data()?
            .get(cf)
            .map(|table| {
                table
                    .range(start.to_vec()..)
                    .take_while(|(key, _)| within(key.as_slice()))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        for ((table, key), value) in &self.writes {
            if *table != cf || key.as_slice() < start || !within(key.as_slice()) {
                continue;
            }
            match value {
                Some(value) => rows.insert(key.clone(), value.clone()),
                None => rows.remove(key),
            };
        }

        Ok(rows.into_iter().collect())
    }

    fn release_locks(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let mut locks = self
            .shared
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for row in self.held.drain() {
            locks.remove(&row);
        }
        drop(locks);
        self.shared.released.notify_all();
    }
}

impl KvTransaction for MemoryTransaction {
    fn get(&self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(pending) = self.writes.get(&(cf, key.to_vec())) {
            return Ok(pending.clone());
        }
        Ok(self
            .data()?
            .get(cf)
            .and_then(|table| table.get(key))
            .cloned())
    }

    fn get_for_update(&mut self, cf: &'static str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.acquire(cf, key)?;
        self.get(cf, key)
    }

    fn put(&mut self, cf: &'static str, key: &[u8], value: &[u8]) -> Result<()> {
        self.acquire(cf, key)?;
        self.writes.insert((cf, key.to_vec()), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, cf: &'static str, key: &[u8]) -> Result<()> {
        self.acquire(cf, key)?;
        self.writes.insert((cf, key.to_vec()), None);
        Ok(())
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

    fn commit(mut self) -> Result<()> {
        let writes = std::mem::take(&mut self.writes);
        {
            let mut data = self.data()?;
            for ((table, key), value) in writes {
                let rows = data.entry(table).or_default();
                match value {
                    Some(value) => rows.insert(key, value),
                    None => rows.remove(&key),
                };
            }
        }
        self.finished = true;
        self.release_locks();
        Ok(())
    }

    fn rollback(mut self) -> Result<()> {
        self.writes.clear();
        self.finished = true;
        self.release_locks();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished && !self.writes.is_empty() {
            tracing::debug!(txn = self.id, "Discarding uncommitted transaction");
        }
        self.release_locks();
    }
}
