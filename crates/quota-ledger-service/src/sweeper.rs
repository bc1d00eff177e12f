//! Periodic expiry of abandoned reservations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use quota_ledger_core::{ReservationId, Result};
use quota_ledger_store::Store;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::ledger::Ledger;
use crate::offload;

/// List the reservations due at `now`, then expire each in its own
/// transaction. A reservation still locked elsewhere is left for the next
/// sweep.
fn sweep<S: Store>(
    store: &S,
    ledger: &Ledger,
    now: DateTime<Utc>,
) -> Result<Vec<ReservationId>> {
    let due = store.transaction(|tx| ledger.expired_reservations(tx, now))?;

    let mut expired = Vec::new();
    for id in due {
        match store.transaction(|tx| ledger.expire_reservation(tx, id, now)) {
            Ok(true) => expired.push(id),
            Ok(false) => {}
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    reservation_id = %id,
                    error = %e,
                    "Reservation busy, left for next sweep"
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(expired)
}

/// Rolls back expired reservations on a fixed interval.
pub struct Sweeper<S> {
    store: Arc<S>,
    ledger: Ledger,
    interval: Duration,
}

impl<S: Store + 'static> Sweeper<S> {
    /// Create a sweeper using the ledger's configured interval.
    #[must_use]
    pub fn new(store: Arc<S>, ledger: Ledger) -> Self {
        let interval = ledger.config().sweep_interval();
        Self {
            store,
            ledger,
            interval,
        }
    }

    /// Run one sweep on the calling thread. Returns the reservations rolled
    /// back.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable store error. Reservations expired
    /// before it stay rolled back.
    pub fn sweep_once(&self) -> Result<Vec<ReservationId>> {
        sweep(self.store.as_ref(), &self.ledger, Utc::now())
    }

    /// Run one sweep on the blocking pool.
    ///
    /// # Errors
    ///
    /// As [`Sweeper::sweep_once`].
    pub async fn sweep(&self) -> Result<Vec<ReservationId>> {
        let store = Arc::clone(&self.store);
        let ledger = self.ledger.clone();
        offload(move || sweep(store.as_ref(), &ledger, Utc::now())).await
    }

    /// Sweep every interval until `shutdown` flips to `true` or its sender is
    /// dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "Reservation sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(expired) if !expired.is_empty() => {
                            tracing::debug!(count = expired.len(), "Sweep expired reservations");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, retryable = e.is_retryable(), "Reservation sweep failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Reservation sweeper stopped");
    }

    /// Run the sweeper on the current tokio runtime.
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LedgerConfig;
    use chrono::Duration as ChronoDuration;
    use quota_ledger_store::MemoryStore;

    #[tokio::test]
    async fn stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let sweeper = Sweeper::new(store, Ledger::new(LedgerConfig::default()));
        let (tx, rx) = watch::channel(false);

        let handle = sweeper.spawn(rx);
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn sweep_once_expires_past_reservations() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(LedgerConfig::default());
        let reservation = store
            .transaction(|tx| {
                ledger.create_reservation(tx, Utc::now() - ChronoDuration::seconds(1))
            })
            .unwrap();

        let sweeper = Sweeper::new(Arc::clone(&store), ledger);
        assert_eq!(sweeper.sweep_once().unwrap(), vec![reservation.id]);
        assert!(sweeper.sweep_once().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_runs_off_the_runtime_thread() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Ledger::new(LedgerConfig::default());
        let reservation = store
            .transaction(|tx| {
                ledger.create_reservation(tx, Utc::now() - ChronoDuration::seconds(1))
            })
            .unwrap();

        let sweeper = Sweeper::new(Arc::clone(&store), ledger);
        assert_eq!(sweeper.sweep().await.unwrap(), vec![reservation.id]);
    }
}
