//! Usage resynchronization.
//!
//! The client service is the source of truth for what a user actually
//! holds. The [`Refresher`] asks it through a [`UsageCounter`] and writes the
//! answer back with the ledger's refresh protocol.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use quota_ledger_core::{Result, Usage, UsageId};
use quota_ledger_store::Store;

use crate::ledger::{Ledger, RefreshTicket};
use crate::offload;

/// Counts the real consumption behind a usage row.
#[async_trait]
pub trait UsageCounter: Send + Sync {
    /// Return the amount currently in use for the ticket's fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an error if the count is unavailable; the refresh is then
    /// abandoned and the row keeps its token until the next refresh.
    async fn count(&self, ticket: &RefreshTicket) -> Result<i64>;
}

/// Drives refreshes of usage rows against a [`UsageCounter`].
pub struct Refresher<S> {
    store: Arc<S>,
    ledger: Ledger,
    counter: Arc<dyn UsageCounter>,
}

impl<S: Store + 'static> Refresher<S> {
    /// Create a refresher.
    #[must_use]
    pub fn new(store: Arc<S>, ledger: Ledger, counter: Arc<dyn UsageCounter>) -> Self {
        Self {
            store,
            ledger,
            counter,
        }
    }

    /// Refresh one usage row.
    ///
    /// The token is issued and the result written back in two separate
    /// transactions on the blocking pool, so the count runs without holding
    /// any lock.
    ///
    /// # Errors
    ///
    /// Returns `StaleRefresh` if another refresh of the row was issued while
    /// counting, or any error from the counter or the store.
    pub async fn refresh(&self, usage: UsageId) -> Result<Usage> {
        let (store, ledger) = (Arc::clone(&self.store), self.ledger.clone());
        let ticket =
            offload(move || store.transaction(|tx| ledger.begin_refresh(tx, usage))).await?;

        let used = self.counter.count(&ticket).await?;

        let (store, ledger) = (Arc::clone(&self.store), self.ledger.clone());
        offload(move || store.transaction(|tx| ledger.complete_refresh(tx, &ticket, used))).await
    }

    /// Refresh many usage rows, running up to the configured number at once.
    ///
    /// Results come back in completion order.
    pub async fn refresh_all<I>(&self, usages: I) -> Vec<(UsageId, Result<Usage>)>
    where
        I: IntoIterator<Item = UsageId>,
    {
        let concurrency = self.ledger.config().refresh_concurrency.max(1);
        let results: Vec<(UsageId, Result<Usage>)> = stream::iter(usages)
            .map(|usage| async move { (usage, self.refresh(usage).await) })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        tracing::info!(refreshed = results.len() - failed, failed, "Usage refresh batch finished");
        results
    }
}
