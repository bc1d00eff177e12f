//! The ledger engine.
//!
//! [`Ledger`] holds no storage of its own. Every operation takes the open
//! transaction it should run in, so a caller can group several operations
//! into one atomic unit and decide when to commit:
//!
//! ```no_run
//! use chrono::Utc;
//! use quota_ledger_core::{field_set, LedgerError};
//! use quota_ledger_service::{Ledger, LedgerConfig};
//! use quota_ledger_store::{MemoryStore, Store};
//!
//! let store = MemoryStore::new();
//! let ledger = Ledger::new(LedgerConfig::default());
//! let service = store.transaction(|tx| {
//!     ledger.create_service(tx, "compute", field_set(["user_id", "project_id"]))
//! })?;
//! # Ok::<(), LedgerError>(())
//! ```
//!
//! The operations are split by concern:
//!
//! - `registry`: services, categories and resources
//! - `usage`: usage rows and the refresh protocol
//! - `quota`: quota records and limit resolution
//! - `reservation`: reserve, commit, rollback and expiry

mod quota;
mod registry;
mod reservation;
mod usage;

pub use reservation::{ReservationReceipt, Reserved};
pub use usage::{NewUsage, RefreshTicket};

use chrono::Utc;
use quota_ledger_core::{
    Category, CategoryId, LedgerError, Reservation, ReservationId, ReservationStatus, Resource,
    ResourceId, Result, Service, ServiceId,
};
use quota_ledger_store::{KvTransaction, Tables};

use crate::config::LedgerConfig;

/// The quota accounting engine.
#[derive(Debug, Clone)]
pub struct Ledger {
    config: LedgerConfig,
}

impl Ledger {
    /// Create a ledger with the given configuration.
    #[must_use]
    pub const fn new(config: LedgerConfig) -> Self {
        Self { config }
    }

    /// The ledger configuration.
    #[must_use]
    pub const fn config(&self) -> &LedgerConfig {
        &self.config
    }
}

// =============================================================================
// Loaders
// =============================================================================

fn load_service<T: KvTransaction>(tx: &T, id: &ServiceId) -> Result<Service> {
    tx.service(id)?
        .ok_or_else(|| LedgerError::not_found("service", id))
}

fn load_category<T: KvTransaction>(tx: &T, id: &CategoryId) -> Result<Category> {
    tx.category(id)?
        .ok_or_else(|| LedgerError::not_found("category", id))
}

fn load_resource<T: KvTransaction>(tx: &T, id: &ResourceId) -> Result<Resource> {
    tx.resource(id)?
        .ok_or_else(|| LedgerError::not_found("resource", id))
}

/// Lock a reservation and make sure it is still pending.
fn lock_pending<T: KvTransaction>(tx: &mut T, id: &ReservationId) -> Result<Reservation> {
    let reservation = tx
        .reservation_for_update(id)?
        .ok_or_else(|| LedgerError::not_found("reservation", id))?;
    if reservation.status != ReservationStatus::Pending {
        return Err(LedgerError::InvalidState {
            reservation_id: reservation.id,
            status: reservation.status,
        });
    }
    Ok(reservation)
}

/// Lock a reservation that is pending and not yet past its expiry.
fn lock_live<T: KvTransaction>(tx: &mut T, id: &ReservationId) -> Result<Reservation> {
    let reservation = lock_pending(tx, id)?;
    if reservation.is_expired(Utc::now()) {
        return Err(LedgerError::Expired {
            reservation_id: reservation.id,
            expire: reservation.expire,
        });
    }
    Ok(reservation)
}
