//! Reservations: reserve, commit, rollback and expiry.
//!
//! A reservation moves through `Pending → Committed | RolledBack`. While it
//! is pending, each of its items holds `delta` in the `reserved` counter of
//! a usage row. Commit moves the deltas into `used`; rollback and expiry
//! give them back.
//!
//! Every transition locks the reservation row first and then the usage rows
//! it touches in ascending id order.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use quota_ledger_core::{
    AuthData, LedgerError, Overage, Quota, QuotaId, Reservation, ReservationId,
    ReservationRequest, ReservationStatus, ReservedItem, ReservedItemId, Resource, ResourceId,
    Result, ServiceUser, SpecificResource, Usage, UsageId,
};
use quota_ledger_store::{KvTransaction, Tables};
use serde::{Deserialize, Serialize};

use super::quota::{absolute_overage, resolve};
use super::{load_category, load_resource, load_service, lock_live, lock_pending, Ledger};

/// The outcome of a successful [`Ledger::reserve_request`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationReceipt {
    /// The new pending reservation.
    pub reservation: Reservation,

    /// One item per tracked resource delta. Absolute resources are checked
    /// but leave no item.
    pub items: Vec<ReservedItem>,

    /// Usage rows whose refresh countdown ran out while serving the request.
    pub refresh_due: Vec<UsageId>,
}

/// The outcome of a successful [`Ledger::reserve`] on a tracked resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reserved {
    /// The recorded item.
    pub item: ReservedItem,

    /// Whether the usage row's refresh countdown ran out on this decision.
    pub refresh_due: bool,
}

/// A delta that passed its quota check and is waiting to be recorded.
struct Claim {
    usage_id: UsageId,
    resource_id: ResourceId,
    quota_id: Option<QuotaId>,
    delta: i64,
}

/// How far `consumed + delta` would exceed the quota, if at all.
///
/// A non-positive delta never increases consumption and is always admitted.
fn check_quota(
    resource: &Resource,
    name: &str,
    quota: Option<&Quota>,
    consumed: i64,
    delta: i64,
) -> Option<Overage> {
    if delta <= 0 {
        return None;
    }
    let quota = quota?;
    if quota.admits(consumed, delta) {
        return None;
    }
    Some(Overage {
        resource_id: resource.id,
        resource: name.to_string(),
        limit: quota.limit?,
        consumed,
        requested: delta,
    })
}

/// Apply a counter change, refusing one that would wrap.
fn counter(value: Option<i64>, usage: UsageId, name: &str) -> Result<i64> {
    value.ok_or_else(|| LedgerError::invalid(format!("usage {usage} {name} would overflow")))
}

fn over_quota(overages: Vec<Overage>) -> LedgerError {
    for overage in &overages {
        tracing::warn!(%overage, "Reservation refused");
    }
    LedgerError::OverQuota { overages }
}

fn new_item(reservation_id: ReservationId, claim: &Claim) -> ReservedItem {
    let now = Utc::now();
    ReservedItem {
        id: ReservedItemId::generate(),
        reservation_id,
        resource_id: claim.resource_id,
        usage_id: claim.usage_id,
        quota_id: claim.quota_id,
        delta: claim.delta,
        created_at: now,
        updated_at: now,
    }
}

/// Lock the usage rows of `items` in ascending id order.
fn lock_usages<T: KvTransaction>(
    tx: &mut T,
    items: &[ReservedItem],
) -> Result<BTreeMap<UsageId, Usage>> {
    let ids: BTreeSet<UsageId> = items.iter().map(|item| item.usage_id).collect();
    let mut usages = BTreeMap::new();
    for id in ids {
        let usage = tx
            .usage_for_update(&id)?
            .ok_or_else(|| LedgerError::not_found("usage", id))?;
        usages.insert(id, usage);
    }
    Ok(usages)
}

fn usage_mut(usages: &mut BTreeMap<UsageId, Usage>, id: UsageId) -> Result<&mut Usage> {
    usages
        .get_mut(&id)
        .ok_or_else(|| LedgerError::not_found("usage", id))
}

fn put_usages<T: KvTransaction>(tx: &mut T, usages: &mut BTreeMap<UsageId, Usage>) -> Result<()> {
    let now = Utc::now();
    for usage in usages.values_mut() {
        usage.updated_at = now;
        tx.put_usage(usage)?;
    }
    Ok(())
}

impl Ledger {
    /// Expiry of a reservation created without an explicit one.
    #[must_use]
    pub fn default_expiry(&self) -> DateTime<Utc> {
        Utc::now() + self.config.reservation_ttl()
    }

    /// Open a pending reservation.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn create_reservation<T: KvTransaction>(
        &self,
        tx: &mut T,
        expire: DateTime<Utc>,
    ) -> Result<Reservation> {
        let reservation = Reservation::new(expire);
        tx.insert_reservation(&reservation)?;

        tracing::debug!(reservation_id = %reservation.id, expire = %expire, "Reservation created");
        Ok(reservation)
    }

    /// Get a reservation by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the reservation does not exist.
    pub fn get_reservation<T: KvTransaction>(
        &self,
        tx: &T,
        reservation: impl Into<ReservationId>,
    ) -> Result<Reservation> {
        let id = reservation.into();
        tx.reservation(&id)?
            .ok_or_else(|| LedgerError::not_found("reservation", id))
    }

    /// List the items of a reservation.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the reservation does not exist.
    pub fn get_reserved_items<T: KvTransaction>(
        &self,
        tx: &T,
        reservation: impl Into<ReservationId>,
    ) -> Result<Vec<ReservedItem>> {
        let reservation = self.get_reservation(tx, reservation)?;
        Ok(tx.items_of(&reservation.id)?)
    }

    /// Reserve `delta` of a resource against a usage row.
    ///
    /// The quota is resolved from `auth_data`, which must project onto the
    /// usage row's own auth data. An absolute resource is only checked
    /// against its limit and records nothing, so it takes no usage row and
    /// returns `None`.
    ///
    /// # Errors
    ///
    /// Returns `OverQuota` (writing nothing) if the delta would exceed the
    /// quota, `InvalidState` if the reservation is not pending, `Expired` if
    /// it is past its expiry, `InvalidArguments` if the usage belongs to
    /// another resource or another owner, is missing for a tracked resource,
    /// or would overflow, and `NotFound` for unknown ids.
    pub fn reserve<T: KvTransaction>(
        &self,
        tx: &mut T,
        reservation: impl Into<ReservationId>,
        resource: impl Into<ResourceId>,
        usage: Option<UsageId>,
        auth_data: &AuthData,
        delta: i64,
    ) -> Result<Option<Reserved>> {
        let reservation = lock_live(tx, &reservation.into())?;
        let resource = load_resource(tx, &resource.into())?;
        let category = load_category(tx, &resource.category_id)?;

        if resource.absolute {
            if usage.is_some() {
                return Err(LedgerError::invalid(format!(
                    "resource {} is absolute and keeps no usage",
                    resource.name
                )));
            }
            let name = &resource.name;
            return match absolute_overage(tx, &resource, &category, auth_data, delta, name)? {
                Some(overage) => Err(over_quota(vec![overage])),
                None => Ok(None),
            };
        }

        let usage_id = usage.ok_or_else(|| {
            LedgerError::invalid(format!("resource {} requires a usage row", resource.name))
        })?;
        let mut usage = tx
            .usage_for_update(&usage_id)?
            .ok_or_else(|| LedgerError::not_found("usage", usage_id))?;
        if usage.resource_id != resource.id {
            return Err(LedgerError::invalid(format!(
                "usage {} does not track resource {}",
                usage.id, resource.name
            )));
        }
        if auth_data.project(&category.usage_fset) != usage.auth_data {
            return Err(LedgerError::invalid(format!(
                "usage {} belongs to other auth data",
                usage.id
            )));
        }

        let quota = resolve(tx, &resource, &category, auth_data)?;
        if let Some(overage) =
            check_quota(&resource, &resource.name, quota.as_ref(), usage.consumed(), delta)
        {
            return Err(over_quota(vec![overage]));
        }

        usage.reserved = counter(usage.reserved.checked_add(delta), usage.id, "reserved")?;
        let refresh_due = Self::consult(&mut usage);
        usage.updated_at = Utc::now();
        tx.put_usage(&usage)?;

        let item = new_item(
            reservation.id,
            &Claim {
                usage_id: usage.id,
                resource_id: resource.id,
                quota_id: quota.map(|q| q.id),
                delta,
            },
        );
        tx.insert_item(&item)?;

        if refresh_due {
            tracing::info!(usage_id = %usage.id, "Usage refresh due");
        }
        tracing::debug!(
            reservation_id = %reservation.id,
            resource = %resource.name,
            delta,
            reserved = usage.reserved,
            "Delta reserved"
        );
        Ok(Some(Reserved { item, refresh_due }))
    }

    /// Commit a pending reservation, moving every delta from `reserved` into
    /// `used`.
    ///
    /// Positive deltas are checked again against the quota recorded when they
    /// were reserved, so a limit lowered in the meantime is honored. Either
    /// every item is applied or none is.
    ///
    /// # Errors
    ///
    /// Returns `OverQuota` if an item no longer fits (the reservation stays
    /// pending), `InvalidState` if it is not pending, `Expired` if it is past
    /// its expiry, and `NotFound` if it does not exist.
    pub fn commit<T: KvTransaction>(
        &self,
        tx: &mut T,
        reservation: impl Into<ReservationId>,
    ) -> Result<Reservation> {
        let mut reservation = lock_live(tx, &reservation.into())?;
        let items = tx.items_of(&reservation.id)?;
        let mut usages = lock_usages(tx, &items)?;

        let mut overages = Vec::new();
        for item in items.iter().filter(|item| item.delta > 0) {
            let Some(quota_id) = item.quota_id else {
                continue;
            };
            let Some(limit) = tx.quota(&quota_id)?.and_then(|quota| quota.limit) else {
                continue;
            };
            let consumed = usage_mut(&mut usages, item.usage_id)?.consumed();
            if consumed > limit {
                let resource = load_resource(tx, &item.resource_id)?;
                overages.push(Overage {
                    resource_id: resource.id,
                    resource: resource.name,
                    limit,
                    consumed: consumed.saturating_sub(item.delta),
                    requested: item.delta,
                });
            }
        }
        if !overages.is_empty() {
            return Err(over_quota(overages));
        }

        for item in &items {
            let usage = usage_mut(&mut usages, item.usage_id)?;
            usage.used = counter(usage.used.checked_add(item.delta), usage.id, "used")?;
            usage.reserved =
                counter(usage.reserved.checked_sub(item.delta), usage.id, "reserved")?;
        }
        put_usages(tx, &mut usages)?;

        reservation.status = ReservationStatus::Committed;
        reservation.updated_at = Utc::now();
        tx.put_reservation(&reservation)?;

        tracing::info!(
            reservation_id = %reservation.id,
            items = items.len(),
            "Reservation committed"
        );
        Ok(reservation)
    }

    /// Roll back a pending reservation, releasing every delta.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the reservation is not pending and
    /// `NotFound` if it does not exist.
    pub fn rollback<T: KvTransaction>(
        &self,
        tx: &mut T,
        reservation: impl Into<ReservationId>,
    ) -> Result<Reservation> {
        let reservation = lock_pending(tx, &reservation.into())?;
        let reservation = Self::release(tx, reservation)?;

        tracing::info!(reservation_id = %reservation.id, "Reservation rolled back");
        Ok(reservation)
    }

    /// Pending reservations whose expiry is before `now`, earliest expiry
    /// first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn expired_reservations<T: KvTransaction>(
        &self,
        tx: &T,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationId>> {
        Ok(tx.pending_expired(&now)?)
    }

    /// Roll back one reservation if it is still pending and expired at
    /// `now`. Returns whether it was rolled back.
    ///
    /// # Errors
    ///
    /// Returns `Transient` if the reservation or one of its usage rows stays
    /// locked past the lock timeout. Nothing is written in that case.
    pub fn expire_reservation<T: KvTransaction>(
        &self,
        tx: &mut T,
        reservation: impl Into<ReservationId>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(reservation) = tx.reservation_for_update(&reservation.into())? else {
            return Ok(false);
        };
        if reservation.status != ReservationStatus::Pending || !reservation.is_expired(now) {
            return Ok(false);
        }
        let reservation = Self::release(tx, reservation)?;

        tracing::debug!(reservation_id = %reservation.id, "Expired reservation rolled back");
        Ok(true)
    }

    /// Roll back every pending reservation whose expiry is before `now`.
    /// Returns the reservations rolled back.
    ///
    /// A reservation held by another transaction is skipped and left for a
    /// later sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn expire_reservations<T: KvTransaction>(
        &self,
        tx: &mut T,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationId>> {
        let mut expired = Vec::new();
        for id in self.expired_reservations(tx, now)? {
            match self.expire_reservation(tx, id, now) {
                Ok(true) => expired.push(id),
                Ok(false) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!(reservation_id = %id, error = %e, "Skipping locked reservation");
                }
                Err(e) => return Err(e),
            }
        }

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired reservations rolled back");
        }
        Ok(expired)
    }

    fn release<T: KvTransaction>(tx: &mut T, mut reservation: Reservation) -> Result<Reservation> {
        let items = tx.items_of(&reservation.id)?;
        let mut usages = lock_usages(tx, &items)?;
        for item in &items {
            let usage = usage_mut(&mut usages, item.usage_id)?;
            usage.reserved =
                counter(usage.reserved.checked_sub(item.delta), usage.id, "reserved")?;
        }
        put_usages(tx, &mut usages)?;

        reservation.status = ReservationStatus::RolledBack;
        reservation.updated_at = Utc::now();
        tx.put_reservation(&reservation)?;
        Ok(reservation)
    }

    /// Reserve several resources for one service user at once.
    ///
    /// Usage rows are created on first use. Every delta is checked before
    /// anything is recorded, and all overages are reported together.
    ///
    /// # Errors
    ///
    /// Returns `OverQuota` listing every resource that does not fit,
    /// `InvalidArguments` if the auth data lacks a service auth field, a
    /// resource lacks parameter data, the expiry is already past, or a
    /// counter would overflow, and `NotFound` for unknown ids.
    pub fn reserve_request<T: KvTransaction>(
        &self,
        tx: &mut T,
        request: &ReservationRequest,
    ) -> Result<ReservationReceipt> {
        let service = load_service(tx, &request.service)?;
        let user = ServiceUser::new(&service, &request.auth_data)?;
        if let Some(expire) = request.expire.filter(|expire| *expire < Utc::now()) {
            return Err(LedgerError::invalid(format!("expiry {expire} is in the past")));
        }

        if self.config.expire_on_request {
            self.expire_reservations(tx, Utc::now())?;
        }

        let mut usages = BTreeMap::new();
        let mut claims = Vec::new();
        let mut overages = Vec::new();
        for requested in &request.deltas {
            let resource = load_resource(tx, &requested.resource)?;
            let specific = SpecificResource::new(&service, &resource, &requested.param_data)?;
            let category = load_category(tx, &resource.category_id)?;

            if resource.absolute {
                overages.extend(absolute_overage(
                    tx,
                    &resource,
                    &category,
                    &user.auth_data,
                    requested.delta,
                    &specific.name,
                )?);
                continue;
            }

            let locked = self.lock_usage(
                tx,
                &resource,
                &category,
                &specific.param_data,
                &user.auth_data,
            )?;
            let usage = usages.entry(locked.id).or_insert(locked);
            let quota = resolve(tx, &resource, &category, &user.auth_data)?;
            if let Some(overage) = check_quota(
                &resource,
                &specific.name,
                quota.as_ref(),
                usage.consumed(),
                requested.delta,
            ) {
                overages.push(overage);
                continue;
            }

            usage.reserved = counter(
                usage.reserved.checked_add(requested.delta),
                usage.id,
                "reserved",
            )?;
            claims.push(Claim {
                usage_id: usage.id,
                resource_id: resource.id,
                quota_id: quota.map(|q| q.id),
                delta: requested.delta,
            });
        }
        if !overages.is_empty() {
            return Err(over_quota(overages));
        }

        let reservation = self.create_reservation(
            tx,
            request.expire.unwrap_or_else(|| self.default_expiry()),
        )?;

        let mut items = Vec::with_capacity(claims.len());
        let mut refresh_due = Vec::new();
        for claim in &claims {
            let usage = usage_mut(&mut usages, claim.usage_id)?;
            if Self::consult(usage) && !refresh_due.contains(&usage.id) {
                refresh_due.push(usage.id);
            }
            let item = new_item(reservation.id, claim);
            tx.insert_item(&item)?;
            items.push(item);
        }
        put_usages(tx, &mut usages)?;

        for usage_id in &refresh_due {
            tracing::info!(usage_id = %usage_id, "Usage refresh due");
        }
        tracing::info!(
            reservation_id = %reservation.id,
            service = %service.name,
            items = items.len(),
            "Reservation request granted"
        );
        Ok(ReservationReceipt {
            reservation,
            items,
            refresh_due,
        })
    }
}
