//! Typed access to ledger records.
//!
//! Records are CBOR encoded and keyed by their raw id bytes. Every natural
//! key has a unique index column family whose value is the record id; the
//! index entry is claimed under a row lock in the same transaction as the
//! record itself, so two transactions inserting the same key serialize on
//! that lock and the loser sees `StoreError::UniqueViolation`.

use chrono::{DateTime, Utc};
use quota_ledger_core::{
    AuthData, Category, CategoryId, ParamData, Quota, QuotaId, Reservation, ReservationId,
    ReservedItem, Resource, ResourceId, Service, ServiceId, Usage, UsageId,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::cf;
use crate::KvTransaction;

/// Serialize a value using CBOR.
fn serialize<V: Serialize>(value: &V) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a value from CBOR.
fn deserialize<V: DeserializeOwned>(data: &[u8]) -> Result<V> {
    ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode the id stored as an index value.
fn index_id(raw: &[u8]) -> Result<[u8; 16]> {
    raw.try_into()
        .map_err(|_| StoreError::Serialization(format!("corrupt index entry of {} bytes", raw.len())))
}

fn render_id(raw: &[u8]) -> String {
    uuid::Uuid::from_slice(raw).map_or_else(
        |_| String::from_utf8_lossy(raw).into_owned(),
        |id| id.to_string(),
    )
}

fn get_record<T, V>(tx: &T, table: &'static str, key: &[u8]) -> Result<Option<V>>
where
    T: KvTransaction + ?Sized,
    V: DeserializeOwned,
{
    tx.get(table, key)?.map(|data| deserialize(&data)).transpose()
}

fn get_record_for_update<T, V>(tx: &mut T, table: &'static str, key: &[u8]) -> Result<Option<V>>
where
    T: KvTransaction + ?Sized,
    V: DeserializeOwned,
{
    tx.get_for_update(table, key)?
        .map(|data| deserialize(&data))
        .transpose()
}

fn put_record<T, V>(tx: &mut T, table: &'static str, key: &[u8], record: &V) -> Result<()>
where
    T: KvTransaction + ?Sized,
    V: Serialize,
{
    let value = serialize(record)?;
    tx.put(table, key, &value)
}

fn scan_records<T, V>(tx: &T, table: &'static str, prefix: &[u8]) -> Result<Vec<V>>
where
    T: KvTransaction + ?Sized,
    V: DeserializeOwned,
{
    tx.scan_prefix(table, prefix)?
        .iter()
        .map(|(_, data)| deserialize(data))
        .collect()
}

/// Follow every index entry under `prefix` to its record.
fn scan_indexed<T, V>(
    tx: &T,
    index: &'static str,
    table: &'static str,
    prefix: &[u8],
) -> Result<Vec<V>>
where
    T: KvTransaction + ?Sized,
    V: DeserializeOwned,
{
    let mut records = Vec::new();
    for (_, id) in tx.scan_prefix(index, prefix)? {
        let id = index_id(&id)?;
        if let Some(record) = get_record(tx, table, &id)? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Look up the id an index entry points to.
fn lookup<T>(tx: &T, index: &'static str, key: &[u8]) -> Result<Option<[u8; 16]>>
where
    T: KvTransaction + ?Sized,
{
    tx.get(index, key)?.map(|raw| index_id(&raw)).transpose()
}

/// Claim `key` in a unique index for the record `id`.
fn claim_unique<T>(
    tx: &mut T,
    index: &'static str,
    key: &[u8],
    id: &[u8; 16],
    entity: &'static str,
) -> Result<()>
where
    T: KvTransaction + ?Sized,
{
    if let Some(existing) = tx.get_for_update(index, key)? {
        return Err(StoreError::UniqueViolation {
            entity,
            existing: render_id(&existing),
        });
    }
    tx.put(index, key, id)
}

/// Typed record operations available on every [`KvTransaction`].
///
/// Lookups return `Ok(None)` for absent records; turning that into a
/// not-found error is left to the caller, which knows what was asked for.
pub trait Tables: KvTransaction {
    // =========================================================================
    // Services
    // =========================================================================

    /// Insert a new service.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UniqueViolation` if the name is taken.
    fn insert_service(&mut self, service: &Service) -> Result<()> {
        claim_unique(
            self,
            cf::SERVICE_NAMES,
            &keys::service_name_key(&service.name),
            service.id.as_bytes(),
            "service",
        )?;
        put_record(self, cf::SERVICES, service.id.as_bytes(), service)
    }

    /// Get a service by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn service(&self, id: &ServiceId) -> Result<Option<Service>> {
        get_record(self, cf::SERVICES, id.as_bytes())
    }

    /// Get a service by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn service_by_name(&self, name: &str) -> Result<Option<Service>> {
        match lookup(self, cf::SERVICE_NAMES, &keys::service_name_key(name))? {
            Some(id) => get_record(self, cf::SERVICES, &id),
            None => Ok(None),
        }
    }

    /// List all services in name order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn services(&self) -> Result<Vec<Service>> {
        scan_indexed(self, cf::SERVICE_NAMES, cf::SERVICES, &[])
    }

    // =========================================================================
    // Categories
    // =========================================================================

    /// Insert a new category.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UniqueViolation` if the service already has a
    /// category of that name.
    fn insert_category(&mut self, category: &Category) -> Result<()> {
        claim_unique(
            self,
            cf::CATEGORY_NAMES,
            &keys::category_name_key(&category.service_id, &category.name),
            category.id.as_bytes(),
            "category",
        )?;
        put_record(self, cf::CATEGORIES, category.id.as_bytes(), category)
    }

    /// Get a category by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn category(&self, id: &CategoryId) -> Result<Option<Category>> {
        get_record(self, cf::CATEGORIES, id.as_bytes())
    }

    /// Get a category by service and name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn category_by_name(&self, service_id: &ServiceId, name: &str) -> Result<Option<Category>> {
        let key = keys::category_name_key(service_id, name);
        match lookup(self, cf::CATEGORY_NAMES, &key)? {
            Some(id) => get_record(self, cf::CATEGORIES, &id),
            None => Ok(None),
        }
    }

    /// List categories, optionally restricted to one service.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn categories(&self, service_id: Option<&ServiceId>) -> Result<Vec<Category>> {
        let prefix = service_id.map(keys::id_prefix).unwrap_or_default();
        scan_indexed(self, cf::CATEGORY_NAMES, cf::CATEGORIES, &prefix)
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Insert a new resource.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UniqueViolation` if the category already has a
    /// resource of that name.
    fn insert_resource(&mut self, resource: &Resource) -> Result<()> {
        claim_unique(
            self,
            cf::RESOURCE_NAMES,
            &keys::resource_name_key(&resource.service_id, &resource.category_id, &resource.name),
            resource.id.as_bytes(),
            "resource",
        )?;
        put_record(self, cf::RESOURCES, resource.id.as_bytes(), resource)
    }

    /// Get a resource by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn resource(&self, id: &ResourceId) -> Result<Option<Resource>> {
        get_record(self, cf::RESOURCES, id.as_bytes())
    }

    /// Get a resource by service, category and name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn resource_by_name(
        &self,
        service_id: &ServiceId,
        category_id: &CategoryId,
        name: &str,
    ) -> Result<Option<Resource>> {
        let key = keys::resource_name_key(service_id, category_id, name);
        match lookup(self, cf::RESOURCE_NAMES, &key)? {
            Some(id) => get_record(self, cf::RESOURCES, &id),
            None => Ok(None),
        }
    }

    /// List resources, optionally restricted to a service and category.
    ///
    /// A category filter without a service filter scans every resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn resources(
        &self,
        service_id: Option<&ServiceId>,
        category_id: Option<&CategoryId>,
    ) -> Result<Vec<Resource>> {
        let mut prefix = Vec::new();
        if let Some(service_id) = service_id {
            prefix.extend_from_slice(service_id.as_bytes());
            if let Some(category_id) = category_id {
                prefix.extend_from_slice(category_id.as_bytes());
            }
        }
        let resources: Vec<Resource> =
            scan_indexed(self, cf::RESOURCE_NAMES, cf::RESOURCES, &prefix)?;
        Ok(resources
            .into_iter()
            .filter(|r| category_id.map_or(true, |c| r.category_id == *c))
            .collect())
    }

    // =========================================================================
    // Usages
    // =========================================================================

    /// Insert a new usage record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UniqueViolation` if a usage with the same
    /// resource, auth data and parameter data exists.
    fn insert_usage(&mut self, usage: &Usage) -> Result<()> {
        let key = keys::usage_fingerprint_key(
            &usage.resource_id,
            &usage.auth_data.fingerprint(),
            &usage.parameter_data.fingerprint(),
        );
        claim_unique(self, cf::USAGE_KEYS, &key, usage.id.as_bytes(), "usage")?;
        put_record(self, cf::USAGES, usage.id.as_bytes(), usage)
    }

    /// Get a usage record by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn usage(&self, id: &UsageId) -> Result<Option<Usage>> {
        get_record(self, cf::USAGES, id.as_bytes())
    }

    /// Lock a usage record and read it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LockTimeout` if the row stays locked elsewhere.
    fn usage_for_update(&mut self, id: &UsageId) -> Result<Option<Usage>> {
        get_record_for_update(self, cf::USAGES, id.as_bytes())
    }

    /// Get a usage record by its fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn usage_by_fingerprint(
        &self,
        resource_id: &ResourceId,
        auth_data: &AuthData,
        param_data: &ParamData,
    ) -> Result<Option<Usage>> {
        let key = keys::usage_fingerprint_key(
            resource_id,
            &auth_data.fingerprint(),
            &param_data.fingerprint(),
        );
        match lookup(self, cf::USAGE_KEYS, &key)? {
            Some(id) => get_record(self, cf::USAGES, &id),
            None => Ok(None),
        }
    }

    /// Lock a usage fingerprint, present or not, and read its record.
    ///
    /// Holding the index lock makes a following `insert_usage` for the same
    /// fingerprint race-free.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LockTimeout` if the key stays locked elsewhere.
    fn usage_by_fingerprint_for_update(
        &mut self,
        resource_id: &ResourceId,
        auth_data: &AuthData,
        param_data: &ParamData,
    ) -> Result<Option<Usage>> {
        let key = keys::usage_fingerprint_key(
            resource_id,
            &auth_data.fingerprint(),
            &param_data.fingerprint(),
        );
        match self.get_for_update(cf::USAGE_KEYS, &key)? {
            Some(raw) => {
                let id = index_id(&raw)?;
                get_record_for_update(self, cf::USAGES, &id)
            }
            None => Ok(None),
        }
    }

    /// List usage records, optionally restricted to one resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn usages(&self, resource_id: Option<&ResourceId>) -> Result<Vec<Usage>> {
        let prefix = resource_id.map(keys::id_prefix).unwrap_or_default();
        scan_indexed(self, cf::USAGE_KEYS, cf::USAGES, &prefix)
    }

    /// Overwrite an existing usage record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_usage(&mut self, usage: &Usage) -> Result<()> {
        put_record(self, cf::USAGES, usage.id.as_bytes(), usage)
    }

    // =========================================================================
    // Quotas
    // =========================================================================

    /// Insert a new quota.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::UniqueViolation` if the resource already has a
    /// quota for the same auth data.
    fn insert_quota(&mut self, quota: &Quota) -> Result<()> {
        let key = keys::quota_auth_key(&quota.resource_id, &quota.auth_data.fingerprint());
        claim_unique(self, cf::QUOTA_KEYS, &key, quota.id.as_bytes(), "quota")?;
        put_record(self, cf::QUOTAS, quota.id.as_bytes(), quota)
    }

    /// Get a quota by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn quota(&self, id: &QuotaId) -> Result<Option<Quota>> {
        get_record(self, cf::QUOTAS, id.as_bytes())
    }

    /// Get the quota of a resource for exactly this auth data.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn quota_by_auth(&self, resource_id: &ResourceId, auth_data: &AuthData) -> Result<Option<Quota>> {
        let key = keys::quota_auth_key(resource_id, &auth_data.fingerprint());
        match lookup(self, cf::QUOTA_KEYS, &key)? {
            Some(id) => get_record(self, cf::QUOTAS, &id),
            None => Ok(None),
        }
    }

    /// List quotas, optionally restricted to one resource.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn quotas(&self, resource_id: Option<&ResourceId>) -> Result<Vec<Quota>> {
        let prefix = resource_id.map(keys::id_prefix).unwrap_or_default();
        scan_indexed(self, cf::QUOTA_KEYS, cf::QUOTAS, &prefix)
    }

    /// Overwrite an existing quota.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_quota(&mut self, quota: &Quota) -> Result<()> {
        put_record(self, cf::QUOTAS, quota.id.as_bytes(), quota)
    }

    // =========================================================================
    // Reservations
    // =========================================================================

    /// Insert a new reservation, indexing it by expiry while pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn insert_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        let key = keys::reservation_key(&reservation.id);
        put_record(self, cf::RESERVATIONS, &key, reservation)?;
        if !reservation.status.is_terminal() {
            let index = keys::pending_expiry_key(&reservation.expire, &reservation.id);
            self.put(cf::PENDING_EXPIRY, &index, &[])?;
        }
        Ok(())
    }

    /// Get a reservation by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn reservation(&self, id: &ReservationId) -> Result<Option<Reservation>> {
        get_record(self, cf::RESERVATIONS, &keys::reservation_key(id))
    }

    /// Lock a reservation and read it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::LockTimeout` if the row stays locked elsewhere.
    fn reservation_for_update(&mut self, id: &ReservationId) -> Result<Option<Reservation>> {
        get_record_for_update(self, cf::RESERVATIONS, &keys::reservation_key(id))
    }

    /// Overwrite a reservation, dropping it from the expiry index once its
    /// status is terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_reservation(&mut self, reservation: &Reservation) -> Result<()> {
        let key = keys::reservation_key(&reservation.id);
        put_record(self, cf::RESERVATIONS, &key, reservation)?;
        if reservation.status.is_terminal() {
            let index = keys::pending_expiry_key(&reservation.expire, &reservation.id);
            self.delete(cf::PENDING_EXPIRY, &index)?;
        }
        Ok(())
    }

    /// Pending reservations whose expiry is at or before `now`, soonest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn pending_expired(&self, now: &DateTime<Utc>) -> Result<Vec<ReservationId>> {
        let end = keys::expiry_cutoff(now);
        Ok(self
            .scan_range(cf::PENDING_EXPIRY, &[], &end)?
            .into_iter()
            .filter_map(|(key, _)| keys::reservation_id_from_expiry_key(&key))
            .collect())
    }

    // =========================================================================
    // Reserved Items
    // =========================================================================

    /// Insert a reserved item.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn insert_item(&mut self, item: &ReservedItem) -> Result<()> {
        let key = keys::reserved_item_key(&item.reservation_id, &item.id);
        put_record(self, cf::RESERVED_ITEMS, &key, item)
    }

    /// List the items of a reservation.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn items_of(&self, reservation_id: &ReservationId) -> Result<Vec<ReservedItem>> {
        scan_records(self, cf::RESERVED_ITEMS, &keys::reservation_key(reservation_id))
    }
}

impl<T: KvTransaction + ?Sized> Tables for T {}
