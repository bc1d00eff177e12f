//! Key encoding utilities.
//!
//! Ids are stored as their 16 raw bytes. Index keys concatenate fixed-width
//! ids with a trailing variable-length component; only the usage index has
//! two variable components, so its first one is length-prefixed.

use chrono::{DateTime, Utc};
use quota_ledger_core::{CategoryId, ReservationId, ReservedItemId, ResourceId, ServiceId};

/// Create a service name index key.
#[must_use]
pub fn service_name_key(name: &str) -> Vec<u8> {
    name.as_bytes().to_vec()
}

/// Create a category name index key.
///
/// Format: `service_id (16 bytes) || name`
#[must_use]
pub fn category_name_key(service_id: &ServiceId, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + name.len());
    key.extend_from_slice(service_id.as_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

/// Create a resource name index key.
///
/// Format: `service_id (16 bytes) || category_id (16 bytes) || name`
#[must_use]
pub fn resource_name_key(service_id: &ServiceId, category_id: &CategoryId, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + name.len());
    key.extend_from_slice(service_id.as_bytes());
    key.extend_from_slice(category_id.as_bytes());
    key.extend_from_slice(name.as_bytes());
    key
}

/// Create a usage fingerprint index key.
///
/// Format: `resource_id (16 bytes) || len(auth) (4 bytes BE) || auth || param`
#[must_use]
pub fn usage_fingerprint_key(
    resource_id: &ResourceId,
    auth_fingerprint: &str,
    param_fingerprint: &str,
) -> Vec<u8> {
    let auth_len = u32::try_from(auth_fingerprint.len()).unwrap_or(u32::MAX);
    let mut key =
        Vec::with_capacity(20 + auth_fingerprint.len() + param_fingerprint.len());
    key.extend_from_slice(resource_id.as_bytes());
    key.extend_from_slice(&auth_len.to_be_bytes());
    key.extend_from_slice(auth_fingerprint.as_bytes());
    key.extend_from_slice(param_fingerprint.as_bytes());
    key
}

/// Create a quota auth-data index key.
///
/// Format: `resource_id (16 bytes) || auth fingerprint`
#[must_use]
pub fn quota_auth_key(resource_id: &ResourceId, auth_fingerprint: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + auth_fingerprint.len());
    key.extend_from_slice(resource_id.as_bytes());
    key.extend_from_slice(auth_fingerprint.as_bytes());
    key
}

/// Create a prefix covering every index entry of one parent id.
#[must_use]
pub fn id_prefix(id: &impl AsRef<[u8]>) -> Vec<u8> {
    id.as_ref().to_vec()
}

/// Create a reservation key.
#[must_use]
pub fn reservation_key(reservation_id: &ReservationId) -> Vec<u8> {
    reservation_id.to_bytes().to_vec()
}

/// Encode an expiry so that byte order matches time order, including
/// instants before the epoch.
#[must_use]
pub fn expiry_prefix(expire: &DateTime<Utc>) -> [u8; 8] {
    #[allow(clippy::cast_sign_loss)]
    let ordered = (expire.timestamp_millis() as u64) ^ (1 << 63);
    ordered.to_be_bytes()
}

/// Exclusive upper bound of the pending-expiry keys expiring at or before
/// `now` (millisecond precision).
#[must_use]
pub fn expiry_cutoff(now: &DateTime<Utc>) -> [u8; 8] {
    u64::from_be_bytes(expiry_prefix(now))
        .saturating_add(1)
        .to_be_bytes()
}

/// Create a pending-expiry index key.
///
/// Format: `expire (8 bytes, order preserving) || reservation_id (16 bytes)`
///
/// Since the expiry leads, a forward scan visits reservations soonest
/// expiry first.
#[must_use]
pub fn pending_expiry_key(expire: &DateTime<Utc>, reservation_id: &ReservationId) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&expiry_prefix(expire));
    key.extend_from_slice(&reservation_id.to_bytes());
    key
}

/// Extract the reservation ID from a pending-expiry key.
///
/// Returns `None` if the key is not 24 bytes long.
#[must_use]
pub fn reservation_id_from_expiry_key(key: &[u8]) -> Option<ReservationId> {
    let bytes: [u8; 16] = key.get(8..24)?.try_into().ok()?;
    Some(ReservationId::from_bytes(bytes))
}

/// Create a reserved item key.
///
/// Format: `reservation_id (16 bytes) || item_id (16 bytes)`
#[must_use]
pub fn reserved_item_key(reservation_id: &ReservationId, item_id: &ReservedItemId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(&reservation_id.to_bytes());
    key.extend_from_slice(item_id.as_bytes());
    key
}
