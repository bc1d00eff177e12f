//! Database schema definitions and column families.
//!
//! Both backends store the same column families; the in-memory backend
//! simply keeps one ordered map per family.

/// Column family names.
pub mod cf {
    /// Service records, keyed by `service_id`.
    pub const SERVICES: &str = "services";

    /// Unique index: service name → `service_id`.
    pub const SERVICE_NAMES: &str = "service_names";

    /// Category records, keyed by `category_id`.
    pub const CATEGORIES: &str = "categories";

    /// Unique index: `service_id || name` → `category_id`.
    pub const CATEGORY_NAMES: &str = "category_names";

    /// Resource records, keyed by `resource_id`.
    pub const RESOURCES: &str = "resources";

    /// Unique index: `service_id || category_id || name` → `resource_id`.
    pub const RESOURCE_NAMES: &str = "resource_names";

    /// Usage records, keyed by `usage_id`.
    pub const USAGES: &str = "usages";

    /// Unique index: `resource_id || len(auth) || auth fingerprint || param fingerprint` → `usage_id`.
    pub const USAGE_KEYS: &str = "usage_keys";

    /// Quota records, keyed by `quota_id`.
    pub const QUOTAS: &str = "quotas";

    /// Unique index: `resource_id || auth fingerprint` → `quota_id`.
    pub const QUOTA_KEYS: &str = "quota_keys";

    /// Reservation records, keyed by `reservation_id` (ULID).
    pub const RESERVATIONS: &str = "reservations";

    /// Index: pending reservations by expiry, keyed by `expire || reservation_id`.
    /// Value is empty (index only).
    pub const PENDING_EXPIRY: &str = "pending_expiry";

    /// Reserved items, keyed by `reservation_id || item_id`.
    pub const RESERVED_ITEMS: &str = "reserved_items";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::SERVICES,
        cf::SERVICE_NAMES,
        cf::CATEGORIES,
        cf::CATEGORY_NAMES,
        cf::RESOURCES,
        cf::RESOURCE_NAMES,
        cf::USAGES,
        cf::USAGE_KEYS,
        cf::QUOTAS,
        cf::QUOTA_KEYS,
        cf::RESERVATIONS,
        cf::PENDING_EXPIRY,
        cf::RESERVED_ITEMS,
    ]
}
