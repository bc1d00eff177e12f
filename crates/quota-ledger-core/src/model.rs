//! Ledger records.
//!
//! These are the plain data records the ledger stores and hands back to
//! callers. Records never hold references to other records; cross-references
//! are by id, and every operation that accepts a record also accepts its bare
//! id through the `From<&Record> for RecordId` conversions below.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fields::{AuthData, FieldSet, ParamData};
use crate::ids::{
    CategoryId, QuotaId, RefreshId, ReservationId, ReservedItemId, ResourceId, ServiceId, UsageId,
};

/// A client system integrating with the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Unique identifier.
    pub id: ServiceId,

    /// Canonical name, e.g. `compute`. Unique across services.
    pub name: String,

    /// Authentication fields the service supplies for each of its users.
    pub auth_fields: FieldSet,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A group of related resources sharing usage and quota lookup rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Unique identifier.
    pub id: CategoryId,

    /// The owning service.
    pub service_id: ServiceId,

    /// Name, unique within the service.
    pub name: String,

    /// Auth fields selecting the usage record of a user.
    pub usage_fset: FieldSet,

    /// Auth field sets selecting a quota, most specific first.
    ///
    /// Always ends with the empty set, which selects the default quota.
    pub quota_fsets: Vec<FieldSet>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A governed resource, e.g. `instances` or `cores`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique identifier.
    pub id: ResourceId,

    /// The owning service.
    pub service_id: ServiceId,

    /// The category the resource belongs to.
    pub category_id: CategoryId,

    /// Name, unique within the service and category.
    pub name: String,

    /// Parameter fields identifying a specific instance of the resource.
    pub parameters: FieldSet,

    /// Absolute resources keep no usage; limits are compared directly.
    pub absolute: bool,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Current consumption of a resource by one usage fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Unique identifier.
    pub id: UsageId,

    /// The resource consumed.
    pub resource_id: ResourceId,

    /// Parameter data, filtered to the resource's parameters.
    pub parameter_data: ParamData,

    /// Auth data, projected onto the category's usage fields.
    pub auth_data: AuthData,

    /// Amount in use.
    pub used: i64,

    /// Amount provisionally reserved.
    pub reserved: i64,

    /// Quota decisions left before `used` must be resynchronized.
    pub until_refresh: i64,

    /// Token of the refresh currently in flight, if any.
    pub refresh_id: Option<RefreshId>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Usage {
    /// Total consumption counted against a quota.
    #[must_use]
    pub const fn consumed(&self) -> i64 {
        self.used.saturating_add(self.reserved)
    }

    /// Whether a refresh has been issued and not yet completed.
    #[must_use]
    pub const fn is_refreshing(&self) -> bool {
        self.refresh_id.is_some()
    }
}

/// A limit on a resource for the users matching `auth_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Unique identifier.
    pub id: QuotaId,

    /// The limited resource.
    pub resource_id: ResourceId,

    /// Auth data this quota applies to.
    pub auth_data: AuthData,

    /// The limit; `None` is unlimited.
    pub limit: Option<i64>,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Quota {
    /// Whether `consumed + delta` stays within the limit.
    #[must_use]
    pub fn admits(&self, consumed: i64, delta: i64) -> bool {
        self.limit
            .map_or(true, |limit| consumed.saturating_add(delta) <= limit)
    }
}

/// Lifecycle state of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Open; items may be added, and it may be committed or rolled back.
    Pending,

    /// Deltas moved into `used`. Terminal.
    Committed,

    /// Deltas released. Terminal.
    RolledBack,
}

impl ReservationStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Get the status name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope for one or more reserved items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique identifier (ULID, time ordered).
    pub id: ReservationId,

    /// When a still-pending reservation is rolled back by the sweep.
    pub expire: DateTime<Utc>,

    /// Current state.
    pub status: ReservationStatus,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    /// Create a pending reservation expiring at `expire`.
    #[must_use]
    pub fn new(expire: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: ReservationId::generate(),
            expire,
            status: ReservationStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the reservation is pending and past its expiry at `now`.
    ///
    /// A reservation may still be settled at the instant it expires.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Pending && self.expire < now
    }
}

/// One claim against a usage record within a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedItem {
    /// Unique identifier.
    pub id: ReservedItemId,

    /// The enclosing reservation.
    pub reservation_id: ReservationId,

    /// The reserved resource; always equals the usage's resource.
    pub resource_id: ResourceId,

    /// The usage record the delta is applied to.
    pub usage_id: UsageId,

    /// The quota that governed the reservation, re-checked at commit.
    pub quota_id: Option<QuotaId>,

    /// Amount reserved. Negative for early release.
    pub delta: i64,

    /// When the record was created.
    pub created_at: DateTime<Utc>,

    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

macro_rules! record_id {
    ($record:ty, $id:ty) => {
        impl From<&$record> for $id {
            fn from(record: &$record) -> Self {
                record.id
            }
        }
    };
}

record_id!(Service, ServiceId);
record_id!(Category, CategoryId);
record_id!(Resource, ResourceId);
record_id!(Usage, UsageId);
record_id!(Quota, QuotaId);
record_id!(Reservation, ReservationId);
record_id!(ReservedItem, ReservedItemId);
