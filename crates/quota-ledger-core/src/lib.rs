//! Core types for the quota ledger.
//!
//! This crate provides the foundational types shared by the store and the
//! ledger engine:
//!
//! - **Identifiers**: `ServiceId`, `CategoryId`, `ResourceId`, `UsageId`,
//!   `QuotaId`, `ReservationId`, `ReservedItemId`, `RefreshId`
//! - **Field data**: `FieldData`, `FieldValue`, `FieldSet` and fingerprints
//! - **Records**: `Service`, `Category`, `Resource`, `Usage`, `Quota`,
//!   `Reservation`, `ReservedItem`
//! - **Queries**: id-or-natural-key lookups for every record
//! - **Requests**: `ServiceUser`, `SpecificResource`, `ReservationRequest`
//!
//! # Accounting Model
//!
//! A usage record counts `used` and `reserved` amounts of a resource for one
//! fingerprint (resource + auth data + parameter data). A reservation is
//! admitted only while `used + reserved + delta` stays within the most
//! specific quota that matches the caller's auth data.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod fields;
pub mod ids;
pub mod model;
pub mod query;
pub mod request;

pub use error::{LedgerError, Overage, Result};
pub use fields::{field_set, AuthData, FieldData, FieldError, FieldSet, FieldValue, ParamData};
pub use ids::{
    CategoryId, IdError, QuotaId, RefreshId, ReservationId, ReservedItemId, ResourceId, ServiceId,
    UsageId,
};
pub use model::{
    Category, Quota, Reservation, ReservationStatus, ReservedItem, Resource, Service, Usage,
};
pub use query::{
    CategoryKey, CategoryQuery, QuotaKey, QuotaQuery, ResourceKey, ResourceQuery, ServiceKey,
    ServiceQuery, UsageKey, UsageQuery,
};
pub use request::{RequestedDelta, ReservationRequest, ServiceUser, SpecificResource};
