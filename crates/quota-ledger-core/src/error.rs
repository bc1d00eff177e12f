//! Error types for the quota ledger.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fields::FieldError;
use crate::ids::{IdError, ReservationId, ResourceId, UsageId};
use crate::model::ReservationStatus;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur in ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A record with the same natural key already exists.
    #[error("{entity} already exists: {existing}")]
    Duplicate {
        /// The kind of record.
        entity: &'static str,
        /// Id of the conflicting record.
        existing: String,
    },

    /// The identifiers or values supplied do not form a valid request.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// No record matched the lookup.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// The kind of record.
        entity: &'static str,
        /// The key that was looked up.
        key: String,
    },

    /// The request would exceed one or more quotas.
    #[error("over quota: {}", summarize(.overages))]
    OverQuota {
        /// One entry per resource that would exceed its limit.
        overages: Vec<Overage>,
    },

    /// The reservation is not in a state that permits the operation.
    #[error("reservation {reservation_id} is {status}")]
    InvalidState {
        /// The reservation.
        reservation_id: ReservationId,
        /// Its current status.
        status: ReservationStatus,
    },

    /// The reservation is still pending but past its expiry; it can only be
    /// rolled back.
    #[error("reservation {reservation_id} expired at {expire}")]
    Expired {
        /// The reservation.
        reservation_id: ReservationId,
        /// Its expiry.
        expire: DateTime<Utc>,
    },

    /// A usage refresh lost the race against a newer refresh.
    #[error("stale refresh for usage {usage_id}")]
    StaleRefresh {
        /// The usage whose refresh was discarded.
        usage_id: UsageId,
    },

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Temporary storage failure (lock timeout, busy store); retry with a
    /// fresh transaction.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LedgerError {
    /// Build a `NotFound` error.
    pub fn not_found(entity: &'static str, key: impl fmt::Display) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Build an `InvalidArguments` error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }

    /// Whether the caller may retry the operation in a fresh transaction.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::StaleRefresh { .. })
    }
}

impl From<FieldError> for LedgerError {
    fn from(err: FieldError) -> Self {
        Self::InvalidArguments(err.to_string())
    }
}

/// How far a single resource would exceed its quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overage {
    /// The resource.
    pub resource_id: ResourceId,

    /// The resource name.
    pub resource: String,

    /// The resolved limit.
    pub limit: i64,

    /// Amount already consumed (`used + reserved`, zero for absolute resources).
    pub consumed: i64,

    /// Amount requested.
    pub requested: i64,
}

impl Overage {
    /// Amount by which the request exceeds the limit.
    #[must_use]
    pub const fn excess(&self) -> i64 {
        self.consumed.saturating_add(self.requested) - self.limit
    }

    /// Largest request that would still fit, never negative.
    #[must_use]
    pub fn headroom(&self) -> i64 {
        (self.limit - self.consumed).max(0)
    }
}

impl fmt::Display for Overage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} exceeds limit {} by {} (consumed={}, requested={})",
            self.resource,
            self.limit,
            self.excess(),
            self.consumed,
            self.requested
        )
    }
}

fn summarize(overages: &[Overage]) -> String {
    overages
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
