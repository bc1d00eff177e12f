//! Error types for ledger storage.

use quota_ledger_core::LedgerError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A unique index already holds the key.
    #[error("unique constraint violated on {entity}: existing {existing}")]
    UniqueViolation {
        /// The kind of record being inserted.
        entity: &'static str,
        /// Id of the record already holding the key.
        existing: String,
    },

    /// A row lock could not be acquired in time.
    #[error("lock wait timed out on {table}")]
    LockTimeout {
        /// The column family of the contended row.
        table: &'static str,
    },

    /// The store refused the operation for now (deadlock, write conflict).
    #[error("store busy: {0}")]
    Busy(String),
}

impl StoreError {
    /// Whether retrying in a fresh transaction may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Busy(_))
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation { entity, existing } => {
                Self::Duplicate { entity, existing }
            }
            StoreError::LockTimeout { .. } | StoreError::Busy(_) => Self::Transient(err.to_string()),
            StoreError::Serialization(msg) => Self::Serialization(msg),
            StoreError::Database(msg) => Self::Storage(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_violation_maps_to_duplicate() {
        let err: LedgerError = StoreError::UniqueViolation {
            entity: "service",
            existing: "abc".into(),
        }
        .into();
        assert!(matches!(
            err,
            LedgerError::Duplicate {
                entity: "service",
                ..
            }
        ));
    }

    #[test]
    fn lock_timeouts_are_transient() {
        let err = StoreError::LockTimeout { table: "usages" };
        assert!(err.is_transient());
        assert!(LedgerError::from(err).is_retryable());
        assert!(!LedgerError::from(StoreError::Database("io".into())).is_retryable());
    }
}
