//! Identifier types for the quota ledger.
//!
//! Every ledger entity is addressed by a strongly-typed identifier so that a
//! usage id can never be handed to an operation expecting a quota id. All
//! identifiers are 16 bytes wide, which keeps composite store keys fixed
//! width.
//!
//! Registry and accounting records use random UUIDs (`uuid_id_type!`).
//! Reservations use ULIDs so their keys sort by creation time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Parsing, formatting and string conversions shared by every id type.
///
/// `$parse` turns a `&str` into the inner value or `None`; `$err` is the
/// `IdError` reported when it fails.
macro_rules! id_conversions {
    ($name:ident, $parse:expr, $err:expr) => {
        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let parse: fn(&str) -> Option<_> = $parse;
                parse(s).map(Self).ok_or($err)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0.to_string()
            }
        }
    };
}

/// Define a random UUID identifier stored as its 16 raw bytes in keys.
///
/// ```ignore
/// uuid_id_type!(MyId, "A custom identifier type.");
/// let id = MyId::generate();
/// assert_eq!(MyId::from_bytes(*id.as_bytes()), id);
/// ```
macro_rules! uuid_id_type {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(uuid::Uuid);

        impl $name {
            /// Generate a new random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// Key bytes of the identifier.
            #[must_use]
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            /// Rebuild an identifier from its key bytes.
            #[must_use]
            pub const fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(uuid::Uuid::from_bytes(bytes))
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        id_conversions!($name, |s| uuid::Uuid::parse_str(s).ok(), IdError::InvalidUuid);
    };
}

uuid_id_type!(ServiceId, "A service identifier.\n\nServices are the client systems (compute, images, ...) that register resources with the ledger.");
uuid_id_type!(CategoryId, "A resource category identifier.");
uuid_id_type!(ResourceId, "A resource identifier.");
uuid_id_type!(UsageId, "A usage record identifier.");
uuid_id_type!(QuotaId, "A quota identifier.");
uuid_id_type!(ReservedItemId, "A reserved item identifier.");
uuid_id_type!(RefreshId, "A usage refresh token.\n\nStamped on a usage row when a resynchronization is issued; only the refresh holding the current token may write its result back.");

/// A reservation identifier.
///
/// ULID based, so reservation keys and the ids inside the pending-expiry
/// index sort by creation time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReservationId(Ulid);

impl ReservationId {
    /// Generate a new identifier stamped with the current time.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Key bytes of the identifier.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_bytes()
    }

    /// Rebuild an identifier from its key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Ulid::from_bytes(bytes))
    }
}

id_conversions!(ReservationId, |s| Ulid::from_string(s).ok(), IdError::InvalidUlid);

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,

    /// The input is not a valid ULID.
    #[error("invalid ULID format")]
    InvalidUlid,
}
