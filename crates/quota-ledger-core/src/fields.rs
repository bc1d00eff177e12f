//! Field data and canonical fingerprints.
//!
//! Services identify their users with authentication data (`tenant_id`,
//! `user_id`, `quota_class`, ...) and identify resources with parameter data.
//! Both are flat maps of field name to scalar value, represented here as
//! [`FieldData`].
//!
//! # Fingerprints
//!
//! A fingerprint is the canonical, order-independent text encoding of a
//! [`FieldData`] map. It doubles as a storage key and as the projection key
//! during quota resolution:
//!
//! ```text
//! alpha="alpha%2F%25%3D%22%27"/bravo=54321/charlie=null/delta=true/echo=false
//! ```
//!
//! Entries are sorted by name and joined with `/`. Strings are quoted, with
//! `%`, `/`, `=`, `"` and `'` percent-encoded so that the separators never
//! appear inside a value.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// An unordered set of field names, kept sorted for deterministic output.
pub type FieldSet = BTreeSet<String>;

/// Characters that are percent-encoded inside fingerprint components.
const RESERVED: [char; 5] = ['%', '/', '=', '"', '\''];

/// Errors raised while building or parsing field data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    /// A value of an unsupported type was supplied (floats, arrays, objects).
    #[error("unsupported value for field {field:?}: {kind}")]
    Unsupported {
        /// The offending field.
        field: String,
        /// What kind of value was supplied.
        kind: &'static str,
    },

    /// Field data was not a map.
    #[error("field data must be an object")]
    NotAnObject,

    /// A fingerprint could not be parsed.
    #[error("malformed fingerprint: {0}")]
    Malformed(String),
}

/// A single scalar field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// An explicit null.
    Null,
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A string.
    Str(String),
}

impl FieldValue {
    fn encode(&self, out: &mut String) {
        match self {
            Self::Null => out.push_str("null"),
            Self::Bool(true) => out.push_str("true"),
            Self::Bool(false) => out.push_str("false"),
            Self::Int(value) => out.push_str(&value.to_string()),
            Self::Str(value) => {
                out.push('"');
                percent_encode(value, out);
                out.push('"');
            }
        }
    }

    fn decode(raw: &str) -> Result<Self, FieldError> {
        match raw.to_ascii_lowercase().as_str() {
            "null" => return Ok(Self::Null),
            "true" => return Ok(Self::Bool(true)),
            "false" => return Ok(Self::Bool(false)),
            _ => {}
        }

        for quote in ['"', '\''] {
            if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
                return percent_decode(&raw[1..raw.len() - 1]).map(Self::Str);
            }
        }

        raw.parse::<i64>()
            .map(Self::Int)
            .map_err(|_| FieldError::Malformed(format!("unrecognized value {raw:?}")))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        self.encode(&mut out);
        f.write_str(&out)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for FieldValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A map of field name to scalar value.
///
/// Used for both authentication data and resource parameter data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldData(BTreeMap<String, FieldValue>);

/// Authentication and authorization data identifying a service user.
pub type AuthData = FieldData;

/// Resource parameter data identifying a specific resource.
pub type ParamData = FieldData;

impl FieldData {
    /// Create empty field data.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(name.into(), value.into());
    }

    /// Look up a field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.get(name)
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }

    /// Keep only the named fields.
    #[must_use]
    pub fn project(&self, fields: &FieldSet) -> Self {
        Self(
            self.0
                .iter()
                .filter(|(name, _)| fields.contains(*name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        )
    }

    /// Names in `fields` that this data does not carry.
    #[must_use]
    pub fn missing(&self, fields: &FieldSet) -> Vec<String> {
        fields
            .iter()
            .filter(|name| !self.0.contains_key(*name))
            .cloned()
            .collect()
    }

    /// Whether every field of `other` is present here with the same value.
    #[must_use]
    pub fn contains_all(&self, other: &Self) -> bool {
        other
            .0
            .iter()
            .all(|(name, value)| self.0.get(name) == Some(value))
    }

    /// The canonical fingerprint of this data.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut out = String::new();
        for (index, (name, value)) in self.0.iter().enumerate() {
            if index > 0 {
                out.push('/');
            }
            percent_encode(name, &mut out);
            out.push('=');
            value.encode(&mut out);
        }
        out
    }

    /// Parse a fingerprint produced by [`FieldData::fingerprint`].
    ///
    /// # Errors
    ///
    /// Returns `FieldError::Malformed` if an entry lacks a `=` or a value
    /// cannot be decoded.
    pub fn from_fingerprint(fingerprint: &str) -> Result<Self, FieldError> {
        let mut data = BTreeMap::new();
        if fingerprint.is_empty() {
            return Ok(Self(data));
        }

        for entry in fingerprint.split('/') {
            let (name, value) = entry
                .split_once('=')
                .ok_or_else(|| FieldError::Malformed(format!("entry without '=': {entry:?}")))?;
            data.insert(percent_decode(name)?, FieldValue::decode(value)?);
        }

        Ok(Self(data))
    }
}

impl fmt::Display for FieldData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for FieldData {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

impl TryFrom<serde_json::Value> for FieldData {
    type Error = FieldError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        let serde_json::Value::Object(map) = value else {
            return Err(FieldError::NotAnObject);
        };

        let mut data = BTreeMap::new();
        for (name, value) in map {
            let value = match value {
                serde_json::Value::Null => FieldValue::Null,
                serde_json::Value::Bool(flag) => FieldValue::Bool(flag),
                serde_json::Value::String(text) => FieldValue::Str(text),
                serde_json::Value::Number(number) => match number.as_i64() {
                    Some(int) => FieldValue::Int(int),
                    None => {
                        return Err(FieldError::Unsupported {
                            field: name,
                            kind: "non-integer number",
                        })
                    }
                },
                serde_json::Value::Array(_) => {
                    return Err(FieldError::Unsupported {
                        field: name,
                        kind: "array",
                    })
                }
                serde_json::Value::Object(_) => {
                    return Err(FieldError::Unsupported {
                        field: name,
                        kind: "object",
                    })
                }
            };
            data.insert(name, value);
        }

        Ok(Self(data))
    }
}

/// Build a [`FieldSet`] from any list of names.
pub fn field_set<I, S>(names: I) -> FieldSet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}

fn percent_encode(raw: &str, out: &mut String) {
    for ch in raw.chars() {
        if RESERVED.contains(&ch) {
            out.push_str(&format!("%{:02X}", ch as u32));
        } else {
            out.push(ch);
        }
    }
}

fn percent_decode(raw: &str) -> Result<String, FieldError> {
    let bytes = raw.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'%' {
            let hex = raw
                .get(index + 1..index + 3)
                .ok_or_else(|| FieldError::Malformed(format!("truncated escape in {raw:?}")))?;
            let byte = u8::from_str_radix(hex, 16)
                .map_err(|_| FieldError::Malformed(format!("bad escape %{hex} in {raw:?}")))?;
            decoded.push(byte);
            index += 3;
        } else {
            decoded.push(bytes[index]);
            index += 1;
        }
    }

    String::from_utf8(decoded).map_err(|e| FieldError::Malformed(e.to_string()))
}
