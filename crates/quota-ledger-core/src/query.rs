//! Lookup queries.
//!
//! Every `get_*` operation takes a query naming either the record's id or
//! the full set of natural-key components. Queries are normalized into a
//! key enum once, at the entry of the operation; supplying neither, both,
//! or only part of a natural key is rejected with
//! [`LedgerError::InvalidArguments`].

use crate::error::{LedgerError, Result};
use crate::fields::{AuthData, ParamData};
use crate::ids::{CategoryId, QuotaId, ResourceId, ServiceId, UsageId};

/// Query for a single service.
#[derive(Debug, Clone, Default)]
pub struct ServiceQuery {
    /// Look up by id.
    pub id: Option<ServiceId>,
    /// Look up by name.
    pub name: Option<String>,
}

/// A normalized service lookup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceKey {
    /// By id.
    Id(ServiceId),
    /// By unique name.
    Name(String),
}

impl ServiceQuery {
    /// Query by id.
    #[must_use]
    pub fn by_id(id: impl Into<ServiceId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Query by name.
    #[must_use]
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Normalize into a lookup key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` unless exactly one of id and name is set.
    pub fn key(&self) -> Result<ServiceKey> {
        match (&self.id, &self.name) {
            (Some(id), None) => Ok(ServiceKey::Id(*id)),
            (None, Some(name)) => Ok(ServiceKey::Name(name.clone())),
            (Some(_), Some(_)) => Err(LedgerError::invalid(
                "service lookup takes an id or a name, not both",
            )),
            (None, None) => Err(LedgerError::invalid(
                "service lookup requires an id or a name",
            )),
        }
    }
}

/// Query for a single category.
#[derive(Debug, Clone, Default)]
pub struct CategoryQuery {
    /// Look up by id.
    pub id: Option<CategoryId>,
    /// Owning service, for lookup by name.
    pub service: Option<ServiceId>,
    /// Category name, for lookup by name.
    pub name: Option<String>,
}

/// A normalized category lookup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryKey {
    /// By id.
    Id(CategoryId),
    /// By service and name.
    Name {
        /// The owning service.
        service: ServiceId,
        /// The category name.
        name: String,
    },
}

impl CategoryQuery {
    /// Query by id.
    #[must_use]
    pub fn by_id(id: impl Into<CategoryId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Query by service and name.
    #[must_use]
    pub fn by_name(service: impl Into<ServiceId>, name: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Normalize into a lookup key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` unless exactly one of id or
    /// (service, name) is fully set.
    pub fn key(&self) -> Result<CategoryKey> {
        match (&self.id, &self.service, &self.name) {
            (Some(id), None, None) => Ok(CategoryKey::Id(*id)),
            (None, Some(service), Some(name)) => Ok(CategoryKey::Name {
                service: *service,
                name: name.clone(),
            }),
            _ => Err(LedgerError::invalid(
                "category lookup takes either an id or a service and name",
            )),
        }
    }
}

/// Query for a single resource.
#[derive(Debug, Clone, Default)]
pub struct ResourceQuery {
    /// Look up by id.
    pub id: Option<ResourceId>,
    /// Owning service, for lookup by name.
    pub service: Option<ServiceId>,
    /// Owning category, for lookup by name.
    pub category: Option<CategoryId>,
    /// Resource name, for lookup by name.
    pub name: Option<String>,
}

/// A normalized resource lookup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceKey {
    /// By id.
    Id(ResourceId),
    /// By service, category and name.
    Name {
        /// The owning service.
        service: ServiceId,
        /// The owning category.
        category: CategoryId,
        /// The resource name.
        name: String,
    },
}

impl ResourceQuery {
    /// Query by id.
    #[must_use]
    pub fn by_id(id: impl Into<ResourceId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Query by service, category and name.
    #[must_use]
    pub fn by_name(
        service: impl Into<ServiceId>,
        category: impl Into<CategoryId>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            service: Some(service.into()),
            category: Some(category.into()),
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Normalize into a lookup key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` unless exactly one of id or
    /// (service, category, name) is fully set.
    pub fn key(&self) -> Result<ResourceKey> {
        match (&self.id, &self.service, &self.category, &self.name) {
            (Some(id), None, None, None) => Ok(ResourceKey::Id(*id)),
            (None, Some(service), Some(category), Some(name)) => Ok(ResourceKey::Name {
                service: *service,
                category: *category,
                name: name.clone(),
            }),
            _ => Err(LedgerError::invalid(
                "resource lookup takes either an id or a service, category and name",
            )),
        }
    }
}

/// Query for a single usage record.
#[derive(Debug, Clone, Default)]
pub struct UsageQuery {
    /// Look up by id.
    pub id: Option<UsageId>,
    /// Resource, for lookup by fingerprint.
    pub resource: Option<ResourceId>,
    /// Parameter data, for lookup by fingerprint.
    pub param_data: Option<ParamData>,
    /// Auth data, for lookup by fingerprint.
    pub auth_data: Option<AuthData>,
}

/// A normalized usage lookup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageKey {
    /// By id.
    Id(UsageId),
    /// By resource and fingerprints.
    Fingerprint {
        /// The resource.
        resource: ResourceId,
        /// Parameter data (unfiltered).
        param_data: ParamData,
        /// Auth data (unprojected).
        auth_data: AuthData,
    },
}

impl UsageQuery {
    /// Query by id.
    #[must_use]
    pub fn by_id(id: impl Into<UsageId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Query by resource, parameter data and auth data.
    #[must_use]
    pub fn by_fingerprint(
        resource: impl Into<ResourceId>,
        param_data: ParamData,
        auth_data: AuthData,
    ) -> Self {
        Self {
            resource: Some(resource.into()),
            param_data: Some(param_data),
            auth_data: Some(auth_data),
            ..Self::default()
        }
    }

    /// Normalize into a lookup key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` unless exactly one of id or
    /// (resource, param data, auth data) is fully set.
    pub fn key(&self) -> Result<UsageKey> {
        match (&self.id, &self.resource, &self.param_data, &self.auth_data) {
            (Some(id), None, None, None) => Ok(UsageKey::Id(*id)),
            (None, Some(resource), Some(param_data), Some(auth_data)) => {
                Ok(UsageKey::Fingerprint {
                    resource: *resource,
                    param_data: param_data.clone(),
                    auth_data: auth_data.clone(),
                })
            }
            _ => Err(LedgerError::invalid(
                "usage lookup takes either an id or a resource, parameter data and auth data",
            )),
        }
    }
}

/// Query for a single quota.
#[derive(Debug, Clone, Default)]
pub struct QuotaQuery {
    /// Look up by id.
    pub id: Option<QuotaId>,
    /// Resource, for lookup by auth data.
    pub resource: Option<ResourceId>,
    /// Auth data, for lookup by auth data.
    pub auth_data: Option<AuthData>,
}

/// A normalized quota lookup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaKey {
    /// By id.
    Id(QuotaId),
    /// By resource and exact auth data.
    AuthData {
        /// The resource.
        resource: ResourceId,
        /// The auth data the quota was created with.
        auth_data: AuthData,
    },
}

impl QuotaQuery {
    /// Query by id.
    #[must_use]
    pub fn by_id(id: impl Into<QuotaId>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Query by resource and auth data.
    #[must_use]
    pub fn by_auth_data(resource: impl Into<ResourceId>, auth_data: AuthData) -> Self {
        Self {
            resource: Some(resource.into()),
            auth_data: Some(auth_data),
            ..Self::default()
        }
    }

    /// Normalize into a lookup key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` unless exactly one of id or
    /// (resource, auth data) is fully set.
    pub fn key(&self) -> Result<QuotaKey> {
        match (&self.id, &self.resource, &self.auth_data) {
            (Some(id), None, None) => Ok(QuotaKey::Id(*id)),
            (None, Some(resource), Some(auth_data)) => Ok(QuotaKey::AuthData {
                resource: *resource,
                auth_data: auth_data.clone(),
            }),
            _ => Err(LedgerError::invalid(
                "quota lookup takes either an id or a resource and auth data",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_query_requires_exactly_one_key() {
        assert!(ServiceQuery::by_name("compute").key().is_ok());
        assert!(ServiceQuery::by_id(ServiceId::generate()).key().is_ok());

        let both = ServiceQuery {
            id: Some(ServiceId::generate()),
            name: Some("compute".into()),
        };
        assert!(matches!(both.key(), Err(LedgerError::InvalidArguments(_))));
        assert!(matches!(
            ServiceQuery::default().key(),
            Err(LedgerError::InvalidArguments(_))
        ));
    }

    #[test]
    fn partial_natural_keys_are_rejected() {
        let partial = CategoryQuery {
            name: Some("instances".into()),
            ..CategoryQuery::default()
        };
        assert!(matches!(partial.key(), Err(LedgerError::InvalidArguments(_))));

        let mixed = ResourceQuery {
            id: Some(ResourceId::generate()),
            name: Some("cores".into()),
            ..ResourceQuery::default()
        };
        assert!(matches!(mixed.key(), Err(LedgerError::InvalidArguments(_))));

        let no_params = UsageQuery {
            resource: Some(ResourceId::generate()),
            auth_data: Some(AuthData::new()),
            ..UsageQuery::default()
        };
        assert!(matches!(
            no_params.key(),
            Err(LedgerError::InvalidArguments(_))
        ));
    }

    #[test]
    fn quota_query_by_auth_data() {
        let resource = ResourceId::generate();
        let auth = AuthData::new().with("tenant_id", "T1");
        let key = QuotaQuery::by_auth_data(resource, auth.clone()).key().unwrap();
        assert_eq!(
            key,
            QuotaKey::AuthData {
                resource,
                auth_data: auth
            }
        );
    }
}
