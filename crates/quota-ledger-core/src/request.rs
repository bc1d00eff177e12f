//! Reservation requests and the identities they are made for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::fields::{AuthData, ParamData};
use crate::ids::{ResourceId, ServiceId};
use crate::model::{Resource, Service};

/// A user of a service: the service plus the user's auth data, filtered to
/// the fields the service declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUser {
    /// The service.
    pub service_id: ServiceId,
    /// Auth data restricted to the service's auth fields.
    pub auth_data: AuthData,
}

impl ServiceUser {
    /// Bind auth data to a service.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` if any of the service's auth fields is
    /// missing from `auth_data`.
    pub fn new(service: &Service, auth_data: &AuthData) -> Result<Self> {
        let missing = auth_data.missing(&service.auth_fields);
        if !missing.is_empty() {
            return Err(LedgerError::invalid(format!(
                "missing auth data fields: {}",
                missing.join(", ")
            )));
        }

        Ok(Self {
            service_id: service.id,
            auth_data: auth_data.project(&service.auth_fields),
        })
    }
}

/// A resource narrowed down by its parameter data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SpecificResource {
    /// The resource.
    pub resource_id: ResourceId,
    /// Parameter data restricted to the resource's parameters.
    pub param_data: ParamData,
    /// Canonical name, `service/resource[/name=value...]`.
    pub name: String,
}

impl SpecificResource {
    /// Narrow a resource by parameter data.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` if the resource does not belong to the
    /// service or a declared parameter is missing.
    pub fn new(service: &Service, resource: &Resource, param_data: &ParamData) -> Result<Self> {
        if resource.service_id != service.id {
            return Err(LedgerError::invalid(format!(
                "resource {} does not belong to service {}",
                resource.name, service.name
            )));
        }

        let missing = param_data.missing(&resource.parameters);
        if !missing.is_empty() {
            return Err(LedgerError::invalid(format!(
                "missing parameter data fields: {}",
                missing.join(", ")
            )));
        }

        let param_data = param_data.project(&resource.parameters);
        let mut name = format!("{}/{}", service.name, resource.name);
        for (field, value) in param_data.iter() {
            name.push('/');
            name.push_str(field);
            name.push('=');
            name.push_str(&value.to_string());
        }

        Ok(Self {
            resource_id: resource.id,
            param_data,
            name,
        })
    }
}

/// One resource delta within a reservation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedDelta {
    /// The resource.
    pub resource: ResourceId,
    /// Parameter data selecting the specific resource.
    #[serde(default)]
    pub param_data: ParamData,
    /// Amount to reserve; negative to release.
    pub delta: i64,
}

/// A request to reserve several resources for one service user at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    /// The service the request is made through.
    pub service: ServiceId,
    /// The user's auth data.
    pub auth_data: AuthData,
    /// The resources and amounts to reserve.
    pub deltas: Vec<RequestedDelta>,
    /// Expiry; the configured TTL applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire: Option<DateTime<Utc>>,
}

impl ReservationRequest {
    /// Start a request for a service user.
    #[must_use]
    pub fn new(service: impl Into<ServiceId>, auth_data: AuthData) -> Self {
        Self {
            service: service.into(),
            auth_data,
            deltas: Vec::new(),
            expire: None,
        }
    }

    /// Add a resource delta.
    #[must_use]
    pub fn with_delta(
        mut self,
        resource: impl Into<ResourceId>,
        param_data: ParamData,
        delta: i64,
    ) -> Self {
        self.deltas.push(RequestedDelta {
            resource: resource.into(),
            param_data,
            delta,
        });
        self
    }

    /// Set an explicit expiry.
    #[must_use]
    pub fn with_expire(mut self, expire: DateTime<Utc>) -> Self {
        self.expire = Some(expire);
        self
    }
}
