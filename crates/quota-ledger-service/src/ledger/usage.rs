//! Usage rows and the refresh protocol.
//!
//! A usage row counts what one fingerprint (resource, auth data, parameter
//! data) has `used` and `reserved`. Because `used` can drift from what the
//! client service actually holds, every quota decision that reads a row
//! counts down `until_refresh`; when it reaches zero the row is due for a
//! resync. A resync is guarded by a `refresh_id` token rather than a lock:
//! only the most recently issued refresh may write its count back.

use chrono::Utc;
use quota_ledger_core::{
    AuthData, Category, LedgerError, ParamData, RefreshId, Resource, ResourceId, Result, Usage,
    UsageId, UsageKey, UsageQuery,
};
use quota_ledger_store::{KvTransaction, Tables};
use serde::{Deserialize, Serialize};

use super::{load_category, load_resource, Ledger};

/// A usage row to create, with the counters it starts from.
#[derive(Debug, Clone)]
pub struct NewUsage {
    resource: ResourceId,
    param_data: ParamData,
    auth_data: AuthData,
    used: i64,
    reserved: i64,
    until_refresh: i64,
    refresh_id: Option<RefreshId>,
}

impl NewUsage {
    /// Start a usage row for a fingerprint, with every counter at zero.
    #[must_use]
    pub fn new(resource: impl Into<ResourceId>, param_data: ParamData, auth_data: AuthData) -> Self {
        Self {
            resource: resource.into(),
            param_data,
            auth_data,
            used: 0,
            reserved: 0,
            until_refresh: 0,
            refresh_id: None,
        }
    }

    /// Set the amount in use.
    #[must_use]
    pub const fn used(mut self, used: i64) -> Self {
        self.used = used;
        self
    }

    /// Set the amount reserved.
    #[must_use]
    pub const fn reserved(mut self, reserved: i64) -> Self {
        self.reserved = reserved;
        self
    }

    /// Set the refresh countdown.
    #[must_use]
    pub const fn until_refresh(mut self, until_refresh: i64) -> Self {
        self.until_refresh = until_refresh;
        self
    }

    /// Mark a refresh as in flight.
    #[must_use]
    pub const fn refresh_id(mut self, refresh_id: RefreshId) -> Self {
        self.refresh_id = Some(refresh_id);
        self
    }
}

/// Proof that a refresh was issued for a usage row.
///
/// Carries the fingerprint so the counter can find what to count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshTicket {
    /// The usage being refreshed.
    pub usage_id: UsageId,
    /// Its resource.
    pub resource_id: ResourceId,
    /// Its parameter data.
    pub param_data: ParamData,
    /// Its auth data.
    pub auth_data: AuthData,
    /// The token stamped on the row.
    pub refresh_id: RefreshId,
}

/// Project caller data onto the fingerprint of a usage row.
fn usage_fingerprint(
    resource: &Resource,
    category: &Category,
    param_data: &ParamData,
    auth_data: &AuthData,
) -> Result<(ParamData, AuthData)> {
    let missing = param_data.missing(&resource.parameters);
    if !missing.is_empty() {
        return Err(LedgerError::invalid(format!(
            "missing parameter data fields for {}: {}",
            resource.name,
            missing.join(", ")
        )));
    }
    let missing = auth_data.missing(&category.usage_fset);
    if !missing.is_empty() {
        return Err(LedgerError::invalid(format!(
            "missing auth data fields for {}: {}",
            category.name,
            missing.join(", ")
        )));
    }
    Ok((
        param_data.project(&resource.parameters),
        auth_data.project(&category.usage_fset),
    ))
}

fn tracked_resource<T: KvTransaction>(tx: &T, id: &ResourceId) -> Result<(Resource, Category)> {
    let resource = load_resource(tx, id)?;
    if resource.absolute {
        return Err(LedgerError::invalid(format!(
            "resource {} is absolute and keeps no usage",
            resource.name
        )));
    }
    let category = load_category(tx, &resource.category_id)?;
    Ok((resource, category))
}

impl Ledger {
    /// Create a usage row.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` if the resource is absolute or the data
    /// lacks a parameter or usage field, `NotFound` if the resource does not
    /// exist, and `Duplicate` if the fingerprint already has a row.
    pub fn create_usage<T: KvTransaction>(&self, tx: &mut T, new: NewUsage) -> Result<Usage> {
        let (resource, category) = tracked_resource(tx, &new.resource)?;
        let (parameter_data, auth_data) =
            usage_fingerprint(&resource, &category, &new.param_data, &new.auth_data)?;

        let now = Utc::now();
        let usage = Usage {
            id: UsageId::generate(),
            resource_id: resource.id,
            parameter_data,
            auth_data,
            used: new.used,
            reserved: new.reserved,
            until_refresh: new.until_refresh,
            refresh_id: new.refresh_id,
            created_at: now,
            updated_at: now,
        };
        tx.insert_usage(&usage)?;

        tracing::debug!(usage_id = %usage.id, resource = %resource.name, "Usage created");
        Ok(usage)
    }

    /// Look up a usage row by id or by fingerprint.
    ///
    /// Fingerprint data is projected the same way `create_usage` projects
    /// it, so extra fields are ignored.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` for an incomplete or ambiguous query or data
    /// lacking a required field, and `NotFound` if no row matches.
    pub fn get_usage<T: KvTransaction>(&self, tx: &T, query: &UsageQuery) -> Result<Usage> {
        match query.key()? {
            UsageKey::Id(id) => tx
                .usage(&id)?
                .ok_or_else(|| LedgerError::not_found("usage", id)),
            UsageKey::Fingerprint {
                resource,
                param_data,
                auth_data,
            } => {
                let (resource, category) = tracked_resource(tx, &resource)?;
                let (param_data, auth_data) =
                    usage_fingerprint(&resource, &category, &param_data, &auth_data)?;
                tx.usage_by_fingerprint(&resource.id, &auth_data, &param_data)?
                    .ok_or_else(|| {
                        LedgerError::not_found(
                            "usage",
                            format!(
                                "{}/{}/{}",
                                resource.name,
                                auth_data.fingerprint(),
                                param_data.fingerprint()
                            ),
                        )
                    })
            }
        }
    }

    /// List usage rows, optionally restricted to a resource and to rows whose
    /// parameter and auth data contain the given fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn get_usages<T: KvTransaction>(
        &self,
        tx: &T,
        resource: Option<ResourceId>,
        param_data: Option<&ParamData>,
        auth_data: Option<&AuthData>,
    ) -> Result<Vec<Usage>> {
        Ok(tx
            .usages(resource.as_ref())?
            .into_iter()
            .filter(|u| param_data.map_or(true, |p| u.parameter_data.contains_all(p)))
            .filter(|u| auth_data.map_or(true, |a| u.auth_data.contains_all(a)))
            .collect())
    }

    /// Lock the usage row of a fingerprint, creating it if it does not exist.
    ///
    /// New rows start with the configured refresh interval. The row stays
    /// locked until the transaction ends.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` if the resource is absolute or the data
    /// lacks a required field, and `NotFound` if the resource does not exist.
    pub fn usage_for<T: KvTransaction>(
        &self,
        tx: &mut T,
        resource: impl Into<ResourceId>,
        param_data: &ParamData,
        auth_data: &AuthData,
    ) -> Result<Usage> {
        let (resource, category) = tracked_resource(tx, &resource.into())?;
        self.lock_usage(tx, &resource, &category, param_data, auth_data)
    }

    pub(super) fn lock_usage<T: KvTransaction>(
        &self,
        tx: &mut T,
        resource: &Resource,
        category: &Category,
        param_data: &ParamData,
        auth_data: &AuthData,
    ) -> Result<Usage> {
        let (parameter_data, auth_data) =
            usage_fingerprint(resource, category, param_data, auth_data)?;
        if let Some(usage) =
            tx.usage_by_fingerprint_for_update(&resource.id, &auth_data, &parameter_data)?
        {
            return Ok(usage);
        }

        let now = Utc::now();
        let usage = Usage {
            id: UsageId::generate(),
            resource_id: resource.id,
            parameter_data,
            auth_data,
            used: 0,
            reserved: 0,
            until_refresh: self.config.refresh_interval,
            refresh_id: None,
            created_at: now,
            updated_at: now,
        };
        tx.insert_usage(&usage)?;

        tracing::debug!(usage_id = %usage.id, resource = %resource.name, "Usage created lazily");
        Ok(usage)
    }

    /// Count down the refresh counter of a row that informed a quota
    /// decision. Returns whether a refresh became due.
    pub(super) fn consult(usage: &mut Usage) -> bool {
        if usage.until_refresh <= 0 {
            return false;
        }
        usage.until_refresh -= 1;
        usage.until_refresh == 0
    }

    /// Issue a refresh for a usage row, superseding any refresh in flight.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the row does not exist.
    pub fn begin_refresh<T: KvTransaction>(
        &self,
        tx: &mut T,
        usage: impl Into<UsageId>,
    ) -> Result<RefreshTicket> {
        let usage_id = usage.into();
        let mut usage = tx
            .usage_for_update(&usage_id)?
            .ok_or_else(|| LedgerError::not_found("usage", usage_id))?;

        let refresh_id = RefreshId::generate();
        if let Some(previous) = usage.refresh_id {
            tracing::debug!(usage_id = %usage.id, %previous, "Superseding refresh in flight");
        }
        usage.refresh_id = Some(refresh_id);
        usage.updated_at = Utc::now();
        tx.put_usage(&usage)?;

        tracing::info!(usage_id = %usage.id, %refresh_id, "Usage refresh issued");
        Ok(RefreshTicket {
            usage_id: usage.id,
            resource_id: usage.resource_id,
            param_data: usage.parameter_data,
            auth_data: usage.auth_data,
            refresh_id,
        })
    }

    /// Write back the authoritative `used` count of a refresh.
    ///
    /// Resets the refresh countdown and clears the token.
    ///
    /// # Errors
    ///
    /// Returns `StaleRefresh` without writing anything if a newer refresh was
    /// issued (or the refresh already completed), and `NotFound` if the row
    /// does not exist.
    pub fn complete_refresh<T: KvTransaction>(
        &self,
        tx: &mut T,
        ticket: &RefreshTicket,
        used: i64,
    ) -> Result<Usage> {
        let mut usage = tx
            .usage_for_update(&ticket.usage_id)?
            .ok_or_else(|| LedgerError::not_found("usage", ticket.usage_id))?;

        if usage.refresh_id != Some(ticket.refresh_id) {
            tracing::warn!(
                usage_id = %usage.id,
                refresh_id = %ticket.refresh_id,
                "Discarding stale usage refresh"
            );
            return Err(LedgerError::StaleRefresh { usage_id: usage.id });
        }

        let previous = usage.used;
        usage.used = used;
        usage.until_refresh = self.config.refresh_interval;
        usage.refresh_id = None;
        usage.updated_at = Utc::now();
        tx.put_usage(&usage)?;

        tracing::info!(usage_id = %usage.id, previous, used, "Usage refreshed");
        Ok(usage)
    }
}
