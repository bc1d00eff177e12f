//! Quota records and limit resolution.

use chrono::Utc;
use quota_ledger_core::{
    AuthData, Category, LedgerError, Overage, Quota, QuotaId, QuotaKey, QuotaQuery, Resource,
    ResourceId, Result,
};
use quota_ledger_store::{KvTransaction, Tables};

use super::{load_category, load_resource, load_service, Ledger};

fn check_limit(limit: Option<i64>) -> Result<()> {
    match limit {
        Some(limit) if limit < 0 => Err(LedgerError::invalid(format!(
            "quota limit must not be negative, got {limit}"
        ))),
        _ => Ok(()),
    }
}

/// Find the most specific quota of `resource` matching `auth_data`.
///
/// Field sets the auth data does not fully cover are skipped.
pub(super) fn resolve<T: KvTransaction>(
    tx: &T,
    resource: &Resource,
    category: &Category,
    auth_data: &AuthData,
) -> Result<Option<Quota>> {
    for fset in &category.quota_fsets {
        if !auth_data.missing(fset).is_empty() {
            continue;
        }
        if let Some(quota) = tx.quota_by_auth(&resource.id, &auth_data.project(fset))? {
            return Ok(Some(quota));
        }
    }
    Ok(None)
}

impl Ledger {
    /// Create a quota on a resource for the users matching `auth_data`.
    ///
    /// Auth data is restricted to the service's auth fields. A `None` limit
    /// is unlimited.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource does not exist, `InvalidArguments`
    /// for a negative limit, and `Duplicate` if the resource already has a
    /// quota for this auth data.
    pub fn create_quota<T: KvTransaction>(
        &self,
        tx: &mut T,
        resource: impl Into<ResourceId>,
        auth_data: &AuthData,
        limit: Option<i64>,
    ) -> Result<Quota> {
        check_limit(limit)?;
        let resource = load_resource(tx, &resource.into())?;
        let service = load_service(tx, &resource.service_id)?;

        let now = Utc::now();
        let quota = Quota {
            id: QuotaId::generate(),
            resource_id: resource.id,
            auth_data: auth_data.project(&service.auth_fields),
            limit,
            created_at: now,
            updated_at: now,
        };
        tx.insert_quota(&quota)?;

        tracing::info!(
            quota_id = %quota.id,
            resource = %resource.name,
            auth = %quota.auth_data.fingerprint(),
            limit = ?quota.limit,
            "Quota created"
        );
        Ok(quota)
    }

    /// Look up a quota by id or by resource and exact auth data.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` for an incomplete or ambiguous query, and
    /// `NotFound` if no quota matches.
    pub fn get_quota<T: KvTransaction>(&self, tx: &T, query: &QuotaQuery) -> Result<Quota> {
        match query.key()? {
            QuotaKey::Id(id) => tx
                .quota(&id)?
                .ok_or_else(|| LedgerError::not_found("quota", id)),
            QuotaKey::AuthData {
                resource,
                auth_data,
            } => {
                let resource = load_resource(tx, &resource)?;
                let service = load_service(tx, &resource.service_id)?;
                let auth_data = auth_data.project(&service.auth_fields);
                tx.quota_by_auth(&resource.id, &auth_data)?.ok_or_else(|| {
                    LedgerError::not_found(
                        "quota",
                        format!("{}/{}", resource.name, auth_data.fingerprint()),
                    )
                })
            }
        }
    }

    /// List quotas, optionally restricted to a resource and to quotas whose
    /// auth data contains the given fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn get_quotas<T: KvTransaction>(
        &self,
        tx: &T,
        resource: Option<ResourceId>,
        auth_data: Option<&AuthData>,
    ) -> Result<Vec<Quota>> {
        Ok(tx
            .quotas(resource.as_ref())?
            .into_iter()
            .filter(|q| auth_data.map_or(true, |a| q.auth_data.contains_all(a)))
            .collect())
    }

    /// Change the limit of a quota.
    ///
    /// Lowering a limit does not touch existing reservations, but a pending
    /// reservation that no longer fits is refused at commit.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the quota does not exist and `InvalidArguments`
    /// for a negative limit.
    pub fn set_quota_limit<T: KvTransaction>(
        &self,
        tx: &mut T,
        quota: impl Into<QuotaId>,
        limit: Option<i64>,
    ) -> Result<Quota> {
        check_limit(limit)?;
        let quota_id = quota.into();
        let mut quota = tx
            .quota(&quota_id)?
            .ok_or_else(|| LedgerError::not_found("quota", quota_id))?;

        let previous = quota.limit;
        quota.limit = limit;
        quota.updated_at = Utc::now();
        tx.put_quota(&quota)?;

        tracing::info!(quota_id = %quota.id, previous = ?previous, limit = ?limit, "Quota limit changed");
        Ok(quota)
    }

    /// Resolve the quota governing `resource` for a user.
    ///
    /// Walks the category's quota field sets, most specific first; the first
    /// stored quota matching the projected auth data wins. `None` means no
    /// quota applies and the resource is unlimited.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the resource does not exist.
    pub fn resolve_quota<T: KvTransaction>(
        &self,
        tx: &T,
        resource: impl Into<ResourceId>,
        auth_data: &AuthData,
    ) -> Result<Option<Quota>> {
        let resource = load_resource(tx, &resource.into())?;
        let category = load_category(tx, &resource.category_id)?;
        let quota = resolve(tx, &resource, &category, auth_data)?;

        tracing::debug!(
            resource = %resource.name,
            quota_id = ?quota.as_ref().map(|q| q.id),
            "Quota resolved"
        );
        Ok(quota)
    }

    /// Check an amount of an absolute resource against its limit.
    ///
    /// # Errors
    ///
    /// Returns `OverQuota` if `amount` exceeds the resolved limit,
    /// `InvalidArguments` if the resource is not absolute, and `NotFound` if
    /// it does not exist.
    pub fn check_absolute<T: KvTransaction>(
        &self,
        tx: &T,
        resource: impl Into<ResourceId>,
        auth_data: &AuthData,
        amount: i64,
    ) -> Result<()> {
        let resource = load_resource(tx, &resource.into())?;
        if !resource.absolute {
            return Err(LedgerError::invalid(format!(
                "resource {} tracks usage; reserve it instead",
                resource.name
            )));
        }
        let category = load_category(tx, &resource.category_id)?;
        match absolute_overage(tx, &resource, &category, auth_data, amount, &resource.name)? {
            Some(overage) => {
                tracing::warn!(%overage, "Absolute limit exceeded");
                Err(LedgerError::OverQuota {
                    overages: vec![overage],
                })
            }
            None => Ok(()),
        }
    }
}

/// Compare an absolute amount with the resolved limit.
pub(super) fn absolute_overage<T: KvTransaction>(
    tx: &T,
    resource: &Resource,
    category: &Category,
    auth_data: &AuthData,
    amount: i64,
    name: &str,
) -> Result<Option<Overage>> {
    let Some(quota) = resolve(tx, resource, category, auth_data)? else {
        return Ok(None);
    };
    Ok(match quota.limit {
        Some(limit) if amount > limit => Some(Overage {
            resource_id: resource.id,
            resource: name.to_string(),
            limit,
            consumed: 0,
            requested: amount,
        }),
        _ => None,
    })
}
