//! Common test utilities for quota ledger integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;

use quota_ledger_core::{
    field_set, AuthData, Category, FieldSet, LedgerError, ParamData, Quota, Reservation, Resource,
    Service, Usage, UsageId, UsageQuery,
};
use quota_ledger_service::{Ledger, LedgerConfig};
use quota_ledger_store::{MemoryStore, Store};

/// Test harness with a registered `compute` service.
///
/// The `instances` category counts usage per project and resolves quotas
/// from `{user_id, project_id}` through `{project_id}` down to the default.
pub struct TestHarness {
    /// The store every operation runs against.
    pub store: Arc<MemoryStore>,
    /// The engine.
    pub ledger: Ledger,
    /// The `compute` service, auth fields `user_id` and `project_id`.
    pub service: Service,
    /// The `instances` category.
    pub category: Category,
    /// Tracked resource without parameters.
    pub instances: Resource,
    /// Tracked resource parameterized by `flavor`.
    pub cores: Resource,
    /// Absolute resource.
    pub ram_size: Resource,
}

impl TestHarness {
    /// Create a new test harness with a fresh store.
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    /// Create a harness with a custom configuration.
    pub fn with_config(config: LedgerConfig) -> Self {
        let store = Arc::new(MemoryStore::with_lock_timeout(config.lock_timeout()));
        let ledger = Ledger::new(config);

        let (service, category, instances, cores, ram_size) = store
            .transaction(|tx| {
                let service =
                    ledger.create_service(tx, "compute", field_set(["user_id", "project_id"]))?;
                let category = ledger.create_category(
                    tx,
                    &service,
                    "instances",
                    &field_set(["project_id"]),
                    &[field_set(["user_id", "project_id"]), field_set(["project_id"])],
                )?;
                let instances = ledger.create_resource(
                    tx,
                    &service,
                    &category,
                    "instances",
                    FieldSet::new(),
                    false,
                )?;
                let cores = ledger.create_resource(
                    tx,
                    &service,
                    &category,
                    "cores",
                    field_set(["flavor"]),
                    false,
                )?;
                let ram_size = ledger.create_resource(
                    tx,
                    &service,
                    &category,
                    "ram_size",
                    FieldSet::new(),
                    true,
                )?;
                Ok::<_, LedgerError>((service, category, instances, cores, ram_size))
            })
            .expect("Failed to set up registry");

        Self {
            store,
            ledger,
            service,
            category,
            instances,
            cores,
            ram_size,
        }
    }

    /// Auth data of a user in a project.
    pub fn user(user_id: &str, project_id: &str) -> AuthData {
        AuthData::new()
            .with("user_id", user_id)
            .with("project_id", project_id)
    }

    /// Create a quota and commit it.
    pub fn quota(&self, resource: &Resource, auth_data: &AuthData, limit: Option<i64>) -> Quota {
        self.store
            .transaction(|tx| self.ledger.create_quota(tx, resource, auth_data, limit))
            .expect("Failed to create quota")
    }

    /// Get or create the usage row of a user and commit it.
    pub fn usage(&self, resource: &Resource, auth_data: &AuthData) -> Usage {
        self.usage_with(resource, &ParamData::new(), auth_data)
    }

    /// Get or create a parameterized usage row and commit it.
    pub fn usage_with(
        &self,
        resource: &Resource,
        param_data: &ParamData,
        auth_data: &AuthData,
    ) -> Usage {
        self.store
            .transaction(|tx| self.ledger.usage_for(tx, resource, param_data, auth_data))
            .expect("Failed to create usage")
    }

    /// Read a usage row back.
    pub fn usage_row(&self, id: UsageId) -> Usage {
        let tx = self.store.begin().expect("Failed to begin");
        self.ledger
            .get_usage(&tx, &UsageQuery::by_id(id))
            .expect("Usage not found")
    }

    /// Open a reservation with the default expiry and commit it.
    pub fn reservation(&self) -> Reservation {
        self.store
            .transaction(|tx| {
                self.ledger
                    .create_reservation(tx, self.ledger.default_expiry())
            })
            .expect("Failed to create reservation")
    }

    /// Reserve against a usage row in its own transaction.
    pub fn reserve(
        &self,
        reservation: &Reservation,
        usage: &Usage,
        auth_data: &AuthData,
        delta: i64,
    ) -> Result<(), LedgerError> {
        let resource = usage.resource_id;
        self.store.transaction(|tx| {
            self.ledger
                .reserve(tx, reservation, resource, Some(usage.id), auth_data, delta)
                .map(|_| ())
        })
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
