//! Services, categories and resources.

use chrono::Utc;
use quota_ledger_core::{
    Category, CategoryId, CategoryKey, CategoryQuery, FieldSet, LedgerError, Resource, ResourceId,
    ResourceKey, ResourceQuery, Result, Service, ServiceId, ServiceKey, ServiceQuery,
};
use quota_ledger_store::{KvTransaction, Tables};

use super::{load_category, load_resource, load_service, Ledger};

impl Ledger {
    // =========================================================================
    // Services
    // =========================================================================

    /// Register a service.
    ///
    /// # Errors
    ///
    /// Returns `Duplicate` if a service with this name exists, or
    /// `InvalidArguments` if the name is empty.
    pub fn create_service<T: KvTransaction>(
        &self,
        tx: &mut T,
        name: &str,
        auth_fields: FieldSet,
    ) -> Result<Service> {
        if name.is_empty() {
            return Err(LedgerError::invalid("service name must not be empty"));
        }

        let now = Utc::now();
        let service = Service {
            id: ServiceId::generate(),
            name: name.to_string(),
            auth_fields,
            created_at: now,
            updated_at: now,
        };
        tx.insert_service(&service)?;

        tracing::info!(service_id = %service.id, name = %service.name, "Service created");
        Ok(service)
    }

    /// Look up a service by id or name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` unless exactly one of id and name is given,
    /// and `NotFound` if no service matches.
    pub fn get_service<T: KvTransaction>(&self, tx: &T, query: &ServiceQuery) -> Result<Service> {
        match query.key()? {
            ServiceKey::Id(id) => load_service(tx, &id),
            ServiceKey::Name(name) => tx
                .service_by_name(&name)?
                .ok_or_else(|| LedgerError::not_found("service", name)),
        }
    }

    /// List every service in name order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn get_services<T: KvTransaction>(&self, tx: &T) -> Result<Vec<Service>> {
        Ok(tx.services()?)
    }

    // =========================================================================
    // Categories
    // =========================================================================

    /// Create a category of a service.
    ///
    /// Field sets are restricted to the service's auth fields, and the empty
    /// set is appended to `quota_fsets` so that the default quota always
    /// takes part in resolution. The order of `quota_fsets` is kept as given:
    /// most specific first.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the service does not exist and `Duplicate` if
    /// the service already has a category of this name.
    pub fn create_category<T: KvTransaction>(
        &self,
        tx: &mut T,
        service: impl Into<ServiceId>,
        name: &str,
        usage_fset: &FieldSet,
        quota_fsets: &[FieldSet],
    ) -> Result<Category> {
        let service = load_service(tx, &service.into())?;
        let restrict = |fset: &FieldSet| -> FieldSet {
            fset.intersection(&service.auth_fields).cloned().collect()
        };

        let mut quota_fsets: Vec<FieldSet> = quota_fsets.iter().map(restrict).collect();
        if quota_fsets.last().map_or(true, |last| !last.is_empty()) {
            quota_fsets.push(FieldSet::new());
        }

        let now = Utc::now();
        let category = Category {
            id: CategoryId::generate(),
            service_id: service.id,
            name: name.to_string(),
            usage_fset: restrict(usage_fset),
            quota_fsets,
            created_at: now,
            updated_at: now,
        };
        tx.insert_category(&category)?;

        tracing::info!(
            category_id = %category.id,
            service = %service.name,
            name = %category.name,
            "Category created"
        );
        Ok(category)
    }

    /// Look up a category by id or by service and name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` for an incomplete or ambiguous query, and
    /// `NotFound` if no category matches.
    pub fn get_category<T: KvTransaction>(
        &self,
        tx: &T,
        query: &CategoryQuery,
    ) -> Result<Category> {
        match query.key()? {
            CategoryKey::Id(id) => load_category(tx, &id),
            CategoryKey::Name { service, name } => tx
                .category_by_name(&service, &name)?
                .ok_or_else(|| LedgerError::not_found("category", format!("{service}/{name}"))),
        }
    }

    /// List the categories of a service, or of every service.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn get_categories<T: KvTransaction>(
        &self,
        tx: &T,
        service: Option<ServiceId>,
    ) -> Result<Vec<Category>> {
        Ok(tx.categories(service.as_ref())?)
    }

    // =========================================================================
    // Resources
    // =========================================================================

    /// Create a resource in a category of a service.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the service or category does not exist,
    /// `InvalidArguments` if the category belongs to another service, and
    /// `Duplicate` if the category already has a resource of this name.
    pub fn create_resource<T: KvTransaction>(
        &self,
        tx: &mut T,
        service: impl Into<ServiceId>,
        category: impl Into<CategoryId>,
        name: &str,
        parameters: FieldSet,
        absolute: bool,
    ) -> Result<Resource> {
        let service = load_service(tx, &service.into())?;
        let category = load_category(tx, &category.into())?;
        if category.service_id != service.id {
            return Err(LedgerError::invalid(format!(
                "category {} does not belong to service {}",
                category.name, service.name
            )));
        }

        let now = Utc::now();
        let resource = Resource {
            id: ResourceId::generate(),
            service_id: service.id,
            category_id: category.id,
            name: name.to_string(),
            parameters,
            absolute,
            created_at: now,
            updated_at: now,
        };
        tx.insert_resource(&resource)?;

        tracing::info!(
            resource_id = %resource.id,
            service = %service.name,
            category = %category.name,
            name = %resource.name,
            absolute,
            "Resource created"
        );
        Ok(resource)
    }

    /// Look up a resource by id or by service, category and name.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` for an incomplete or ambiguous query, and
    /// `NotFound` if no resource matches.
    pub fn get_resource<T: KvTransaction>(
        &self,
        tx: &T,
        query: &ResourceQuery,
    ) -> Result<Resource> {
        match query.key()? {
            ResourceKey::Id(id) => load_resource(tx, &id),
            ResourceKey::Name {
                service,
                category,
                name,
            } => tx
                .resource_by_name(&service, &category, &name)?
                .ok_or_else(|| {
                    LedgerError::not_found("resource", format!("{service}/{category}/{name}"))
                }),
        }
    }

    /// List resources, optionally restricted to a service and category.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn get_resources<T: KvTransaction>(
        &self,
        tx: &T,
        service: Option<ServiceId>,
        category: Option<CategoryId>,
    ) -> Result<Vec<Resource>> {
        Ok(tx.resources(service.as_ref(), category.as_ref())?)
    }
}
