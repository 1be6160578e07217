//! Read-only lookup of provider and service descriptions.
//!
//! Descriptions normally come from files installed alongside applications;
//! parsing those is someone else's job. The store only needs names, types,
//! the owning provider and each service's default settings, exposed through
//! the [`Catalog`] trait. [`MemoryCatalog`] is a ready-made implementation
//! for embedding and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::core::value::Value;

/// Name of the pseudo-service holding account-wide settings.
pub const GLOBAL_SCOPE: &str = "global";

/// Service type used for account-wide settings.
pub const GLOBAL_SERVICE_TYPE: &str = "global";

/// An immutable service description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub display_name: String,
    pub service_type: String,
    pub provider: Option<String>,
    pub icon_name: Option<String>,
    /// Values reported with source `Profile` when the account has no override.
    pub default_settings: BTreeMap<String, Value>,
}

impl ServiceDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            service_type: service_type.into(),
            provider: None,
            icon_name: None,
            default_settings: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    #[must_use]
    pub fn with_icon(mut self, icon_name: impl Into<String>) -> Self {
        self.icon_name = Some(icon_name.into());
        self
    }

    #[must_use]
    pub fn with_default(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.default_settings.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn default_setting(&self, key: &str) -> Option<&Value> {
        self.default_settings.get(key)
    }
}

/// An immutable provider description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDescriptor {
    pub name: String,
    pub display_name: String,
    pub icon_name: Option<String>,
}

impl ProviderDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            icon_name: None,
        }
    }

    #[must_use]
    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }
}

/// An immutable service type description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTypeDescriptor {
    pub name: String,
    pub display_name: String,
}

/// Source of provider and service descriptions.
pub trait Catalog {
    /// Look up a service by name.
    fn service(&self, name: &str) -> Option<Arc<ServiceDescriptor>>;

    /// Look up a provider by name.
    fn provider(&self, name: &str) -> Option<Arc<ProviderDescriptor>>;

    /// All known services, optionally restricted to one service type.
    fn list_services(&self, service_type: Option<&str>) -> Vec<Arc<ServiceDescriptor>>;

    /// All known providers.
    fn list_providers(&self) -> Vec<Arc<ProviderDescriptor>>;

    /// Look up a service type by name.
    fn service_type(&self, name: &str) -> Option<Arc<ServiceTypeDescriptor>>;

    /// Default settings of a service.
    fn default_settings(&self, service: &str) -> BTreeMap<String, Value> {
        self.service(service)
            .map(|s| s.default_settings.clone())
            .unwrap_or_default()
    }
}

/// In-memory [`Catalog`].
#[derive(Debug, Default, Clone)]
pub struct MemoryCatalog {
    services: HashMap<String, Arc<ServiceDescriptor>>,
    providers: HashMap<String, Arc<ProviderDescriptor>>,
    service_types: HashMap<String, Arc<ServiceTypeDescriptor>>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_provider(mut self, provider: ProviderDescriptor) -> Self {
        self.providers
            .insert(provider.name.clone(), Arc::new(provider));
        self
    }

    /// Register a service; its type is registered implicitly.
    #[must_use]
    pub fn with_service(mut self, service: ServiceDescriptor) -> Self {
        self.service_types
            .entry(service.service_type.clone())
            .or_insert_with(|| {
                Arc::new(ServiceTypeDescriptor {
                    name: service.service_type.clone(),
                    display_name: service.service_type.clone(),
                })
            });
        self.services.insert(service.name.clone(), Arc::new(service));
        self
    }

    #[must_use]
    pub fn with_service_type(
        mut self,
        name: impl Into<String>,
        display: impl Into<String>,
    ) -> Self {
        let name = name.into();
        self.service_types.insert(
            name.clone(),
            Arc::new(ServiceTypeDescriptor {
                name,
                display_name: display.into(),
            }),
        );
        self
    }
}

impl Catalog for MemoryCatalog {
    fn service(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.get(name).cloned()
    }

    fn provider(&self, name: &str) -> Option<Arc<ProviderDescriptor>> {
        self.providers.get(name).cloned()
    }

    fn list_services(&self, service_type: Option<&str>) -> Vec<Arc<ServiceDescriptor>> {
        let mut services: Vec<_> = self
            .services
            .values()
            .filter(|s| service_type.is_none_or(|t| s.service_type == t))
            .cloned()
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    fn list_providers(&self) -> Vec<Arc<ProviderDescriptor>> {
        let mut providers: Vec<_> = self.providers.values().cloned().collect();
        providers.sort_by(|a, b| a.name.cmp(&b.name));
        providers
    }

    fn service_type(&self, name: &str) -> Option<Arc<ServiceTypeDescriptor>> {
        self.service_types.get(name).cloned()
    }
}
