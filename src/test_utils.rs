//! Test utilities for accounts-core.
//!
//! Provides a sample catalog and a throwaway environment in which several
//! managers share one database file and one in-process bus, the way separate
//! processes share them in production.
//!
//! # Usage
//!
//! ```rust,ignore
//! use accounts_core::test_utils::TestEnv;
//!
//! let env = TestEnv::new();
//! let writer = env.manager();
//! let reader = env.manager();
//! let account = writer.create_account(Some("example"));
//! account.store_blocking().unwrap();
//! env.pump(&[&reader]);
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::bus::LocalBus;
use crate::core::catalog::{MemoryCatalog, ProviderDescriptor, ServiceDescriptor};
use crate::core::manager::{Manager, ManagerOptions};
use crate::core::value::Value;
use crate::storage::db::{RetryPolicy, Store, StoreOptions};

// =============================================================================
// Test Data Factories
// =============================================================================

/// Catalog with one provider, `example`, offering a chat and a mail service.
///
/// `example-chat` carries the defaults `parameters/port = 5223` and
/// `parameters/host = "x"`.
#[must_use]
pub fn sample_catalog() -> MemoryCatalog {
    MemoryCatalog::new()
        .with_provider(ProviderDescriptor::new("example").with_display_name("Example"))
        .with_service(
            ServiceDescriptor::new("example-chat", "IM")
                .with_display_name("Example Chat")
                .with_provider("example")
                .with_default("parameters/port", Value::UInt32(5223))
                .with_default("parameters/host", "x"),
        )
        .with_service(
            ServiceDescriptor::new("example-mail", "e-mail")
                .with_display_name("Example Mail")
                .with_provider("example"),
        )
        .with_service_type("e-mail", "Email")
        .with_service_type("IM", "Instant messaging")
}

// =============================================================================
// Test Environment
// =============================================================================

/// A temporary database directory plus a shared in-process bus.
#[derive(Debug)]
pub struct TestEnv {
    dir: TempDir,
    bus: Arc<LocalBus>,
    catalog: Arc<MemoryCatalog>,
}

impl TestEnv {
    /// # Panics
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("create temp dir"),
            bus: Arc::new(LocalBus::new()),
            catalog: Arc::new(sample_catalog()),
        }
    }

    /// Directory holding the database.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    #[must_use]
    pub fn bus(&self) -> Arc<LocalBus> {
        Arc::clone(&self.bus)
    }

    /// A fresh store connection to the shared database.
    ///
    /// # Panics
    /// Panics if the database cannot be opened.
    #[must_use]
    pub fn store(&self, options: StoreOptions) -> Store {
        Store::open_in_dir(self.dir.path(), options).expect("open store")
    }

    /// A manager standing in for one more process.
    #[must_use]
    pub fn manager(&self) -> Manager {
        self.manager_with(ManagerOptions::default())
    }

    /// A manager restricted to `service_type`.
    #[must_use]
    pub fn manager_for_type(&self, service_type: &str) -> Manager {
        self.manager_with(ManagerOptions::default().with_service_type(service_type))
    }

    /// A manager whose blocking commits give up on the lock after `budget`.
    #[must_use]
    pub fn manager_with_lock_budget(&self, budget: Duration) -> Manager {
        let retry = RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            give_up_after: budget,
        };
        self.build(
            StoreOptions::default()
                .with_db_timeout(budget)
                .with_commit_retry(retry),
            ManagerOptions::default(),
        )
    }

    /// # Panics
    /// Panics if the database cannot be opened or the bus refuses the
    /// subscription.
    #[must_use]
    pub fn manager_with(&self, options: ManagerOptions) -> Manager {
        self.build(StoreOptions::default(), options)
    }

    fn build(&self, store_options: StoreOptions, options: ManagerOptions) -> Manager {
        let bus: Arc<dyn crate::bus::Bus> = self.bus.clone();
        Manager::new(self.store(store_options), self.catalog.clone(), bus, options)
            .expect("create manager")
    }

    /// Let every manager handle what the bus delivered so far.
    pub fn pump(&self, managers: &[&Manager]) {
        for manager in managers {
            manager.process_pending();
        }
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
