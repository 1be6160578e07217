//! Accounts, their settings and the machinery keeping processes in sync.

pub mod account;
pub mod cache;
pub mod catalog;
pub mod changes;
pub mod events;
pub mod logging;
pub mod manager;
pub mod notifier;
pub mod value;
pub mod watch;

pub use account::{
    Account, AccountId, AccountListener, SettingSource, SettingsIter, StoreCallback, WatchCallback,
};
pub use cache::{AccountCache, DEFAULT_FOREIGN_PIN};
pub use catalog::{
    Catalog, GLOBAL_SCOPE, GLOBAL_SERVICE_TYPE, MemoryCatalog, ProviderDescriptor,
    ServiceDescriptor, ServiceTypeDescriptor,
};
pub use changes::{ChangeSet, ServiceChanges, StoreBatch};
pub use events::{AccountEvent, ListenerId, ManagerEvent};
pub use manager::{DEFAULT_TICK, Manager, ManagerListener, ManagerOptions};
pub use notifier::{ChangeNotifier, Disposition};
pub use value::{Value, ValueType};
pub use watch::{WatchId, WatchTarget};
