//! The accounts database and the configuration that locates it.

pub mod config;
pub mod db;
pub mod paths;
pub mod schema;

pub use config::{
    BusKind, Config, ConfigSource, ConfigSources, ENV_ABORT_ON_DB_TIMEOUT, ENV_BUS_DIR, ENV_CONFIG,
    ENV_DB_DIR, ENV_DB_TIMEOUT, Overrides, ResolvedConfig,
};
pub use db::{
    DB_FILE_NAME, DEFAULT_DB_TIMEOUT, ExclusiveTransaction, RetryPolicy, Store, StoreOptions,
};
pub use paths::AppPaths;
pub use schema::run_migrations;
