//! accounts-core - shared multi-process account settings store
//!
//! Accounts and their per-service settings live in one SQLite database
//! shared by every process of a user session. Commits take an exclusive
//! lock, and every successful commit is broadcast so that other processes
//! update the accounts they hold in memory.

// Note: deny (not forbid) to allow #[allow(unsafe_code)] in test helpers for env var manipulation
#![deny(unsafe_code)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod bus;
pub mod core;
pub mod error;
pub mod storage;
pub mod util;

/// Test utilities module - included in test builds or when test-utils feature is enabled.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use crate::core::{
    Account, AccountEvent, AccountId, Catalog, ChangeSet, Manager, ManagerEvent, ManagerOptions,
    MemoryCatalog, ServiceDescriptor, SettingSource, Value, ValueType,
};
pub use error::{AccountsError, ErrorCategory, Result};
