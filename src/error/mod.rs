//! Error types for accounts-core.
//!
//! Uses `thiserror` for structured error types.
//!
//! ## Error Taxonomy
//!
//! Errors are categorized into six main categories:
//! - **Database**: Statement failures, schema problems, backup failures
//! - **Concurrency**: Lock contention that outlived its retry budget
//! - **Usage**: Operations on deleted or disposed accounts, unknown handles
//! - **Data**: Values that cannot be decoded or coerced, malformed broadcasts
//! - **Configuration**: Config file parsing, validation, or missing values
//! - **Internal**: I/O, serialization, bus transport and unclassified errors
//!
//! Each error has a stable error code (e.g., `ACCT-D001`) for programmatic handling.

use thiserror::Error;

use crate::core::account::AccountId;
use crate::core::events::ListenerId;
use crate::core::watch::WatchId;

// =============================================================================
// Error Categories
// =============================================================================

/// High-level error categories for classification and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Database issues (failed statements, schema, backup).
    Database,
    /// Lock contention with other processes.
    Concurrency,
    /// API misuse (deleted account, stale handles).
    Usage,
    /// Undecodable or inconvertible values and messages.
    Data,
    /// Configuration issues (parse errors, invalid values).
    Configuration,
    /// Internal errors (I/O, bus transport, unclassified).
    Internal,
}

impl ErrorCategory {
    /// Returns a human-readable description of the category.
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Database => "Database error",
            Self::Concurrency => "Concurrency error",
            Self::Usage => "Usage error",
            Self::Data => "Data error",
            Self::Configuration => "Configuration error",
            Self::Internal => "Internal error",
        }
    }

    /// Returns a short code prefix for this category.
    #[must_use]
    pub const fn code_prefix(&self) -> &'static str {
        match self {
            Self::Database => "D",
            Self::Concurrency => "L",
            Self::Usage => "U",
            Self::Data => "V",
            Self::Configuration => "C",
            Self::Internal => "X",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Main error type for accounts-core operations.
///
/// Each variant has:
/// - A stable error code (e.g., `ACCT-D001`)
/// - A category for classification
/// - A retryable flag for retry logic
#[derive(Error, Debug)]
pub enum AccountsError {
    // ==========================================================================
    // Database errors (Category: Database)
    // ==========================================================================
    /// A statement failed; the enclosing transaction was rolled back.
    #[error("database error: {0}")]
    Db(String),

    // ==========================================================================
    // Concurrency errors (Category: Concurrency)
    // ==========================================================================
    /// The database stayed locked by another writer past the retry budget.
    #[error("database is locked (waited {waited_ms} ms)")]
    DbLocked { waited_ms: u64 },

    // ==========================================================================
    // Usage errors (Category: Usage)
    // ==========================================================================
    /// Store attempted on an account whose deletion was already committed.
    #[error("account {name} ({id}) has been deleted")]
    AccountDeleted { id: AccountId, name: String },

    /// The account was dropped while a store was still pending.
    #[error("account has been disposed")]
    Disposed,

    /// No account with this id exists in the database.
    #[error("account {0} not found")]
    NotFound(AccountId),

    /// The watch handle does not belong to this account.
    #[error("unknown watch: {0}")]
    UnknownWatch(WatchId),

    /// The listener handle is not registered.
    #[error("unknown listener: {0}")]
    UnknownListener(ListenerId),

    // ==========================================================================
    // Data errors (Category: Data)
    // ==========================================================================
    /// A setting value cannot be converted to the requested type.
    #[error("cannot convert value of type {from} to {to}")]
    ValueConversion { from: String, to: String },

    /// A stored or transmitted value could not be decoded.
    #[error("invalid value '{text}' for type '{type_sig}': {reason}")]
    InvalidValue {
        type_sig: String,
        text: String,
        reason: String,
    },

    /// A broadcast payload could not be decoded.
    #[error("malformed broadcast message: {0}")]
    MalformedMessage(String),

    // ==========================================================================
    // Configuration errors (Category: Configuration)
    // ==========================================================================
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid value in configuration.
    #[error("invalid config value for '{key}': {message}")]
    ConfigInvalid {
        key: String,
        value: String,
        message: String,
    },

    // ==========================================================================
    // Internal errors (Category: Internal)
    // ==========================================================================
    /// The change bus failed to publish or subscribe.
    #[error("bus error: {0}")]
    Bus(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for other errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for AccountsError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl AccountsError {
    /// Returns the error category for classification and routing.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Db(_) => ErrorCategory::Database,

            Self::DbLocked { .. } => ErrorCategory::Concurrency,

            Self::AccountDeleted { .. }
            | Self::Disposed
            | Self::NotFound(_)
            | Self::UnknownWatch(_)
            | Self::UnknownListener(_) => ErrorCategory::Usage,

            Self::ValueConversion { .. }
            | Self::InvalidValue { .. }
            | Self::MalformedMessage(_) => ErrorCategory::Data,

            Self::Config(_) | Self::ConfigInvalid { .. } => ErrorCategory::Configuration,

            Self::Bus(_) | Self::Io(_) | Self::Json(_) | Self::Other(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Returns a stable error code for programmatic handling.
    ///
    /// Format: `ACCT-{category}{number}`, see [`ErrorCategory::code_prefix`].
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Db(_) => "ACCT-D001",

            Self::DbLocked { .. } => "ACCT-L001",

            Self::AccountDeleted { .. } => "ACCT-U001",
            Self::Disposed => "ACCT-U002",
            Self::NotFound(_) => "ACCT-U003",
            Self::UnknownWatch(_) => "ACCT-U010",
            Self::UnknownListener(_) => "ACCT-U011",

            Self::ValueConversion { .. } => "ACCT-V001",
            Self::InvalidValue { .. } => "ACCT-V002",
            Self::MalformedMessage(_) => "ACCT-V010",

            Self::ConfigInvalid { .. } => "ACCT-C001",
            Self::Config(_) => "ACCT-C002",

            Self::Bus(_) => "ACCT-X010",
            Self::Io(_) => "ACCT-X001",
            Self::Json(_) => "ACCT-X002",
            Self::Other(_) => "ACCT-X099",
        }
    }

    /// Returns whether the operation may succeed if tried again later.
    ///
    /// Only lock contention qualifies; every other failure is deterministic.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DbLocked { .. })
    }

    /// Returns the account id if this error concerns a specific account.
    #[must_use]
    pub const fn account_id(&self) -> Option<AccountId> {
        match self {
            Self::AccountDeleted { id, .. } => Some(*id),
            Self::NotFound(id) => Some(*id),
            _ => None,
        }
    }
}

/// Result type alias for accounts-core operations.
pub type Result<T> = std::result::Result<T, AccountsError>;
