//! Configuration file loading and resolution.
//!
//! Loads configuration from `<config dir>/config.toml` (see [`AppPaths`]).
//!
//! ## Precedence
//!
//! Settings are resolved with the following precedence (highest first):
//! 1. Explicit [`Overrides`] from the embedding application
//! 2. Environment variables
//! 3. Config file
//! 4. Built-in defaults
//!
//! ## Environment Variables
//!
//! - `ACCOUNTS`: Directory holding the accounts database
//! - `ACCOUNTS_DB_TIMEOUT`: Read timeout on a locked database, in milliseconds
//! - `ACCOUNTS_ABORT_ON_DB_TIMEOUT`: Abort the process on that timeout (1, true, yes)
//! - `ACCOUNTS_BUS_DIR`: Spool directory of the change bus
//! - `ACCOUNTS_CONFIG`: Override config file path

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::error::{AccountsError, Result};
use crate::storage::db::{DEFAULT_DB_TIMEOUT, RetryPolicy, StoreOptions};
use crate::util::env::{env_millis, env_non_empty, is_env_truthy};

// =============================================================================
// Environment Variable Names
// =============================================================================

/// Environment variable for the database directory.
pub const ENV_DB_DIR: &str = "ACCOUNTS";
/// Environment variable for the database timeout in milliseconds.
pub const ENV_DB_TIMEOUT: &str = "ACCOUNTS_DB_TIMEOUT";
/// Environment variable enabling abort on database timeout.
pub const ENV_ABORT_ON_DB_TIMEOUT: &str = "ACCOUNTS_ABORT_ON_DB_TIMEOUT";
/// Environment variable for the bus spool directory.
pub const ENV_BUS_DIR: &str = "ACCOUNTS_BUS_DIR";
/// Environment variable to override config file path.
pub const ENV_CONFIG: &str = "ACCOUNTS_CONFIG";

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Settings supplied directly by the application; they beat everything else.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub db_dir: Option<PathBuf>,
    pub db_timeout: Option<Duration>,
    pub abort_on_timeout: Option<bool>,
    pub bus_dir: Option<PathBuf>,
}

/// Fully resolved configuration after merging overrides, env vars, and the
/// config file.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Directory holding `accounts.db`.
    pub db_dir: PathBuf,
    /// How long reads wait on a locked database.
    pub db_timeout: Duration,
    /// Abort the process instead of failing on that timeout.
    pub abort_on_timeout: bool,
    /// Backoff schedule of blocking commits.
    pub commit_retry: RetryPolicy,
    pub bus_kind: BusKind,
    /// Spool directory of the change bus.
    pub bus_dir: PathBuf,
    /// How long accounts announced by other processes are kept alive.
    pub foreign_pin: Duration,
    /// Period of the scheduler tick in [`crate::Manager::run`].
    pub tick: Duration,
    /// Source of each setting for debugging.
    pub sources: ConfigSources,
}

/// Tracks the source of each overridable configuration value.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub db_dir: ConfigSource,
    pub db_timeout: ConfigSource,
    pub abort_on_timeout: ConfigSource,
    pub bus_dir: ConfigSource,
}

/// Where a configuration value came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Value passed by the application.
    Explicit,
    /// Value from environment variable.
    Env,
    /// Value from config file.
    ConfigFile,
    /// Built-in default.
    #[default]
    Default,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicit option"),
            Self::Env => write!(f, "environment variable"),
            Self::ConfigFile => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

impl ResolvedConfig {
    /// Resolve final configuration from overrides, environment variables,
    /// and the config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but is invalid.
    pub fn resolve(overrides: &Overrides) -> Result<Self> {
        let config = Self::load_config()?;
        Self::resolve_with(overrides, &config, &AppPaths::new())
    }

    /// Resolve against an already loaded config file and explicit paths.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` fails validation.
    pub fn resolve_with(overrides: &Overrides, config: &Config, paths: &AppPaths) -> Result<Self> {
        config.validate()?;
        let mut sources = ConfigSources::default();

        let db_dir = resolve_value(
            overrides.db_dir.clone(),
            env_non_empty(ENV_DB_DIR).map(PathBuf::from),
            config.database.dir.clone(),
            paths.db_dir(),
            &mut sources.db_dir,
        );
        let db_timeout = resolve_value(
            overrides.db_timeout,
            env_millis(ENV_DB_TIMEOUT),
            Some(Duration::from_millis(config.database.timeout_ms)),
            DEFAULT_DB_TIMEOUT,
            &mut sources.db_timeout,
        );
        let abort_on_timeout = resolve_value(
            overrides.abort_on_timeout,
            is_env_truthy(ENV_ABORT_ON_DB_TIMEOUT).then_some(true),
            config.database.abort_on_timeout.then_some(true),
            false,
            &mut sources.abort_on_timeout,
        );
        let bus_dir = resolve_value(
            overrides.bus_dir.clone(),
            env_non_empty(ENV_BUS_DIR).map(PathBuf::from),
            config.bus.dir.clone(),
            paths.bus_dir(),
            &mut sources.bus_dir,
        );

        if db_timeout.is_zero() {
            return Err(AccountsError::ConfigInvalid {
                key: "database.timeout_ms".to_string(),
                value: "0".to_string(),
                message: "database timeout must be positive".to_string(),
            });
        }

        let resolved = Self {
            db_dir,
            db_timeout,
            abort_on_timeout,
            commit_retry: config.commit.policy(),
            bus_kind: config.bus.kind,
            bus_dir,
            foreign_pin: Duration::from_millis(config.notifications.foreign_pin_ms),
            tick: Duration::from_millis(config.notifications.tick_ms),
            sources,
        };
        tracing::debug!(
            db_dir = %resolved.db_dir.display(),
            db_dir_source = %resolved.sources.db_dir,
            db_timeout_ms = u64::try_from(resolved.db_timeout.as_millis()).unwrap_or(u64::MAX),
            bus = ?resolved.bus_kind,
            "Resolved configuration"
        );
        Ok(resolved)
    }

    /// Load config file, respecting the `ACCOUNTS_CONFIG` override.
    fn load_config() -> Result<Config> {
        match env_non_empty(ENV_CONFIG) {
            Some(path) => Config::load_from(Path::new(&path)),
            None => Config::load(),
        }
    }

    /// Options for opening the database.
    #[must_use]
    pub const fn store_options(&self) -> StoreOptions {
        StoreOptions {
            db_timeout: self.db_timeout,
            abort_on_timeout: self.abort_on_timeout,
            commit_retry: self.commit_retry,
        }
    }
}

fn resolve_value<T>(
    explicit: Option<T>,
    env: Option<T>,
    file: Option<T>,
    default: T,
    source: &mut ConfigSource,
) -> T {
    if let Some(value) = explicit {
        *source = ConfigSource::Explicit;
        return value;
    }
    if let Some(value) = env {
        *source = ConfigSource::Env;
        return value;
    }
    if let Some(value) = file {
        *source = ConfigSource::ConfigFile;
        return value;
    }
    *source = ConfigSource::Default;
    default
}

// =============================================================================
// Config file
// =============================================================================

/// Configuration file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub commit: CommitConfig,
    pub bus: BusConfig,
    pub notifications: NotificationsConfig,
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Directory holding the database; platform data dir when unset.
    pub dir: Option<PathBuf>,
    /// Read timeout on a locked database, in milliseconds.
    pub timeout_ms: u64,
    /// Abort the process when that timeout elapses.
    pub abort_on_timeout: bool,
}

/// `[commit]` section: backoff of blocking commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub give_up_after_ms: u64,
}

/// Which bus implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// Shared spool directory, reaching other processes.
    #[default]
    Spool,
    /// In-process only.
    Local,
}

/// `[bus]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub dir: Option<PathBuf>,
    pub kind: BusKind,
}

/// `[notifications]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Lifetime of accounts announced by other processes, in milliseconds.
    pub foreign_pin_ms: u64,
    /// Scheduler tick, in milliseconds.
    pub tick_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dir: None,
            timeout_ms: 5000,
            abort_on_timeout: false,
        }
    }
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
            give_up_after_ms: 30_000,
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            foreign_pin_ms: 2000,
            tick_ms: 10,
        }
    }
}

impl CommitConfig {
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            give_up_after: Duration::from_millis(self.give_up_after_ms),
        }
    }
}

impl Config {
    /// Load configuration from the default config file path.
    ///
    /// Returns default config if the file doesn't exist.
    ///
    /// # Errors
    /// Returns an error only if the file exists but is invalid.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().config_file())
    }

    /// Load configuration from a specific path.
    ///
    /// Returns default config if the file doesn't exist.
    ///
    /// # Errors
    /// Returns an error only if the file exists but is invalid.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(?path, "Config file not found, using defaults");
            return Ok(Self::default());
        }

        tracing::debug!(?path, "Loading config file");
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| AccountsError::Config(format!("Invalid config file: {e}")))
    }

    /// Save configuration to a specific path.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| AccountsError::Config(format!("Failed to serialize config: {e}")))?;

        fs::write(path, content)?;
        tracing::debug!(?path, "Config file saved");
        Ok(())
    }

    /// Validate configuration values.
    ///
    /// Checks that:
    /// - Timeouts and pin durations are positive
    /// - The commit backoff starts below its cap
    ///
    /// # Errors
    /// Returns `ConfigInvalid` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("database.timeout_ms", self.database.timeout_ms),
            ("commit.initial_backoff_ms", self.commit.initial_backoff_ms),
            ("commit.give_up_after_ms", self.commit.give_up_after_ms),
            ("notifications.foreign_pin_ms", self.notifications.foreign_pin_ms),
            ("notifications.tick_ms", self.notifications.tick_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(AccountsError::ConfigInvalid {
                    key: key.to_string(),
                    value: value.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        if self.commit.initial_backoff_ms > self.commit.max_backoff_ms {
            return Err(AccountsError::ConfigInvalid {
                key: "commit.max_backoff_ms".to_string(),
                value: self.commit.max_backoff_ms.to_string(),
                message: format!(
                    "must not be below commit.initial_backoff_ms ({})",
                    self.commit.initial_backoff_ms
                ),
            });
        }

        Ok(())
    }
}
