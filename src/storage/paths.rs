//! Default locations for the database, the bus spool and the config file.

use directories::ProjectDirs;
use std::path::PathBuf;

use crate::storage::db::DB_FILE_NAME;

/// Application paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Configuration directory.
    pub config: PathBuf,
    /// Cache directory.
    pub cache: PathBuf,
    /// Data directory, home of the accounts database.
    pub data: PathBuf,
    /// Per-session runtime directory, where the platform has one.
    pub runtime: Option<PathBuf>,
}

impl AppPaths {
    #[must_use]
    pub fn new() -> Self {
        if let Some(proj_dirs) = ProjectDirs::from("org", "accounts", "accounts-core") {
            Self {
                config: proj_dirs.config_dir().to_path_buf(),
                cache: proj_dirs.cache_dir().to_path_buf(),
                data: proj_dirs.data_dir().to_path_buf(),
                runtime: proj_dirs.runtime_dir().map(std::path::Path::to_path_buf),
            }
        } else {
            // Fallback to home directory
            let home = directories::BaseDirs::new()
                .map_or_else(|| PathBuf::from("."), |d| d.home_dir().to_path_buf());
            Self {
                config: home.join(".config/accounts"),
                cache: home.join(".cache/accounts"),
                data: home.join(".local/share/accounts"),
                runtime: None,
            }
        }
    }

    /// Directory holding the accounts database.
    #[must_use]
    pub fn db_dir(&self) -> PathBuf {
        self.data.clone()
    }

    #[must_use]
    pub fn db_file(&self) -> PathBuf {
        self.data.join(DB_FILE_NAME)
    }

    /// Spool directory of the cross-process bus.
    #[must_use]
    pub fn bus_dir(&self) -> PathBuf {
        self.runtime.as_ref().unwrap_or(&self.cache).join("bus")
    }

    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.toml")
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}
