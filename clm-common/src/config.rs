//! Configuration loading and database path resolution

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Environment variable consulted for the database path
pub const DB_PATH_ENV: &str = "CLM_DB_PATH";

/// How Phase 3 treats duplicate non-empty emails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EmailConflictPolicy {
    /// Duplicate emails abort the phase before any DDL runs
    #[default]
    Abort,
    /// Keep the email on the lowest-id user of each group, null it elsewhere
    NullDuplicates,
}

/// `[migration]` section of the TOML config
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Rows read per batch by the Phase 2 data migrator
    pub batch_size: i64,
    /// Season start year stamped on memberships created by repair
    pub season_start_year: i64,
    /// Where snapshots are written before destructive phases
    pub snapshot_dir: Option<PathBuf>,
    pub email_policy: EmailConflictPolicy,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            season_start_year: 2024,
            snapshot_dir: None,
            email_policy: EmailConflictPolicy::Abort,
        }
    }
}

/// Full TOML config file
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub database_path: Option<PathBuf>,
    pub migration: MigrationSettings,
    /// Optional TOML file with team→league rule tables
    pub rules_file: Option<PathBuf>,
}

impl TomlConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load config from an explicit path, or the platform default location.
    ///
    /// A missing or unreadable default file yields defaults with a warning;
    /// an explicit path that cannot be read is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let content = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
            return Self::from_toml_str(&content);
        }

        match default_config_file() {
            Some(path) => match std::fs::read_to_string(&path) {
                Ok(content) => Self::from_toml_str(&content),
                Err(e) => {
                    warn!("Config file {} unreadable ({}), using defaults", path.display(), e);
                    Ok(Self::default())
                }
            },
            None => Ok(Self::default()),
        }
    }
}

/// Database path resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_database_path(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    config: &TomlConfig,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.database_path {
        return path.clone();
    }

    get_default_database_path()
}

/// Existing config file for the platform, if any
fn default_config_file() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("clm").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/clm/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// OS-dependent default database location
fn get_default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("clm").join("clm.db"))
        .unwrap_or_else(|| PathBuf::from("./clm_data/clm.db"))
}
