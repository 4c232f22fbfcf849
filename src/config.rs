//! Configuration for runvault.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (RUNVAULT_HOME, RUNVAULT_DB; RUNVAULT_TENANT and
//!    RUNVAULT_ACTOR are read by the CLI)
//! 2. Config file (.runvault/config.yaml)
//! 3. Defaults (~/.runvault, ~/.runvault/checkpoints.db)
//!
//! Config file discovery:
//! - Searches current directory and parents for .runvault/config.yaml
//! - Paths in the config file are relative to the .runvault/ directory

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::pipeline::RetryPolicy;
use crate::core::sqlite_store::StoreOptions;

pub const ENV_HOME: &str = "RUNVAULT_HOME";
pub const ENV_DB: &str = "RUNVAULT_DB";
pub const ENV_TENANT: &str = "RUNVAULT_TENANT";
pub const ENV_ACTOR: &str = "RUNVAULT_ACTOR";

const CONFIG_DIR: &str = ".runvault";
const DATABASE_FILE: &str = "checkpoints.db";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .runvault/)
    pub home: Option<String>,
    /// SQLite database file (relative to .runvault/)
    pub database: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetentionConfig {
    pub checkpoint_days: Option<i64>,
    pub audit_days: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    pub busy_timeout_ms: Option<u64>,
    pub save_retry: Option<RetryPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityConfig {
    pub tenant: Option<String>,
    pub actor: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// SQLite database file
    pub database: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Retention settings
    pub retention: RetentionSettings,
    /// Store settings
    pub store: StoreSettings,
    /// Default tenant when none is given on the command line
    pub tenant: Option<String>,
    /// Default actor when none is given on the command line
    pub actor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionSettings {
    pub checkpoint_days: i64,
    pub audit_days: i64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            checkpoint_days: 30,
            audit_days: 365,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreSettings {
    pub busy_timeout_ms: u64,
    pub save_retry: RetryPolicy,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            save_retry: RetryPolicy::default(),
        }
    }
}

impl ResolvedConfig {
    /// Options for opening the checkpoint database
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            retention: chrono::Duration::days(self.retention.checkpoint_days),
            busy_timeout: std::time::Duration::from_millis(self.store.busy_timeout_ms),
        }
    }

    /// How long audit entries are kept
    pub fn audit_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention.audit_days)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(CONFIG_DIR).join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Merge env, file and defaults
fn resolve(
    file: Option<(PathBuf, ConfigFile)>,
    env: impl Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let (config_file, config) = match file {
        Some((path, config)) => (Some(path), config),
        None => (None, ConfigFile::default()),
    };
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);

    let home = if let Some(env_home) = env(ENV_HOME) {
        PathBuf::from(env_home)
    } else if let (Some(dir), Some(home_path)) = (&config_dir, &config.paths.home) {
        resolve_path(dir, home_path)
    } else {
        default_home
    };

    let database = if let Some(env_db) = env(ENV_DB) {
        PathBuf::from(env_db)
    } else if let (Some(dir), Some(db_path)) = (&config_dir, &config.paths.database) {
        resolve_path(dir, db_path)
    } else {
        home.join(DATABASE_FILE)
    };

    let defaults = RetentionSettings::default();
    let retention = RetentionSettings {
        checkpoint_days: config
            .retention
            .checkpoint_days
            .unwrap_or(defaults.checkpoint_days),
        audit_days: config.retention.audit_days.unwrap_or(defaults.audit_days),
    };
    if retention.checkpoint_days <= 0 || retention.audit_days <= 0 {
        anyhow::bail!(
            "Retention periods must be positive (checkpoint_days={}, audit_days={})",
            retention.checkpoint_days,
            retention.audit_days
        );
    }

    let defaults = StoreSettings::default();
    let store = StoreSettings {
        busy_timeout_ms: config
            .store
            .busy_timeout_ms
            .unwrap_or(defaults.busy_timeout_ms),
        save_retry: config.store.save_retry.unwrap_or(defaults.save_retry),
    };
    if store.save_retry.max_attempts == 0 {
        anyhow::bail!("store.save_retry.max_attempts must be at least 1");
    }

    Ok(ResolvedConfig {
        home,
        database,
        config_file,
        retention,
        store,
        tenant: config.identity.tenant,
        actor: config.identity.actor,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(CONFIG_DIR);

    let file = match find_config_file() {
        Some(path) => {
            let config = load_config_file(&path)?;
            Some((path, config))
        }
        None => None,
    };

    resolve(file, |key| std::env::var(key).ok(), default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the database path
pub fn database_path() -> Result<PathBuf> {
    Ok(config()?.database.clone())
}
