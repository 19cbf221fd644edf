//! Configuration file management for `gridflow`.
//!
//! Provides a TOML config file at `~/.config/gridflow/config.toml` and a
//! resolution chain for each setting: CLI flag > env var > config file >
//! built-in default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use gridflow_bus::config::BusConfig;
use gridflow_core::SchedulerConfig;
use gridflow_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub bus: BusSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BusSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchedulerSection {
    pub heartbeat_timeout_secs: u64,
    pub progress_timeout_secs: u64,
    pub max_deliver: i64,
    pub ack_wait_secs: u64,
    pub default_max_retries: i32,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            heartbeat_timeout_secs: defaults.heartbeat_timeout.as_secs(),
            progress_timeout_secs: defaults.progress_timeout.as_secs(),
            max_deliver: defaults.max_deliver,
            ack_wait_secs: defaults.ack_wait.as_secs(),
            default_max_retries: defaults.default_max_retries,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the gridflow config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/gridflow` or `~/.config/gridflow`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("gridflow");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("gridflow")
}

/// Return the path to the gridflow config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// CLI-flag overrides accepted by every subcommand (global args on [`crate::Cli`]).
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub database_url: Option<String>,
    pub bus_url: Option<String>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct GridflowConfig {
    pub db_config: DbConfig,
    pub bus_config: BusConfig,
    pub scheduler_config: SchedulerConfig,
}

impl GridflowConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default. The `scheduler` section only ever comes from the
    /// config file or the built-in default -- there is no per-flag or
    /// per-env override for it, since operators tune it far less often than
    /// the connection strings.
    pub fn resolve(overrides: &CliOverrides) -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Some(url) = overrides.database_url.as_deref() {
            url.to_string()
        } else if let Ok(url) = std::env::var("GRIDFLOW_DATABASE_URL") {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.database.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let bus_url = if let Some(url) = overrides.bus_url.as_deref() {
            url.to_string()
        } else if let Ok(url) = std::env::var(gridflow_bus::config::BUS_URL_ENV) {
            url
        } else if let Some(ref cfg) = file_config {
            cfg.bus.url.clone()
        } else {
            gridflow_bus::config::DEFAULT_URL.to_string()
        };
        let bus_config = BusConfig {
            url: bus_url,
            ..BusConfig::default()
        };

        let scheduler_config = match &file_config {
            Some(cfg) => SchedulerConfig {
                heartbeat_timeout: Duration::from_secs(cfg.scheduler.heartbeat_timeout_secs),
                progress_timeout: Duration::from_secs(cfg.scheduler.progress_timeout_secs),
                max_deliver: cfg.scheduler.max_deliver,
                ack_wait: Duration::from_secs(cfg.scheduler.ack_wait_secs),
                default_max_retries: cfg.scheduler.default_max_retries,
                ..SchedulerConfig::default()
            },
            None => SchedulerConfig::default(),
        };

        Ok(Self {
            db_config,
            bus_config,
            scheduler_config,
        })
    }
}
