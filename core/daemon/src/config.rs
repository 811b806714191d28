//! Runtime configuration and filesystem layout.

use serde::Deserialize;
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::monitor::{MonitorSettings, DEFAULT_TICK_INTERVAL_SECS};
use crate::wear::WearWeights;

const CONFIG_ENV: &str = "ICONWEAR_CONFIG";
const SOCKET_ENV: &str = "ICONWEAR_SOCKET";
const BASE_DIR_NAME: &str = ".iconwear";
const SOCKET_NAME: &str = "daemon.sock";
const DEFAULT_CONFIG_RELATIVE_PATH: &str = "daemon/iconwear.toml";
const DEFAULT_DB_RELATIVE_PATH: &str = "daemon/wear.db";

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub wear: WearWeights,
    #[serde(default)]
    pub monitor: MonitorSettings,
}

impl DaemonConfig {
    /// Replaces values the engine cannot run with and logs what was dropped.
    pub fn validated(self) -> Self {
        let (wear, rejected) = self.wear.sanitized();
        for field in rejected {
            tracing::warn!(field, "Invalid wear factor in config; using default");
        }

        let mut monitor = self.monitor;
        if monitor.tick_interval_secs == 0 {
            tracing::warn!("tick_interval_secs must be positive; using default");
            monitor.tick_interval_secs = DEFAULT_TICK_INTERVAL_SECS;
        }

        Self { wear, monitor }
    }
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, ConfigError> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.clone(),
        source,
    })?;
    let config = toml::from_str::<DaemonConfig>(&content).map_err(|source| ConfigError::Parse {
        path: config_path,
        source,
    })?;
    Ok(config.validated())
}

pub fn base_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
    Ok(home.join(BASE_DIR_NAME))
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(base_dir()?.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn socket_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = std::env::var_os(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(base_dir()?.join(SOCKET_NAME))
}

pub fn db_path() -> Result<PathBuf, ConfigError> {
    Ok(base_dir()?.join(DEFAULT_DB_RELATIVE_PATH))
}
