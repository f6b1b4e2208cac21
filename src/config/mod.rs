// TOML configuration. Every field has a default so a missing or partial
// config file still yields a working setup.


use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::SyncError;
use crate::download::DownloadConfig;
use crate::quota::QuotaConfig;

pub const CONFIG_FILE_NAME: &str = "config.toml";
const APP_DIR_NAME: &str = "tutor-sync";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
}

impl Default for ApiConfig {
    #[inline]
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
        }
    }
}

/// Rules for background query upload, distinct from the stricter bulk
/// download rules in [`DownloadConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub require_wifi: bool,
    pub min_battery_level: u8,
    pub allow_cellular: bool,
    pub retention_days: i64,
}

impl Default for SyncConfig {
    #[inline]
    fn default() -> Self {
        Self {
            require_wifi: false,
            min_battery_level: 20,
            allow_cellular: true,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub quota: QuotaConfig,
    pub download: DownloadConfig,
    pub sync: SyncConfig,
}

impl Config {
    /// Load from `path`, falling back to defaults when the file does not
    /// exist. A present-but-broken file is an error, not a silent default.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_default() -> Result<Self> {
        Self::load(&default_config_path()?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, raw)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.api.base_url).map_err(|e| {
            SyncError::Config(format!("Invalid api.base_url '{}': {}", self.api.base_url, e))
        })?;

        let q = &self.quota;
        if !(0.0..=1.0).contains(&q.warning_threshold)
            || !(0.0..=1.0).contains(&q.cleanup_threshold)
        {
            return Err(SyncError::Config(
                "Quota thresholds must be between 0 and 1".to_string(),
            )
            .into());
        }
        if q.warning_threshold > q.cleanup_threshold {
            return Err(SyncError::Config(
                "quota.warning_threshold must not exceed quota.cleanup_threshold".to_string(),
            )
            .into());
        }
        if q.max_size_bytes == 0 || q.max_embeddings == 0 {
            return Err(
                SyncError::Config("Quota limits must be non-zero".to_string()).into(),
            );
        }

        if self.download.batch_size == 0 {
            return Err(
                SyncError::Config("download.batch_size must be non-zero".to_string()).into(),
            );
        }

        if self.sync.min_battery_level > 100 || self.download.min_battery_level > 100 {
            return Err(SyncError::Config(
                "Battery thresholds are percentages (0-100)".to_string(),
            )
            .into());
        }

        Ok(())
    }
}

/// Platform data directory for the database and download state.
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or_else(|| SyncError::Config("Could not determine data directory".to_string()).into())
}

pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
        .ok_or_else(|| SyncError::Config("Could not determine config directory".to_string()).into())
}
