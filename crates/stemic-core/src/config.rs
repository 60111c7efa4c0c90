//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the API
//! base URL, the session timing knobs, and the last email used to sign in.
//!
//! Configuration is stored at `~/.config/stemic/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "stemic";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default STEMIC API base URL
pub const DEFAULT_API_BASE_URL: &str = "https://api.stemic.app/api";

/// How often the background loop looks at the token.
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 60;

/// Remaining lifetime under which the token is refreshed ahead of expiry.
pub const DEFAULT_REFRESH_THRESHOLD_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub check_interval_secs: u64,
    pub refresh_threshold_secs: u64,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            check_interval_secs: DEFAULT_CHECK_INTERVAL_SECS,
            refresh_threshold_secs: DEFAULT_REFRESH_THRESHOLD_SECS,
            last_email: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Session timing derived from this config. Zero values fall back to defaults.
    pub fn session_settings(&self) -> crate::auth::SessionSettings {
        let interval = match self.check_interval_secs {
            0 => DEFAULT_CHECK_INTERVAL_SECS,
            n => n,
        };
        let threshold = match self.refresh_threshold_secs {
            0 => DEFAULT_REFRESH_THRESHOLD_SECS,
            n => n,
        };
        crate::auth::SessionSettings {
            check_interval: Duration::from_secs(interval),
            refresh_threshold: i64::try_from(threshold)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .unwrap_or_else(|| chrono::Duration::seconds(DEFAULT_REFRESH_THRESHOLD_SECS as i64)),
        }
    }
}
