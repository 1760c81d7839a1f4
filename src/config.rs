use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::{KeyValueStore, StorageError};

/// Prefix shared by every key this crate writes to a store.
pub const DEFAULT_KEY_PREFIX: &str = "daplot_";
pub const CONFIG_SETTING_KEY: &str = "config";

pub const ENV_API_BASE_URL: &str = "DAPLOT_API_BASE_URL";
pub const ENV_API_TIMEOUT_MS: &str = "DAPLOT_API_TIMEOUT_MS";
pub const ENV_API_RETRIES: &str = "DAPLOT_API_RETRIES";
pub const ENV_DATA_DIR: &str = "DAPLOT_DATA_DIR";

const MAX_TIMEOUT_MS: u64 = 60_000;
const MAX_RETRIES: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("config storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_upload_timeout_ms")]
    pub upload_timeout_ms: u64,
    #[serde(default = "default_download_timeout_ms")]
    pub download_timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_cache_expiry_ms")]
    pub cache_expiry_ms: u64,
    #[serde(default = "default_page_state_expiry_ms")]
    pub page_state_expiry_ms: u64,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderConfig {
    /// Origin that relative script paths are resolved against.
    #[serde(default = "default_asset_base_url")]
    pub asset_base_url: String,
    #[serde(default = "default_script_timeout_ms")]
    pub script_timeout_ms: u64,
    #[serde(default = "default_fallback_delay_ms")]
    pub fallback_delay_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            timeout_ms: default_timeout_ms(),
            upload_timeout_ms: default_upload_timeout_ms(),
            download_timeout_ms: default_download_timeout_ms(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            max_payload_bytes: default_max_payload_bytes(),
            cache_expiry_ms: default_cache_expiry_ms(),
            page_state_expiry_ms: default_page_state_expiry_ms(),
            data_dir: None,
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            asset_base_url: default_asset_base_url(),
            script_timeout_ms: default_script_timeout_ms(),
            fallback_delay_ms: default_fallback_delay_ms(),
        }
    }
}

impl StorageConfig {
    pub fn cache_expiry(&self) -> Duration {
        Duration::from_millis(self.cache_expiry_ms)
    }

    pub fn page_state_expiry(&self) -> Duration {
        Duration::from_millis(self.page_state_expiry_ms)
    }

    /// Directory holding the durable store: explicit setting, then
    /// `DAPLOT_DATA_DIR`, then the per-user application data directory.
    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }

        if let Ok(path) = std::env::var(ENV_DATA_DIR) {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return PathBuf::from(trimmed);
            }
        }

        #[cfg(target_os = "windows")]
        {
            if let Ok(app_data) = std::env::var("APPDATA") {
                return PathBuf::from(app_data).join("Daplot");
            }
        }

        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".daplot");
        }

        if let Ok(home) = std::env::var("USERPROFILE") {
            return PathBuf::from(home).join(".daplot");
        }

        PathBuf::from(".daplot")
    }

    /// Path of the durable SQLite store, creating its directory.
    pub fn durable_store_path(&self) -> Result<PathBuf, ConfigError> {
        let dir = self.resolve_data_dir();
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join("daplot.db"))
    }
}

impl AppConfig {
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup; blank values are ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(base_url) = get(ENV_API_BASE_URL) {
            self.api.base_url = base_url;
        }
        if let Some(raw) = get(ENV_API_TIMEOUT_MS) {
            self.api.timeout_ms = raw.parse().map_err(|error| {
                ConfigError::Invalid(format!("{ENV_API_TIMEOUT_MS}='{raw}': {error}"))
            })?;
        }
        if let Some(raw) = get(ENV_API_RETRIES) {
            self.api.retries = raw.parse().map_err(|error| {
                ConfigError::Invalid(format!("{ENV_API_RETRIES}='{raw}': {error}"))
            })?;
        }
        if let Some(dir) = get(ENV_DATA_DIR) {
            self.storage.data_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        reqwest::Url::parse(self.api.base_url.trim()).map_err(|error| {
            ConfigError::Invalid(format!("invalid api baseUrl '{}': {error}", self.api.base_url))
        })?;
        reqwest::Url::parse(self.loader.asset_base_url.trim()).map_err(|error| {
            ConfigError::Invalid(format!(
                "invalid loader assetBaseUrl '{}': {error}",
                self.loader.asset_base_url
            ))
        })?;
        for (label, value) in [
            ("api timeout", self.api.timeout_ms),
            ("api upload timeout", self.api.upload_timeout_ms),
            ("api download timeout", self.api.download_timeout_ms),
        ] {
            if value == 0 || value > MAX_TIMEOUT_MS {
                return Err(ConfigError::Invalid(format!(
                    "{label} must be between 1 and {MAX_TIMEOUT_MS} ms, got {value}"
                )));
            }
        }
        if self.api.retries > MAX_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "api retries must be at most {MAX_RETRIES}, got {}",
                self.api.retries
            )));
        }
        if self.storage.max_payload_bytes == 0 {
            return Err(ConfigError::Invalid(
                "storage maxPayloadBytes must be greater than 0".to_string(),
            ));
        }
        if self.storage.key_prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "storage keyPrefix cannot be empty".to_string(),
            ));
        }
        if self.loader.script_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "loader scriptTimeoutMs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn config_key() -> String {
    format!("{DEFAULT_KEY_PREFIX}{CONFIG_SETTING_KEY}")
}

/// Defaults, overlaid with the stored config, overlaid with the environment.
pub fn load_config(store: &dyn KeyValueStore) -> Result<AppConfig, ConfigError> {
    let mut config = match store.get(&config_key())? {
        Some(raw) => serde_json::from_str::<AppConfig>(&raw).map_err(|error| {
            ConfigError::Invalid(format!("invalid stored configuration: {error}"))
        })?,
        None => AppConfig::default(),
    };

    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(store: &dyn KeyValueStore, config: &AppConfig) -> Result<(), ConfigError> {
    config.validate()?;
    let value = serde_json::to_string(config).map_err(StorageError::from)?;
    store.set(&config_key(), &value)?;
    Ok(())
}

fn default_api_base_url() -> String {
    "http://localhost:8001".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_upload_timeout_ms() -> u64 {
    60_000
}

fn default_download_timeout_ms() -> u64 {
    30_000
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_max_payload_bytes() -> usize {
    5 * 1024 * 1024
}

fn default_cache_expiry_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_page_state_expiry_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_asset_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_script_timeout_ms() -> u64 {
    10_000
}

fn default_fallback_delay_ms() -> u64 {
    1_000
}
