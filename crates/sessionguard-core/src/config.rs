//! Client configuration management.
//!
//! This module handles loading and saving the client configuration, which
//! includes the API base URL, endpoint paths, timeouts and the session
//! storage backend.
//!
//! Configuration is stored at `~/.config/sessionguard/config.json`.
//! `SESSIONGUARD_API_URL` and `SESSIONGUARD_STORAGE` override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "sessionguard";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default API base URL, matching a local development server
const DEFAULT_BASE_URL: &str = "http://localhost:5000/v1/";

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on a single renewal cycle in seconds.
/// Waiters queued behind a stuck renewal fail instead of hanging forever.
const DEFAULT_RENEWAL_TIMEOUT_SECS: u64 = 30;

/// Where the session credentials are persisted between runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// JSON file in the cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
    /// Process memory only
    Memory,
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "file" => Ok(StorageKind::File),
            "keyring" => Ok(StorageKind::Keyring),
            "memory" => Ok(StorageKind::Memory),
            other => Err(anyhow::anyhow!("Unknown storage backend: {}", other)),
        }
    }
}

/// Paths of the authentication endpoints, relative to the base URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub login: String,
    pub refresh: String,
    pub logout: String,
    pub user_details: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: "/auth/login".to_string(),
            refresh: "/auth/refresh-token".to_string(),
            logout: "/auth/logout".to_string(),
            user_details: "/auth/user".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub base_url: String,
    pub endpoints: Endpoints,
    pub request_timeout_secs: u64,
    /// `None` disables the renewal timeout
    pub renewal_timeout_secs: Option<u64>,
    pub storage: StorageKind,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            endpoints: Endpoints::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            renewal_timeout_secs: Some(DEFAULT_RENEWAL_TIMEOUT_SECS),
            storage: StorageKind::default(),
            last_email: None,
        }
    }
}

impl Config {
    /// Config for a given base URL with every other setting at its default
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Load the config file with environment overrides applied
    pub fn load() -> Result<Self> {
        let mut config = Self::read_file(&Self::config_path()?)?;
        config.apply_env();
        Ok(config)
    }

    /// Remember the last login email. Only that field is written back;
    /// environment overrides never reach the file.
    pub fn remember_email(&mut self, email: &str) -> Result<()> {
        self.last_email = Some(email.to_string());
        Self::remember_email_in(&Self::config_path()?, email)
    }

    fn remember_email_in(path: &Path, email: &str) -> Result<()> {
        let mut on_disk = Self::read_file(path)?;
        on_disk.last_email = Some(email.to_string());
        on_disk.write_file(path)
    }

    fn read_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents).context("Failed to parse config file")
    }

    fn write_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("SESSIONGUARD_API_URL") {
            if !url.trim().is_empty() {
                self.base_url = url;
            }
        }
        if let Ok(storage) = std::env::var("SESSIONGUARD_STORAGE") {
            match storage.parse() {
                Ok(kind) => self.storage = kind,
                Err(e) => warn!(error = %e, "Ignoring SESSIONGUARD_STORAGE"),
            }
        }
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

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn renewal_timeout(&self) -> Option<Duration> {
        self.renewal_timeout_secs.map(Duration::from_secs)
    }
}
