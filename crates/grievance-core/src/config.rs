//! Application configuration management.
//!
//! The persisted `Config` lives at `~/.config/grievance/config.json` and
//! holds the API location, timeouts and which credential storage engine to
//! use. `GRIEVANCE_API_URL` in the environment overrides the file. The
//! resolved `ClientConfig` is what the session client consumes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::{CredentialStore, FileStorage, KeyringStorage, MemoryStorage, StorageBackend};

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "grievance";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the API base URL
pub const API_URL_ENV: &str = "GRIEVANCE_API_URL";

/// Used when neither the environment nor the config file names an API.
pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";

/// HTTP request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Timeout for multipart uploads (attachments, avatars).
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 120;

/// Endpoints that must never trigger a token refresh.
const AUTH_ROUTES: &[&str] = &["/auth/login", "/auth/register", "/auth/refresh", "/auth/logout"];

const REFRESH_PATH: &str = "/auth/refresh";

const REFRESH_TOKEN_HEADER: &str = "X-Refresh-Token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Keyring,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: Option<String>,
    pub timeout_secs: u64,
    pub upload_timeout_secs: u64,
    pub with_credentials: bool,
    pub storage: StorageKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            upload_timeout_secs: DEFAULT_UPLOAD_TIMEOUT_SECS,
            with_credentials: true,
            storage: StorageKind::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .context("Failed to read config file")?;
            Ok(serde_json::from_str(&contents).context("Failed to parse config file")?)
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

    /// Resolve against the process environment.
    pub fn client_config(&self) -> ClientConfig {
        self.client_config_with_env(std::env::var(API_URL_ENV).ok())
    }

    fn client_config_with_env(&self, env_url: Option<String>) -> ClientConfig {
        let base = env_url
            .filter(|u| !u.trim().is_empty())
            .or_else(|| self.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        ClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            upload_timeout: Duration::from_secs(self.upload_timeout_secs),
            with_credentials: self.with_credentials,
            ..ClientConfig::new(base)
        }
    }

    /// Open the credential store selected by `storage`.
    pub fn open_credential_store(&self) -> Result<CredentialStore> {
        let backend: Arc<dyn StorageBackend> = match self.storage {
            StorageKind::File => Arc::new(FileStorage::default_location()?),
            StorageKind::Keyring => Arc::new(KeyringStorage::new()),
            StorageKind::Memory => Arc::new(MemoryStorage::new()),
        };
        Ok(CredentialStore::new(backend))
    }
}

/// Settings the session client runs with.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL without trailing slash.
    pub base_url: String,
    pub timeout: Duration,
    pub upload_timeout: Duration,
    /// Keep a cookie jar so cookie-based refresh flows work.
    pub with_credentials: bool,
    pub auth_routes: Vec<String>,
    pub refresh_path: String,
    pub refresh_token_header: String,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            upload_timeout: Duration::from_secs(DEFAULT_UPLOAD_TIMEOUT_SECS),
            with_credentials: true,
            auth_routes: AUTH_ROUTES.iter().map(|r| r.to_string()).collect(),
            refresh_path: REFRESH_PATH.to_string(),
            refresh_token_header: REFRESH_TOKEN_HEADER.to_string(),
        }
    }

    /// Absolute URL for `path`. Absolute inputs pass through untouched.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// Login, register, refresh and logout calls never enter the refresh path.
    pub fn is_auth_route(&self, path: &str) -> bool {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        self.auth_routes.iter().any(|route| path.contains(route.as_str()))
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
