//! Client configuration.
//!
//! Read from `$XDG_CONFIG_HOME/nerd/config.json` (or
//! `~/.config/nerd/config.json`), then overridden by `NERD_*` environment
//! variables.

use std::path::{Path, PathBuf};

use nerd_protocol::constants::{DEFAULT_API_URL, DEFAULT_AUTH_URL, TOKEN_ENV_VAR};
use nerd_storage::{RetryConfig, S3Config};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ClientError;

/// Object-store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub s3_endpoint: Option<String>,
    pub s3_region: Option<String>,
    pub allow_http: bool,
    /// Use a local directory instead of S3; buckets become subdirectories.
    pub local_root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            max_retries: retry.max_retries,
            retry_delay_ms: retry.retry_delay_ms,
            retry_max_delay_ms: retry.retry_max_delay_ms,
            s3_endpoint: None,
            s3_region: None,
            allow_http: false,
            local_root: None,
        }
    }
}

impl StorageConfig {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            retry_delay_ms: self.retry_delay_ms,
            retry_max_delay_ms: self.retry_max_delay_ms,
        }
    }

    pub fn s3(&self) -> S3Config {
        S3Config {
            region: self.s3_region.clone(),
            endpoint: self.s3_endpoint.clone(),
            allow_http: self.allow_http,
        }
    }
}

/// Dataset client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the coordinator API.
    pub api_url: String,

    /// Base URL of the authentication API.
    pub auth_url: String,

    /// Chunks transferred concurrently.
    pub concurrency: usize,

    pub storage: StorageConfig,

    /// Token file; `~/.nerd/token` when unset.
    pub token_path: Option<PathBuf>,

    /// Environment variable checked first for a token.
    pub token_env: String,

    /// Tokens expiring within this many seconds are refreshed.
    pub expire_window_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.into(),
            auth_url: DEFAULT_AUTH_URL.into(),
            concurrency: nerd_transfer::DEFAULT_CONCURRENCY,
            storage: StorageConfig::default(),
            token_path: None,
            token_env: TOKEN_ENV_VAR.into(),
            expire_window_secs: 60,
        }
    }
}

impl ClientConfig {
    /// Loads configuration from `path`.
    ///
    /// A missing file yields the defaults; so does a file that fails to
    /// parse, with a warning.
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        match serde_json::from_str::<Self>(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Loads from [`default_config_path`] and applies the environment.
    pub fn load_default() -> Result<Self, ClientError> {
        let mut config = match default_config_path() {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Applies `NERD_API_URL`, `NERD_AUTH_URL` and `NERD_CONCURRENCY`.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = lookup("NERD_API_URL") {
            self.api_url = url;
        }
        if let Some(url) = lookup("NERD_AUTH_URL") {
            self.auth_url = url;
        }
        if let Some(raw) = lookup("NERD_CONCURRENCY") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.concurrency = n,
                _ => warn!(value = %raw, "ignoring invalid NERD_CONCURRENCY"),
            }
        }
    }
}

/// `$XDG_CONFIG_HOME/nerd/config.json`, else `$HOME/.config/nerd/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    let non_empty = |key: &str| std::env::var_os(key).filter(|v| !v.is_empty());
    non_empty("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| non_empty("HOME").map(|h| PathBuf::from(h).join(".config")))
        .map(|dir| dir.join("nerd").join("config.json"))
}
