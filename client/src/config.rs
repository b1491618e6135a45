//! Client configuration.
//!
//! Read from an optional JSON file where every field has a default, then
//! overridden from the environment (`PARLEY_API_URL`, `PARLEY_API_TOKEN`,
//! `PARLEY_KEYSTORE_DIR`, `PARLEY_KEYSTORE_PASSPHRASE`, `PARLEY_LOG`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_protocol::HttpBackend;
use parley_voice::SignalingConfig;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ENV_API_URL: &str = "PARLEY_API_URL";
pub const ENV_API_TOKEN: &str = "PARLEY_API_TOKEN";
pub const ENV_KEYSTORE_DIR: &str = "PARLEY_KEYSTORE_DIR";
pub const ENV_KEYSTORE_PASSPHRASE: &str = "PARLEY_KEYSTORE_PASSPHRASE";
pub const ENV_LOG: &str = "PARLEY_LOG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    /// Directory holding the per-user Stronghold snapshots.
    pub keystore_dir: PathBuf,
    /// Unlocks the keychain. Without one, keys live only in memory.
    #[serde(skip_serializing)]
    pub keystore_passphrase: Option<String>,
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub calls: CallTimeouts,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3001/api".into(),
            api_token: None,
            keystore_dir: PathBuf::from("parley-keys"),
            keystore_passphrase: None,
            log_filter: "info".into(),
            calls: CallTimeouts::default(),
        }
    }
}

/// Call timers and paging. All durations in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallTimeouts {
    /// How long an incoming call rings before it is declined as missed.
    pub accept_timeout_secs: u64,
    pub answer_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_ice_restarts: u32,
    pub history_page_size: u32,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            accept_timeout_secs: 25,
            answer_timeout_secs: 30,
            connect_timeout_secs: 15,
            max_ice_restarts: 2,
            history_page_size: 20,
        }
    }
}

impl CallTimeouts {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_secs(self.accept_timeout_secs)
    }

    pub fn signaling_config(&self) -> SignalingConfig {
        SignalingConfig {
            answer_timeout: Duration::from_secs(self.answer_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            max_ice_restarts: self.max_ice_restarts,
            ..SignalingConfig::default()
        }
    }
}

impl ClientConfig {
    /// Load from `path` (defaults when `None` or missing), then apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                Self::from_json(&text)?
            }
            Some(path) => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(url) = lookup(ENV_API_URL) {
            self.api_base_url = url;
        }
        if let Some(token) = lookup(ENV_API_TOKEN) {
            self.api_token = Some(token);
        }
        if let Some(dir) = lookup(ENV_KEYSTORE_DIR) {
            self.keystore_dir = PathBuf::from(dir);
        }
        if let Some(passphrase) = lookup(ENV_KEYSTORE_PASSPHRASE) {
            self.keystore_passphrase = Some(passphrase);
        }
        if let Some(filter) = lookup(ENV_LOG) {
            self.log_filter = filter;
        }
    }

    /// REST client for the configured backend.
    pub fn http_backend(&self) -> Result<HttpBackend, ConfigError> {
        let token = self.api_token.as_deref().ok_or(ConfigError::MissingToken)?;
        Ok(HttpBackend::new(&self.api_base_url, token)?)
    }
}
