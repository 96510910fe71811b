//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.medra/config.json`) and environment.
//! Covers the backend API location, session persistence/refresh, and the reference backend.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Backend API location.
    #[serde(default)]
    pub api: ApiConfig,

    /// Credential persistence and refresh.
    #[serde(default)]
    pub session: SessionConfig,

    /// Reference backend served by `medra serve`.
    #[serde(default)]
    pub backend: BackendConfig,
}

/// Where the backend API lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    /// Base URL without trailing slash. Overridden by MEDRA_API_BASE env.
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
}

/// Session settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Seconds between token refreshes while signed in (default one day).
    pub refresh_interval_secs: Option<u64>,

    /// Where the credential file lives (default ~/.medra/credentials.json).
    pub credentials_path: Option<PathBuf>,
}

/// Bind address and port for the reference backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Port for HTTP (default 8000).
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_backend_bind")]
    pub bind: String,

    /// Pause between streamed reply tokens in milliseconds (default 0).
    #[serde(default)]
    pub token_delay_ms: u64,
}

const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 24 * 60 * 60;

fn default_api_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_backend_port() -> u16 {
    8000
}

fn default_backend_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            port: default_backend_port(),
            bind: default_backend_bind(),
            token_delay_ms: 0,
        }
    }
}

/// Resolve the API base URL: env MEDRA_API_BASE overrides config. Trailing slashes are dropped.
pub fn resolve_api_base_url(config: &Config) -> String {
    std::env::var("MEDRA_API_BASE")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| config.api.base_url.trim().to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Interval between token refreshes. Zero in config falls back to the default.
pub fn resolve_refresh_interval(config: &Config) -> Duration {
    let secs = config
        .session
        .refresh_interval_secs
        .filter(|s| *s > 0)
        .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS);
    Duration::from_secs(secs)
}

/// Pause between reference backend stream tokens.
pub fn resolve_token_delay(config: &Config) -> Duration {
    Duration::from_millis(config.backend.token_delay_ms)
}

/// Resolve the credential file path from config or default.
pub fn resolve_credentials_path(config: &Config) -> PathBuf {
    config
        .session
        .credentials_path
        .clone()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| medra_dir().join("credentials.json"))
}

fn medra_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".medra"))
        .unwrap_or_else(|| PathBuf::from(".medra"))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("MEDRA_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| medra_dir().join("config.json"))
}

/// Load config from the given path, or the default path (or MEDRA_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
