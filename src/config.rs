//! Configuration management
//!
//! Everything the orchestration reads from the outside world is resolved here
//! once and injected: the optional JSON config file, the process environment
//! and the optional `.env` file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::Result;
use crate::error::Error;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Token store location
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// How long to wait for the provider's redirect
    #[serde(default = "default_capture_timeout_secs")]
    pub capture_timeout_secs: u64,

    /// How often to check whether the user closed the browser
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,

    /// Timeout for fetching upstream credential sources
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,

    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub device: DeviceConfig,
}

/// Settings for the interactive Chrome session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Explicit Chrome/Chromium binary; searched on PATH when unset
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Extra command-line switches passed to the browser
    #[serde(default)]
    pub extra_args: Vec<String>,

    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
}

/// Device-flow polling defaults, used when the server does not dictate them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: u64,

    /// Extra one-time pause after a `slow_down` response
    #[serde(default = "default_slow_down_penalty_secs")]
    pub slow_down_penalty_secs: u64,

    /// Poll deadline when the device code has no advertised lifetime
    #[serde(default = "default_lifetime_secs")]
    pub default_lifetime_secs: u64,
}

fn default_store_path() -> PathBuf {
    config_dir().join("tokens.json")
}

fn default_capture_timeout_secs() -> u64 {
    300
}

fn default_liveness_interval_ms() -> u64 {
    500
}

fn default_discovery_timeout_secs() -> u64 {
    10
}

fn default_launch_timeout_secs() -> u64 {
    20
}

fn default_interval_secs() -> u64 {
    5
}

fn default_slow_down_penalty_secs() -> u64 {
    5
}

fn default_lifetime_secs() -> u64 {
    900
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            capture_timeout_secs: default_capture_timeout_secs(),
            liveness_interval_ms: default_liveness_interval_ms(),
            discovery_timeout_secs: default_discovery_timeout_secs(),
            browser: BrowserConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: None,
            extra_args: Vec::new(),
            launch_timeout_secs: default_launch_timeout_secs(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_interval_secs(),
            slow_down_penalty_secs: default_slow_down_penalty_secs(),
            default_lifetime_secs: default_lifetime_secs(),
        }
    }
}

impl AppConfig {
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_secs(self.capture_timeout_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}

/// Get the config directory path
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".oauth-cli")
}

/// Get the config file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load configuration from file, falling back to defaults when it is absent
pub fn load(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        tracing::debug!("No config at {:?}, using defaults", path);
        return Ok(AppConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("Invalid config at {:?}: {}", path, e)))
}

/// Immutable snapshot of environment variables visible to discovery
///
/// Built once at startup from the process environment merged with an optional
/// key=value file, then passed down explicitly.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    /// Snapshot the process environment without any file overlay
    ///
    /// Variables whose name or value is not valid UTF-8 are skipped.
    pub fn from_process() -> Self {
        let vars = std::env::vars_os()
            .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
                (Ok(key), Ok(value)) => Some((key, value)),
                (Ok(key), Err(_)) => {
                    tracing::debug!("Skipping non-UTF-8 value of {}", key);
                    None
                }
                _ => None,
            })
            .collect();
        Self { vars }
    }

    /// Snapshot the process environment and fill gaps from `env_file`
    ///
    /// An unreadable file is never fatal. Process values always win.
    pub fn load(env_file: &Path) -> Self {
        let mut env = Self::from_process();

        match std::fs::read_to_string(env_file) {
            Ok(content) => {
                tracing::debug!("Loading environment file {:?}", env_file);
                env.merge_file_content(&content);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Ignoring environment file {:?}: {}", env_file, e),
        }

        env
    }

    /// Build from explicit pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Look up a variable; empty values count as unset
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn merge_file_content(&mut self, content: &str) {
        for (key, value) in parse_env_file(content) {
            let present = self.vars.get(&key).is_some_and(|v| !v.is_empty());
            if !present {
                self.vars.insert(key, value);
            }
        }
    }
}

/// Parse `KEY=value` lines, skipping blanks, `#` comments and lines without `=`
fn parse_env_file(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
