//! Engine configuration
//!
//! Layers, later wins: built-in defaults, the TOML file named by
//! `BTWIFI_CONFIG` (else `<config dir>/btwifi/config.toml`), then
//! `BTWIFI_SCAN_CYCLE_SECS`, `BTWIFI_COMMAND_TIMEOUT_MS` and `BTWIFI_ADAPTER`.
//! Command line flags are applied on top by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use btwifi_proto::{DEFAULT_MAX_MESSAGE_LEN, MAX_CHUNK_LEN};
use serde::Deserialize;
use tracing::debug;

use crate::session::SessionOptions;

pub const CONFIG_ENV: &str = "BTWIFI_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {name}")]
    Env { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetupConfig {
    /// Length of one scan cycle in seconds
    #[serde(default = "default_scan_cycle_secs")]
    pub scan_cycle_secs: u64,
    #[serde(default = "default_continuous_scan")]
    pub continuous_scan: bool,
    /// 0 waits forever
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_max_chunk_len")]
    pub max_chunk_len: usize,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    /// Substring of the adapter name to use; first adapter if unset
    #[serde(default)]
    pub adapter: Option<String>,
    /// Housekeeping interval of the client loop
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_scan_cycle_secs() -> u64 {
    10
}
fn default_continuous_scan() -> bool {
    true
}
fn default_command_timeout_ms() -> u64 {
    10_000
}
fn default_max_chunk_len() -> usize {
    MAX_CHUNK_LEN
}
fn default_max_message_len() -> usize {
    DEFAULT_MAX_MESSAGE_LEN
}
fn default_tick_ms() -> u64 {
    250
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            scan_cycle_secs: default_scan_cycle_secs(),
            continuous_scan: default_continuous_scan(),
            command_timeout_ms: default_command_timeout_ms(),
            max_chunk_len: default_max_chunk_len(),
            max_message_len: default_max_message_len(),
            adapter: None,
            tick_ms: default_tick_ms(),
        }
    }
}

impl SetupConfig {
    /// Defaults, then the config file if there is one, then the environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "reading config");
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply environment overrides read through `lookup`
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(value) = lookup("BTWIFI_SCAN_CYCLE_SECS") {
            self.scan_cycle_secs = parse_env("BTWIFI_SCAN_CYCLE_SECS", value)?;
        }
        if let Some(value) = lookup("BTWIFI_COMMAND_TIMEOUT_MS") {
            self.command_timeout_ms = parse_env("BTWIFI_COMMAND_TIMEOUT_MS", value)?;
        }
        if let Some(value) = lookup("BTWIFI_ADAPTER") {
            self.adapter = Some(value).filter(|v| !v.is_empty());
        }
        Ok(())
    }

    pub fn scan_cycle(&self) -> Duration {
        Duration::from_secs(self.scan_cycle_secs.max(1))
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_ms > 0).then(|| Duration::from_millis(self.command_timeout_ms))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(10))
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            max_chunk_len: self.max_chunk_len.clamp(1, MAX_CHUNK_LEN),
            max_message_len: self.max_message_len,
            command_timeout: self.command_timeout(),
        }
    }
}

fn parse_env(name: &'static str, value: String) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env { name, value })
}

fn config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("btwifi").join("config.toml"))
}
