//! Configuration for the session host.
//!
//! This module provides TOML-based configuration file loading.
//! The default configuration path is `~/.config/termgate/sessiond.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::InputPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::SpawnSpec;
use crate::registry::RegistryConfig;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("gateway url must start with ws:// or wss://, got {0}")]
    InvalidGatewayUrl(String),

    #[error("shell must not be empty")]
    EmptyShell,

    #[error("shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("sweep interval_secs must be greater than 0")]
    InvalidSweepInterval,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Deployment profile. Drives timeout defaults that differ between a
/// developer laptop and a production host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Generous timeouts; sessions survive a working day unattended.
    #[default]
    Development,
    /// Tight timeouts; abandoned sessions are destroyed quickly.
    Production,
}

/// Main configuration structure for the session host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Deployment profile.
    pub profile: Profile,

    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Gateway link configuration.
    pub gateway: GatewayConfig,

    /// Session management configuration.
    pub session: SessionConfig,

    /// Background sweeper configuration.
    pub sweep: SweepConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Gateway link configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket URL of the gateway's upstream listener.
    pub url: String,

    /// Initial reconnect backoff in milliseconds.
    pub reconnect_initial_ms: u64,

    /// Reconnect backoff ceiling in milliseconds.
    pub reconnect_max_ms: u64,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Default shell to use for new sessions.
    pub default_shell: String,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Input arbitration policy for new sessions.
    pub default_policy: InputPolicy,

    /// Initial terminal width in columns.
    pub cols: u16,

    /// Initial terminal height in rows.
    pub rows: u16,
}

/// Background sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SweepConfig {
    /// How often the sweeper runs, in seconds.
    pub interval_secs: u64,

    /// How long a detached session survives before destruction, in seconds.
    /// Unset means the profile default applies.
    pub detached_timeout_secs: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9201".to_string(),
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            max_sessions: 64,
            default_policy: InputPolicy::Shared,
            cols: 80,
            rows: 24,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            detached_timeout_secs: None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termgate")
        .join("sessiond.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMGATE_GATEWAY_URL: Override the gateway upstream URL
    /// - TERMGATE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMGATE_PROFILE: Override the profile (development, production)
    /// - TERMGATE_DETACHED_TIMEOUT_SECS: Override the detached-session timeout
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TERMGATE_GATEWAY_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding gateway url from environment: {}", url);
                self.gateway.url = url;
            }
        }

        if let Ok(level) = std::env::var("TERMGATE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(profile) = std::env::var("TERMGATE_PROFILE") {
            match profile.as_str() {
                "development" => self.profile = Profile::Development,
                "production" => self.profile = Profile::Production,
                "" => {}
                other => {
                    tracing::warn!("Ignoring unknown TERMGATE_PROFILE value: {}", other);
                }
            }
        }

        if let Ok(secs) = std::env::var("TERMGATE_DETACHED_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                self.sweep.detached_timeout_secs = Some(secs);
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        let url = &self.gateway.url;
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ConfigError::InvalidGatewayUrl(url.clone()));
        }

        if self.session.default_shell.is_empty() {
            return Err(ConfigError::EmptyShell);
        }

        let shell_path = Path::new(&self.session.default_shell);
        if shell_path.is_absolute() && !shell_path.exists() {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        if self.sweep.interval_secs == 0 {
            return Err(ConfigError::InvalidSweepInterval);
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Effective detached-session timeout, after profile defaults.
    pub fn detached_timeout(&self) -> Duration {
        let secs = self.sweep.detached_timeout_secs.unwrap_or(match self.profile {
            Profile::Development => 86_400, // a full working day
            Profile::Production => 1_800,
        });
        Duration::from_secs(secs)
    }

    /// How often the sweeper runs.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep.interval_secs)
    }

    /// Registry limits and spawn defaults derived from this configuration.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_sessions: self.session.max_sessions,
            spawn: SpawnSpec {
                shell: Some(self.session.default_shell.clone()),
                cols: self.session.cols,
                rows: self.session.rows,
                env: vec![("TERM".to_string(), "xterm-256color".to_string())],
                cwd: None,
            },
            default_policy: self.session.default_policy,
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", e.message()))
    }
}
