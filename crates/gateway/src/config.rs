//! Configuration for the gateway.
//!
//! This module provides TOML-based configuration file loading.
//! The default configuration path is `~/.config/termgate/gateway.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen address is not a valid socket address: {0}")]
    InvalidListenAddr(String),

    #[error("queue_capacity must be between 1 and 65536, got {0}")]
    InvalidQueueCapacity(usize),

    #[error("attach_timeout_secs must be greater than 0")]
    InvalidAttachTimeout,

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
    /// Generous timeouts; idle clients linger.
    #[default]
    Development,
    /// Tight timeouts; idle clients are evicted quickly.
    Production,
}

/// What to do when a client's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued frame to make room. The client's terminal
    /// may skip output but the connection survives.
    #[default]
    DropOldest,
    /// Close the connection with a backpressure error.
    Disconnect,
}

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Deployment profile.
    pub profile: Profile,

    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener addresses.
    pub listen: ListenConfig,

    /// Frame relay configuration.
    pub relay: RelayConfig,

    /// Idle-connection reaper configuration.
    pub reaper: ReaperConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Listener addresses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ListenConfig {
    /// Address for end-user client connections.
    pub client_addr: String,

    /// Address for session host (upstream) connections.
    pub upstream_addr: String,
}

/// Frame relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Per-connection outbound queue depth, in frames.
    pub queue_capacity: usize,

    /// What to do when a client's outbound queue overflows.
    pub overflow_policy: OverflowPolicy,

    /// How long to wait for the session host to answer an attach, in seconds.
    pub attach_timeout_secs: u64,
}

/// Idle-connection reaper configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReaperConfig {
    /// How often the reaper sweeps, in seconds.
    pub interval_secs: u64,

    /// How long a client connection may sit idle before eviction, in seconds.
    /// Unset means the profile default applies.
    pub idle_timeout_secs: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            client_addr: "127.0.0.1:9200".to_string(),
            upstream_addr: "127.0.0.1:9201".to_string(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            overflow_policy: OverflowPolicy::DropOldest,
            attach_timeout_secs: 10,
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            idle_timeout_secs: None,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termgate")
        .join("gateway.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMGATE_CLIENT_ADDR: Override the client listener address
    /// - TERMGATE_UPSTREAM_ADDR: Override the upstream listener address
    /// - TERMGATE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - TERMGATE_PROFILE: Override the profile (development, production)
    /// - TERMGATE_IDLE_TIMEOUT_SECS: Override the idle-connection timeout
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("TERMGATE_CLIENT_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding client_addr from environment: {}", addr);
                self.listen.client_addr = addr;
            }
        }

        if let Ok(addr) = std::env::var("TERMGATE_UPSTREAM_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding upstream_addr from environment: {}", addr);
                self.listen.upstream_addr = addr;
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

        if let Ok(secs) = std::env::var("TERMGATE_IDLE_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse::<u64>() {
                self.reaper.idle_timeout_secs = Some(secs);
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for addr in [&self.listen.client_addr, &self.listen.upstream_addr] {
            if addr.parse::<std::net::SocketAddr>().is_err() {
                return Err(ConfigError::InvalidListenAddr(addr.clone()));
            }
        }

        if self.relay.queue_capacity < 1 || self.relay.queue_capacity > 65_536 {
            return Err(ConfigError::InvalidQueueCapacity(self.relay.queue_capacity));
        }

        if self.relay.attach_timeout_secs == 0 {
            return Err(ConfigError::InvalidAttachTimeout);
        }

        if self.reaper.interval_secs == 0 {
            return Err(ConfigError::InvalidSweepInterval);
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Effective idle-connection timeout, after profile defaults.
    pub fn idle_timeout(&self) -> Duration {
        let secs = self.reaper.idle_timeout_secs.unwrap_or(match self.profile {
            Profile::Development => 3_600,
            Profile::Production => 180,
        });
        Duration::from_secs(secs)
    }

    /// How often the reaper sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.reaper.interval_secs)
    }

    /// How long an attach may wait on the session host.
    pub fn attach_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.attach_timeout_secs)
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
