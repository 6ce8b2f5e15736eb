/*!
 * Configuration types for Tether
 */

use crate::adapter::{AdapterKind, Properties};
use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tether_core_resilience::BackoffConfig;

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default)]
    pub delivery_log: DeliveryLogConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub backoff: BackoffSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named connections; keys are connection names
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,
}

/// Durable logging of failed sends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryLogConfig {
    /// When off, failed sends are attempted once and dropped (best-effort mode)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory holding the manifest and per-connection logs
    #[serde(default = "default_log_location")]
    pub location: PathBuf,
}

impl Default for DeliveryLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            location: default_log_location(),
        }
    }
}

/// Sizes of the background worker pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Concurrent reconnect loops
    #[serde(default = "default_workers")]
    pub reconnect_workers: usize,

    /// Concurrent backlog resends
    #[serde(default = "default_workers")]
    pub resend_workers: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            reconnect_workers: default_workers(),
            resend_workers: default_workers(),
        }
    }
}

/// Reconnect backoff schedule, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffSettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// The delay multiplier caps at `2^max_exponent`
    #[serde(default = "default_max_exponent")]
    pub max_exponent: u32,

    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,

    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_exponent: default_max_exponent(),
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
        }
    }
}

impl BackoffSettings {
    pub fn to_backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_exponent: self.max_exponent,
            jitter_min: Duration::from_millis(self.jitter_min_ms),
            jitter_max: Duration::from_millis(self.jitter_max_ms),
        }
    }
}

/// Diagnostic output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Write JSON logs to this file instead of stdout
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Shorthand for `level = "debug"`
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// One named connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Broker technology
    #[serde(rename = "type")]
    pub kind: AdapterKind,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Adapter-specific keys, passed through untouched
    #[serde(flatten)]
    pub properties: Properties,
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_workers() -> usize {
    4
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_exponent() -> u32 {
    4
}

fn default_jitter_min_ms() -> u64 {
    1
}

fn default_jitter_max_ms() -> u64 {
    999
}

fn default_log_location() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("tether")
        .join("delivery-log")
}

impl TetherConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: TetherConfig = toml::from_str(contents)
            .map_err(|e| BrokerError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.executor.reconnect_workers == 0 || self.executor.resend_workers == 0 {
            return Err(BrokerError::Config(
                "executor worker pools need at least one worker each".to_string(),
            ));
        }

        self.backoff
            .to_backoff_config()
            .validate()
            .map_err(|e| BrokerError::Config(e.to_string()))?;

        for name in self.connections.keys() {
            if name.is_empty() || name.chars().any(char::is_whitespace) {
                return Err(BrokerError::Config(format!(
                    "connection name '{}' must be non-empty and contain no whitespace",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Enabled connections, in name order
    pub fn enabled_connections(&self) -> impl Iterator<Item = (&String, &ConnectionConfig)> {
        self.connections.iter().filter(|(_, conn)| conn.enabled)
    }
}
