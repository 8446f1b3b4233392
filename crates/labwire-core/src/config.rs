/*!
 * Configuration management for LabWire.
 *
 * This module loads configuration from defaults, an optional file and
 * prefixed environment variables, in that order of precedence.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::buffer::OverflowPolicy;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// State machine configuration
    #[serde(default)]
    pub machine: MachineConfig,

    /// Transport configuration
    #[serde(default)]
    pub postman: PostmanConfig,

    /// Host connection manager configuration
    #[serde(default)]
    pub manager: ManagerConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (trace, debug, info, warn, error, or an `EnvFilter` directive)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// State machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Subsystem name used as the sender of every outgoing message
    #[serde(default = "default_machine_name")]
    pub name: String,

    /// Firmware version reported by `get_info`
    #[serde(default = "default_machine_version")]
    pub version: String,

    /// State entered by `run()`
    #[serde(default = "default_idle_state")]
    pub init_state: String,

    /// State returned to when a sequence ends or aborts
    #[serde(default = "default_idle_state")]
    pub idle_state: String,

    /// Capacity of the inbox holding non-instruction messages
    #[serde(default = "default_capacity")]
    pub inbox_capacity: usize,

    /// Telemetry period in milliseconds (0 disables telemetry)
    #[serde(default)]
    pub telemetry_interval_ms: u64,

    /// Offset applied by `set_time`, in whole hours east of UTC
    #[serde(default)]
    pub timezone_offset_hours: i32,
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostmanConfig {
    /// Serial baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Longest time a single `receive()` may wait, in milliseconds
    #[serde(default = "default_postman_timeout_ms")]
    pub timeout_ms: u64,

    /// Capacity of the inbound line buffer
    #[serde(default = "default_capacity")]
    pub buffer_capacity: usize,

    /// Policy applied when the inbound line buffer is full
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

/// Host connection manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Capacity of the shared incoming event channel
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Pause between listener polls, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Longest wait for a listener thread to exit on disconnect, in milliseconds
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            name: default_machine_name(),
            version: default_machine_version(),
            init_state: default_idle_state(),
            idle_state: default_idle_state(),
            inbox_capacity: default_capacity(),
            telemetry_interval_ms: 0,
            timezone_offset_hours: 0,
        }
    }
}

impl Default for PostmanConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            timeout_ms: default_postman_timeout_ms(),
            buffer_capacity: default_capacity(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

impl MachineConfig {
    /// Telemetry period, or `None` when disabled
    pub fn telemetry_interval(&self) -> Option<Duration> {
        (self.telemetry_interval_ms > 0).then(|| Duration::from_millis(self.telemetry_interval_ms))
    }
}

impl PostmanConfig {
    /// Receive timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ManagerConfig {
    /// Listener poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Join timeout as a duration
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_machine_name() -> String {
    "labwire".to_string()
}

fn default_machine_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_idle_state() -> String {
    "Idle".to_string()
}

fn default_capacity() -> usize {
    crate::buffer::DEFAULT_CAPACITY
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_postman_timeout_ms() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_poll_interval_ms() -> u64 {
    5
}

fn default_join_timeout_ms() -> u64 {
    1000
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(override_config) = self.override_with {
            return Ok(override_config);
        }

        let mut config_builder = ConfigLib::builder();

        let default_config = Config::default();
        config_builder = config_builder.add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::from(path));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
