//! Configuration loading using Figment
//!
//! Configuration is merged from:
//! 1. `config/scope.toml` (base configuration)
//! 2. Environment variables prefixed with `SCOPE_DAQ_`, nested keys split on `__`
//!
//! ```toml
//! [application]
//! name = "Bench scope"
//! log_level = "debug"
//!
//! [[devices]]
//! id = "stage"
//! type = "asi_xy_stage"
//! [devices.config]
//! port = "/dev/ttyUSB0"
//! ```
//!
//! `SCOPE_DAQ_APPLICATION__LOG_LEVEL=trace` overrides the file's log level.

use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/scope.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SCOPE_DAQ_";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Device definitions
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Answer timeout used while probing ports
    #[serde(default = "default_detect_timeout", with = "humantime_serde")]
    pub detect_timeout: Duration,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            detect_timeout: default_detect_timeout(),
        }
    }
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored (for development)
    #[default]
    Pretty,
    /// One line per event, no colors
    Compact,
    /// JSON objects for log aggregation
    Json,
}

/// One configured device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device identifier
    pub id: String,
    /// Driver type (e.g., "asi_xy_stage", "skyra")
    pub r#type: String,
    /// Whether this device is built at startup
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific configuration, validated by the driver factory
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

fn default_name() -> String {
    "scope-daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_detect_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl AppConfig {
    /// Load configuration from `config/scope.toml` and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file yields the defaults, still subject to environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    /// Check settings that serde cannot express.
    ///
    /// `known_types` lists the driver types with a registered factory.
    pub fn validate(&self, known_types: &[&str]) -> Result<()> {
        if !LOG_LEVELS.contains(&self.application.log_level.to_lowercase().as_str()) {
            bail!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            );
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                bail!("Device of type '{}' has an empty id", device.r#type);
            }
            if !ids.insert(device.id.as_str()) {
                bail!("Duplicate device ID: {}", device.id);
            }
            if !known_types.contains(&device.r#type.as_str()) {
                bail!(
                    "Device '{}' has unknown type '{}'. Known types: {}",
                    device.id,
                    device.r#type,
                    known_types.join(", ")
                );
            }
        }

        Ok(())
    }

    /// All enabled devices, in file order
    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceDefinition> {
        self.devices.iter().filter(|device| device.enabled)
    }

    /// Look up a device by id, enabled or not
    pub fn device(&self, id: &str) -> Option<&DeviceDefinition> {
        self.devices.iter().find(|device| device.id == id)
    }
}
