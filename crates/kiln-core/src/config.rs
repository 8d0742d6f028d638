//! Service configuration.
//!
//! Sources, lowest precedence first:
//! 1. Defaults
//! 2. TOML file passed with `--config`
//! 3. `KILN__SECTION__KEY` environment variables (e.g. `KILN__SCHEDULER__GLOBAL_LIMIT=4`)

use crate::logging::LogFormat;
use kiln_orchestrator::{DEFAULT_BUFFER_CAPACITY, SchedulerConfig};
use kiln_training::{Device, DeviceKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "KILN";

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read or write a configuration file.
    #[error("Failed to access configuration file: {0}")]
    Io(String),

    /// Failed to parse configuration.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// A value is out of range or inconsistent.
    #[error("Invalid configuration value: {0}")]
    Invalid(String),

    /// Layered loading failed.
    #[error(transparent)]
    Source(#[from] config::ConfigError),
}

/// `[scheduler]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Maximum running jobs overall.
    pub global_limit: usize,
    /// Maximum running jobs per user.
    pub per_user_limit: usize,
    /// Default max run time of a job.
    pub max_duration_secs: Option<u64>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self { global_limit: 1, per_user_limit: 1, max_duration_secs: None }
    }
}

/// One `[[devices]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub kind: DeviceKind,
}

impl From<&DeviceConfig> for Device {
    fn from(config: &DeviceConfig) -> Self {
        Device::new(config.id.clone(), config.kind)
    }
}

fn default_devices() -> Vec<DeviceConfig> {
    vec![DeviceConfig { id: "cpu0".to_string(), kind: DeviceKind::Cpu }]
}

/// `[dispatcher]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    /// Per-subscription progress buffer.
    pub buffer_capacity: usize,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self { buffer_capacity: DEFAULT_BUFFER_CAPACITY }
    }
}

/// `[storage]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Root of the local model store.
    pub root: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self { root: PathBuf::from(".kiln/models") }
    }
}

/// `[runtime]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    /// Per-job working directories (checkpoints, outputs).
    pub work_dir: PathBuf,
    /// Where pretrained weights are looked up by name.
    pub pretrained_dir: Option<PathBuf>,
    /// Job snapshots for restart recovery; disabled when unset.
    pub journal_dir: Option<PathBuf>,
    /// JSONL metrics log; disabled when unset.
    pub metrics_file: Option<PathBuf>,
    /// Default checkpoint interval in iterations.
    pub checkpoint_every: u64,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(".kiln/work"),
            pretrained_dir: None,
            journal_dir: None,
            metrics_file: None,
            checkpoint_every: 1,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub scheduler: SchedulerSection,
    pub dispatcher: DispatcherSection,
    pub storage: StorageSection,
    pub runtime: RuntimeSection,
    pub logging: LoggingSection,
    /// The device pool. A single CPU device unless configured.
    pub devices: Vec<DeviceConfig>,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerSection::default(),
            dispatcher: DispatcherSection::default(),
            storage: StorageSection::default(),
            runtime: RuntimeSection::default(),
            logging: LoggingSection::default(),
            devices: default_devices(),
        }
    }
}

impl KilnConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads defaults, the optional TOML file and environment overrides, then validates.
    ///
    /// # Arguments
    /// * `path` - Config file; must exist when given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Like [`KilnConfig::load`], reading overrides from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.display().to_string()));
            }
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Writes the configuration as TOML, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Parse(format!("Failed to serialize: {}", e)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Io(format!("{}: {}", parent.display(), e)))?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))
    }

    /// Checks limits and the device pool.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.scheduler.global_limit == 0 {
            return invalid("scheduler.global_limit must be >= 1".to_string());
        }
        if self.scheduler.per_user_limit == 0 {
            return invalid("scheduler.per_user_limit must be >= 1".to_string());
        }
        if self.dispatcher.buffer_capacity == 0 {
            return invalid("dispatcher.buffer_capacity must be >= 1".to_string());
        }
        if self.runtime.checkpoint_every == 0 {
            return invalid("runtime.checkpoint_every must be >= 1".to_string());
        }
        if self.devices.is_empty() {
            return invalid("at least one device must be configured".to_string());
        }
        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return invalid("device id must not be empty".to_string());
            }
            if !seen.insert(device.id.as_str()) {
                return invalid(format!("duplicate device id '{}'", device.id));
            }
        }
        Ok(())
    }

    /// Scheduler settings derived from this configuration.
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            global_limit: self.scheduler.global_limit,
            per_user_limit: self.scheduler.per_user_limit,
            max_duration: self.scheduler.max_duration_secs.map(Duration::from_secs),
            buffer_capacity: self.dispatcher.buffer_capacity,
            checkpoint_every: self.runtime.checkpoint_every,
            work_dir: self.runtime.work_dir.clone(),
            pretrained_dir: self.runtime.pretrained_dir.clone(),
        }
    }

    #[must_use]
    pub fn device_pool(&self) -> Vec<Device> {
        self.devices.iter().map(Device::from).collect()
    }
}
