// src/config.rs
use log::debug;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::data::Temporality;
use crate::error::{MetricsError, Result};
use crate::retry::RetryConfig;
use crate::storage::DEFAULT_CARDINALITY_LIMIT;

/// Prefix of environment overrides, e.g. `METERLINE__LOG_LEVEL=debug`
pub const ENV_PREFIX: &str = "METERLINE";

/// One layer of configuration
#[derive(Debug, Clone)]
enum Layer {
    File(PathBuf),
    Environment(String),
    Toml(String),
}

/// Layers configuration sources into an [`SdkConfig`]. Later layers
/// override earlier ones; anything left unset keeps its default.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    layers: Vec<Layer>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a TOML file, which must exist
    pub fn add_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.layers.push(Layer::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add environment variables under `prefix`, nested keys split on `__`
    pub fn add_env(mut self, prefix: impl Into<String>) -> Self {
        self.layers.push(Layer::Environment(prefix.into()));
        self
    }

    pub fn add_toml(mut self, toml: impl Into<String>) -> Self {
        self.layers.push(Layer::Toml(toml.into()));
        self
    }

    /// Merge every layer, deserialize and validate
    pub fn build(self) -> Result<SdkConfig> {
        let mut builder = config::Config::builder();

        for layer in self.layers {
            builder = match layer {
                Layer::File(path) => {
                    debug!("Loading configuration from {}", path.display());
                    builder.add_source(
                        config::File::from(path.as_path())
                            .format(config::FileFormat::Toml)
                            .required(true),
                    )
                }
                Layer::Environment(prefix) => builder.add_source(
                    config::Environment::with_prefix(&prefix)
                        .separator("__")
                        .try_parsing(true),
                ),
                Layer::Toml(toml) => {
                    builder.add_source(config::File::from_str(&toml, config::FileFormat::Toml))
                }
            };
        }

        let config: SdkConfig = builder
            .build()
            .and_then(|merged| merged.try_deserialize())
            .map_err(|e| MetricsError::Config(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        debug!("Configuration loaded with {} readers", config.readers.len());
        Ok(config)
    }
}

/// Logging level
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Top-level SDK configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SdkConfig {
    #[serde(default)]
    pub log_level: LogLevel,
    /// Value of the `service.name` resource attribute
    #[serde(default)]
    pub service_name: Option<String>,
    /// Extra resource attributes, added after the defaults
    #[serde(default)]
    pub resource_attributes: BTreeMap<String, String>,
    /// One periodic reader per entry
    #[serde(default)]
    pub readers: Vec<ReaderConfig>,
}

impl SdkConfig {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Load a TOML file with `METERLINE__*` environment overrides on top
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        ConfigBuilder::new().add_file(path).add_env(ENV_PREFIX).build()
    }

    /// Load from `METERLINE__*` environment variables and defaults only
    pub fn from_env() -> Result<Self> {
        ConfigBuilder::new().add_env(ENV_PREFIX).build()
    }

    /// Reject values a reader or exporter cannot run with
    pub fn validate(&self) -> Result<()> {
        for (index, reader) in self.readers.iter().enumerate() {
            let invalid = |field: &str| -> Result<()> {
                Err(MetricsError::Config(format!(
                    "readers[{}].{} must be greater than zero",
                    index, field
                )))
            };
            if reader.interval_ms == 0 {
                return invalid("interval_ms");
            }
            if reader.timeout_ms == 0 {
                return invalid("timeout_ms");
            }
            if reader.cardinality_limit == 0 {
                return invalid("cardinality_limit");
            }
            if reader.exporter.timeout_ms == 0 {
                return invalid("exporter.timeout_ms");
            }
            if reader.exporter.kind.trim().is_empty() {
                return Err(MetricsError::Config(format!(
                    "readers[{}].exporter.kind must name a registered exporter",
                    index
                )));
            }
        }
        Ok(())
    }
}

/// A periodic reader and the exporter it pushes to
#[derive(Debug, Deserialize, Clone)]
pub struct ReaderConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Upper bound on one collect-and-export cycle
    #[serde(default = "default_reader_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub temporality: Temporality,
    #[serde(default = "default_cardinality_limit")]
    pub cardinality_limit: usize,
    #[serde(default)]
    pub exporter: ExporterConfig,
}

fn default_interval_ms() -> u64 {
    60_000
}

fn default_reader_timeout_ms() -> u64 {
    30_000
}

fn default_cardinality_limit() -> usize {
    DEFAULT_CARDINALITY_LIMIT
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            timeout_ms: default_reader_timeout_ms(),
            temporality: Temporality::default(),
            cardinality_limit: default_cardinality_limit(),
            exporter: ExporterConfig::default(),
        }
    }
}

impl ReaderConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Exporter selection, resolved through the exporter registry
#[derive(Debug, Deserialize, Clone)]
pub struct ExporterConfig {
    /// Registered factory name
    #[serde(default = "default_exporter_kind")]
    pub kind: String,
    /// Collector address, for exporters that need one
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Deadline for one export call, retries included
    #[serde(default = "default_exporter_timeout_ms")]
    pub timeout_ms: u64,
    /// Attempts per export call for transient failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

fn default_exporter_kind() -> String {
    "logging".to_string()
}

fn default_exporter_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> usize {
    1
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            kind: default_exporter_kind(),
            endpoint: None,
            timeout_ms: default_exporter_timeout_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ExporterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::no_retry().with_max_attempts(self.max_attempts.max(1))
    }
}
