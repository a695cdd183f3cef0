//! Configuration management for jmx-collector
//!
//! Handles loading and validating the `init_config` / `instances` YAML layout.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::error::FilterError;
use crate::filter::Configuration;

const DEFAULT_METRICS: &str = include_str!("default_metrics.yaml");

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error reading the configuration file
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Error parsing the configuration file
    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// A filter of some instance does not compile
    #[error("Invalid filter in instance '{instance}': {source}")]
    InvalidFilter {
        instance: String,
        #[source]
        source: FilterError,
    },

    /// Configuration validation error
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Settings shared by every instance
    #[serde(default)]
    pub init_config: InitConfig,

    /// Monitored JMX endpoints
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,

    /// Metric sink
    #[serde(default)]
    pub reporter: ReporterConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Shared scheduling and matching knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitConfig {
    #[serde(default = "default_true")]
    pub is_jmx: bool,

    /// Append the built-in JVM metric configurations
    #[serde(default = "default_true")]
    pub collect_default_metrics: bool,

    /// Bean refresh period in seconds; `null` disables periodic refresh
    #[serde(default = "default_refresh_beans")]
    pub refresh_beans: Option<u64>,

    /// Refresh period used until the first refresh after initialisation
    #[serde(default)]
    pub refresh_beans_initial: Option<u64>,

    /// Minimum seconds between two collections of one instance
    #[serde(default)]
    pub min_collection_interval: Option<u64>,

    #[serde(default = "default_max_returned_metrics")]
    pub max_returned_metrics: usize,

    /// Collection batch deadline in seconds
    #[serde(default = "default_collection_timeout")]
    pub collection_timeout: u64,

    #[serde(default = "default_pool_size")]
    pub collection_pool_size: usize,

    #[serde(default = "default_pool_size")]
    pub recovery_pool_size: usize,

    /// Recovery batch deadline in seconds
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: u64,

    /// Milliseconds between iterations
    #[serde(default = "default_check_period")]
    pub check_period: u64,

    /// Configurations shared by every instance, after the instance's own
    #[serde(default)]
    pub conf: Vec<Configuration>,
}

/// One monitored endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub name: String,

    /// Jolokia endpoint URL
    #[serde(default = "default_jolokia_url")]
    pub url: String,

    /// Check family used for service checks
    #[serde(default = "default_check_name")]
    pub check_name: String,

    /// Extra tags, either `["k:v"]` or `{k: v}`
    #[serde(default, deserialize_with = "tag_list")]
    pub tags: Vec<String>,

    #[serde(default)]
    pub cassandra_aliasing: bool,

    /// Prefix applied to configurations that do not set their own
    #[serde(default)]
    pub metric_prefix: Option<String>,

    /// Detect WebSphere PMI statistics objects on unknown attribute types
    #[serde(default)]
    pub websphere_stats: bool,

    /// Request timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub refresh_beans: Option<u64>,

    #[serde(default)]
    pub refresh_beans_initial: Option<u64>,

    #[serde(default)]
    pub min_collection_interval: Option<u64>,

    #[serde(default)]
    pub max_returned_metrics: Option<usize>,

    #[serde(default)]
    pub conf: Vec<Configuration>,
}

/// Per-instance knobs after applying instance overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSettings {
    pub refresh_period: Option<Duration>,
    pub initial_refresh_period: Option<Duration>,
    pub min_collection_period: Option<Duration>,
    pub max_returned_metrics: usize,
}

/// Metric sink selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReporterConfig {
    /// Log every point
    #[default]
    Console,
    /// Serve the latest points on the metrics path
    Prometheus,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Serve `/health` and the metrics path
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Metrics endpoint path
    #[serde(default = "default_metrics_path")]
    pub path: String,

    /// Server bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TagSpec {
    List(Vec<String>),
    Map(BTreeMap<String, serde_yaml::Value>),
}

fn tag_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match Option::<TagSpec>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(TagSpec::List(tags)) => tags,
        Some(TagSpec::Map(tags)) => tags
            .into_iter()
            .map(|(key, value)| match value {
                serde_yaml::Value::String(s) => format!("{}:{}", key, s),
                serde_yaml::Value::Number(n) => format!("{}:{}", key, n),
                serde_yaml::Value::Bool(b) => format!("{}:{}", key, b),
                _ => key,
            })
            .collect(),
    })
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_refresh_beans() -> Option<u64> {
    Some(600)
}

fn default_max_returned_metrics() -> usize {
    350
}

fn default_collection_timeout() -> u64 {
    60
}

fn default_pool_size() -> usize {
    3
}

fn default_recovery_timeout() -> u64 {
    10
}

fn default_check_period() -> u64 {
    15000
}

fn default_jolokia_url() -> String {
    "http://localhost:8778/jolokia".to_string()
}

fn default_check_name() -> String {
    "jmx".to_string()
}

fn default_timeout() -> u64 {
    5000
}

fn default_port() -> u16 {
    9090
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            is_jmx: true,
            collect_default_metrics: true,
            refresh_beans: default_refresh_beans(),
            refresh_beans_initial: None,
            min_collection_interval: None,
            max_returned_metrics: default_max_returned_metrics(),
            collection_timeout: default_collection_timeout(),
            collection_pool_size: default_pool_size(),
            recovery_pool_size: default_pool_size(),
            recovery_timeout: default_recovery_timeout(),
            check_period: default_check_period(),
            conf: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_port(),
            path: default_metrics_path(),
            bind_address: default_bind_address(),
        }
    }
}

impl InstanceConfig {
    /// Instance with defaults for everything but name and URL
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            check_name: default_check_name(),
            tags: Vec::new(),
            cassandra_aliasing: false,
            metric_prefix: None,
            websphere_stats: false,
            request_timeout_ms: default_timeout(),
            refresh_beans: None,
            refresh_beans_initial: None,
            min_collection_interval: None,
            max_returned_metrics: None,
            conf: Vec::new(),
        }
    }
}

impl InitConfig {
    pub fn collection_timeout(&self) -> Duration {
        Duration::from_secs(self.collection_timeout)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout)
    }

    pub fn check_period(&self) -> Duration {
        Duration::from_millis(self.check_period)
    }
}

/// Built-in JVM metric configurations
pub fn default_configurations() -> Result<Vec<Configuration>, ConfigError> {
    Ok(serde_yaml::from_str(DEFAULT_METRICS)?)
}

impl AppConfig {
    /// Load configuration from a YAML file
    ///
    /// # Arguments
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated
    ///
    /// # Note
    /// - If the file doesn't exist, returns `ConfigError::ReadError`
    /// - Use `AppConfig::load_or_default()` if you want fallback to defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, falling back to defaults if not found
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        Self::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let init = &self.init_config;
        let positive = [
            ("collection_pool_size", init.collection_pool_size as u64),
            ("recovery_pool_size", init.recovery_pool_size as u64),
            ("collection_timeout", init.collection_timeout),
            ("recovery_timeout", init.recovery_timeout),
            ("check_period", init.check_period),
            ("max_returned_metrics", init.max_returned_metrics as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ValidationError(format!(
                "{} must be greater than 0",
                name
            )));
        }

        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "Server port must be greater than 0".to_string(),
            ));
        }

        if !self.server.path.starts_with('/') {
            return Err(ConfigError::ValidationError(
                "Metrics path must start with '/'".to_string(),
            ));
        }

        for conf in &init.conf {
            conf.compile().map_err(|source| ConfigError::InvalidFilter {
                instance: "init_config".to_string(),
                source,
            })?;
        }

        let mut names = HashSet::new();
        for instance in &self.instances {
            if instance.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "Instance name must not be empty".to_string(),
                ));
            }
            if !names.insert(instance.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate instance name '{}'",
                    instance.name
                )));
            }
            url::Url::parse(&instance.url).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "Instance '{}' has an invalid url: {}",
                    instance.name, e
                ))
            })?;
            for conf in &instance.conf {
                conf.compile().map_err(|source| ConfigError::InvalidFilter {
                    instance: instance.name.clone(),
                    source,
                })?;
            }
        }

        Ok(())
    }

    /// Knobs of one instance, instance values overriding `init_config`
    pub fn instance_settings(&self, instance: &InstanceConfig) -> InstanceSettings {
        let init = &self.init_config;
        let secs = |value: Option<u64>| value.map(Duration::from_secs);
        InstanceSettings {
            refresh_period: secs(instance.refresh_beans.or(init.refresh_beans)),
            initial_refresh_period: secs(
                instance.refresh_beans_initial.or(init.refresh_beans_initial),
            ),
            min_collection_period: secs(
                instance
                    .min_collection_interval
                    .or(init.min_collection_interval),
            )
            .filter(|period| !period.is_zero()),
            max_returned_metrics: instance
                .max_returned_metrics
                .unwrap_or(init.max_returned_metrics),
        }
    }

    /// Ordered configurations of one instance: its own, the shared ones, then
    /// the built-in defaults
    pub fn configurations(&self, instance: &InstanceConfig) -> Result<Vec<Configuration>, ConfigError> {
        let mut configurations: Vec<Configuration> = instance
            .conf
            .iter()
            .chain(&self.init_config.conf)
            .cloned()
            .collect();
        if self.init_config.collect_default_metrics {
            configurations.extend(default_configurations()?);
        }
        if let Some(prefix) = &instance.metric_prefix {
            for conf in configurations
                .iter_mut()
                .filter(|conf| conf.conf.metric_prefix.is_none())
            {
                conf.conf.metric_prefix = Some(prefix.clone());
            }
        }
        Ok(configurations)
    }
}
