//! Configuration management for datamove
//!
//! This module handles loading, parsing, and managing configuration:
//! - Configuration file (TOML format)
//! - Command-line overrides applied by the CLI layer
//!
//! Configuration precedence (highest to lowest):
//! 1. Command-line arguments
//! 2. Configuration file
//! 3. Default values
//!
//! The engine-selection cost constants are hand-tuned and kept here so they
//! can be adjusted per installation without touching the selector.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::endpoint::EndpointKind;
use crate::error::{ConfigError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Query building limits
    #[serde(default)]
    pub query: QueryConfig,

    /// Engine selector cost constants
    #[serde(default)]
    pub engine: EngineConfig,

    /// Bulk job polling
    #[serde(default)]
    pub polling: PollingConfig,

    /// Streamed transfer settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Working directories
    #[serde(default)]
    pub paths: PathsConfig,

    /// Named endpoints
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// Enable timestamps in logs
    #[serde(default = "default_log_timestamps")]
    pub timestamps: bool,
}

/// Log level options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Query building configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Maximum length of a single generated WHERE clause
    #[serde(default = "default_max_where_clause_length")]
    pub max_where_clause_length: usize,

    /// Maximum length of a complete composed query
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,

    /// Retry rounds when querying child objects (multi-level hierarchies)
    #[serde(default = "default_child_query_rounds")]
    pub child_query_rounds: usize,

    /// Separator between the parts of a composite external ID
    #[serde(default = "default_composite_id_delimiter")]
    pub composite_id_delimiter: String,
}

/// Cost constants for the engine selector.
///
/// Costs are in arbitrary units; only their ratios matter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fixed cost of one row-limited query call
    #[serde(default = "default_rest_query_call_cost")]
    pub rest_query_call_cost: f64,

    /// Marginal cost per record fetched through the row-limited transport
    #[serde(default = "default_rest_query_record_cost")]
    pub rest_query_record_cost: f64,

    /// Records returned per row-limited query call
    #[serde(default = "default_rest_query_page_size")]
    pub rest_query_page_size: u64,

    /// Fixed cost of one bulk query job
    #[serde(default = "default_bulk_query_call_cost")]
    pub bulk_query_call_cost: f64,

    /// Marginal cost per record fetched through the bulk transport
    #[serde(default = "default_bulk_query_record_cost")]
    pub bulk_query_record_cost: f64,

    /// Penalty for querying a whole entity, scaled by the irrelevant fraction
    #[serde(default = "default_irrelevant_records_penalty")]
    pub irrelevant_records_penalty: f64,

    /// Fixed cost of one row-limited update call
    #[serde(default = "default_rest_update_call_cost")]
    pub rest_update_call_cost: f64,

    /// Marginal cost per record written through the row-limited transport
    #[serde(default = "default_rest_update_record_cost")]
    pub rest_update_record_cost: f64,

    /// Records per row-limited update call
    #[serde(default = "default_rest_update_batch_size")]
    pub rest_update_batch_size: u64,

    /// Fixed cost of one bulk ingest job
    #[serde(default = "default_bulk_update_call_cost")]
    pub bulk_update_call_cost: f64,

    /// Marginal cost per record written through the bulk transport
    #[serde(default = "default_bulk_update_record_cost")]
    pub bulk_update_record_cost: f64,

    /// Records per bulk ingest job
    #[serde(default = "default_bulk_update_batch_size")]
    pub bulk_update_batch_size: u64,
}

/// Bulk job polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Poll interval for small jobs, in milliseconds
    #[serde(default = "default_base_interval_ms")]
    pub base_interval_ms: u64,

    /// Upper bound for the scaled poll interval, in milliseconds
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Timeout for small jobs, in milliseconds
    #[serde(default = "default_base_timeout_ms")]
    pub base_timeout_ms: u64,

    /// Records per scaling step
    #[serde(default = "default_scale_factor")]
    pub scale_factor: u64,
}

/// Streamed transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Batches buffered between the record source and the CSV sink
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Progress callback period, in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

/// Working directory configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of staged CSV files (defaults to `<script dir>/.datamove`)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// Named endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Endpoint kind
    pub kind: EndpointConfigKind,

    /// Directory for flat-file endpoints
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Supported configured endpoint kinds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EndpointConfigKind {
    Csv,
}

impl EndpointConfigKind {
    /// Kind of the endpoint this entry opens
    pub fn endpoint_kind(&self) -> EndpointKind {
        match self {
            EndpointConfigKind::Csv => EndpointKind::File,
        }
    }
}

// Default value functions
fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_timestamps() -> bool {
    true
}

fn default_max_where_clause_length() -> usize {
    4000
}

fn default_max_query_length() -> usize {
    100_000
}

fn default_child_query_rounds() -> usize {
    3
}

fn default_composite_id_delimiter() -> String {
    ";".to_string()
}

fn default_rest_query_call_cost() -> f64 {
    1.0
}

fn default_rest_query_record_cost() -> f64 {
    0.0005
}

fn default_rest_query_page_size() -> u64 {
    2000
}

fn default_bulk_query_call_cost() -> f64 {
    12.0
}

fn default_bulk_query_record_cost() -> f64 {
    0.0001
}

fn default_irrelevant_records_penalty() -> f64 {
    4.0
}

fn default_rest_update_call_cost() -> f64 {
    1.0
}

fn default_rest_update_record_cost() -> f64 {
    0.004
}

fn default_rest_update_batch_size() -> u64 {
    200
}

fn default_bulk_update_call_cost() -> f64 {
    20.0
}

fn default_bulk_update_record_cost() -> f64 {
    0.0008
}

fn default_bulk_update_batch_size() -> u64 {
    10_000
}

fn default_base_interval_ms() -> u64 {
    5000
}

fn default_max_interval_ms() -> u64 {
    60_000
}

fn default_base_timeout_ms() -> u64 {
    600_000
}

fn default_scale_factor() -> u64 {
    50_000
}

fn default_channel_capacity() -> usize {
    4
}

fn default_progress_interval_ms() -> u64 {
    1000
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            timestamps: default_log_timestamps(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_where_clause_length: default_max_where_clause_length(),
            max_query_length: default_max_query_length(),
            child_query_rounds: default_child_query_rounds(),
            composite_id_delimiter: default_composite_id_delimiter(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rest_query_call_cost: default_rest_query_call_cost(),
            rest_query_record_cost: default_rest_query_record_cost(),
            rest_query_page_size: default_rest_query_page_size(),
            bulk_query_call_cost: default_bulk_query_call_cost(),
            bulk_query_record_cost: default_bulk_query_record_cost(),
            irrelevant_records_penalty: default_irrelevant_records_penalty(),
            rest_update_call_cost: default_rest_update_call_cost(),
            rest_update_record_cost: default_rest_update_record_cost(),
            rest_update_batch_size: default_rest_update_batch_size(),
            bulk_update_call_cost: default_bulk_update_call_cost(),
            bulk_update_record_cost: default_bulk_update_record_cost(),
            bulk_update_batch_size: default_bulk_update_batch_size(),
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: default_base_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            base_timeout_ms: default_base_timeout_ms(),
            scale_factor: default_scale_factor(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a file, falling back to defaults
    ///
    /// An explicitly given path must exist; the default path is optional.
    ///
    /// # Arguments
    /// * `path` - Optional path to the configuration file (TOML format)
    ///
    /// # Returns
    /// * `Result<Config>` - Loaded configuration or error
    pub fn load_from_file(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_path(), false),
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigError::FileNotFound(path.display().to_string()).into());
            }
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// # Returns
    /// * `PathBuf` - Path to default configuration file
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".datamove")
            .join("config.toml")
    }

    /// Validate the configuration
    ///
    /// # Returns
    /// * `Result<()>` - Ok if valid, error otherwise
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("query.max_where_clause_length", self.query.max_where_clause_length as u64),
            ("query.max_query_length", self.query.max_query_length as u64),
            ("engine.rest_query_page_size", self.engine.rest_query_page_size),
            ("engine.rest_update_batch_size", self.engine.rest_update_batch_size),
            ("engine.bulk_update_batch_size", self.engine.bulk_update_batch_size),
            ("polling.base_interval_ms", self.polling.base_interval_ms),
            ("polling.scale_factor", self.polling.scale_factor),
            ("transfer.channel_capacity", self.transfer.channel_capacity as u64),
            ("transfer.progress_interval_ms", self.transfer.progress_interval_ms),
        ];

        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                }
                .into());
            }
        }

        if self.query.composite_id_delimiter.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "query.composite_id_delimiter".to_string(),
                value: String::new(),
            }
            .into());
        }

        for (name, endpoint) in &self.endpoints {
            if endpoint.kind == EndpointConfigKind::Csv && endpoint.directory.is_none() {
                return Err(ConfigError::MissingField(format!("endpoints.{name}.directory")).into());
            }
        }

        Ok(())
    }

    /// Progress callback period as Duration
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.transfer.progress_interval_ms)
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.query.max_where_clause_length, 4000);
        assert_eq!(config.query.composite_id_delimiter, ";");
        assert_eq!(config.logging.level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [query]
            max_where_clause_length = 1000

            [engine]
            bulk_query_call_cost = 50.0

            [endpoints.archive]
            kind = "csv"
            directory = "/tmp/archive"
            "#,
        )
        .unwrap();

        assert_eq!(config.query.max_where_clause_length, 1000);
        assert_eq!(config.query.max_query_length, 100_000);
        assert_eq!(config.engine.bulk_query_call_cost, 50.0);
        assert_eq!(config.engine.rest_query_page_size, 2000);
        assert_eq!(
            config.endpoints["archive"].directory,
            Some(PathBuf::from("/tmp/archive"))
        );
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::default();
        config.polling.base_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = Config::load_from_file(Some(Path::new("/definitely/not/here.toml")));
        assert!(result.is_err());
    }
}
