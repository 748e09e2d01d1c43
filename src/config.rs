//! Configuration module for telemetry-bridge.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::FEATURE_COUNT;
use crate::service::ModelSpec;
use crate::session::SessionConfig;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the bridge
#[derive(Parser, Debug)]
#[command(name = "telemetry-bridge")]
#[command(author = "telemetry-bridge authors")]
#[command(version = "0.1.0")]
#[command(about = "Relays edge telemetry to a model service and returns predictions", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrent device connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Name of the model on the model service
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Learning algorithm the model service should use
    #[arg(short = 'a', long)]
    pub algorithm: Option<String>,

    /// Number of features per sample
    #[arg(short = 'd', long)]
    pub dimension: Option<usize>,

    /// Index of the feature to predict
    #[arg(short = 'z', long)]
    pub index: Option<usize>,

    /// Base URL of the model service (e.g., http://127.0.0.1:5556)
    #[arg(short = 's', long)]
    pub service_url: Option<String>,

    /// Number of samples used for training
    #[arg(short = 'x', long)]
    pub train_samples: Option<u64>,

    /// Number of samples used for testing
    #[arg(short = 'y', long)]
    pub test_samples: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds in-flight connections get to finish after shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// Model registered on the model service
#[derive(Debug, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: String,
    pub algorithm: Option<String>,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    #[serde(default)]
    pub index: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model_name(),
            algorithm: None,
            dimension: default_dimension(),
            index: 0,
        }
    }
}

/// Model service endpoint
#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_url")]
    pub url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Training can be compute-bound, so it gets a longer deadline
    #[serde(default = "default_training_timeout")]
    pub training_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: default_service_url(),
            request_timeout_secs: default_request_timeout(),
            training_timeout_secs: default_training_timeout(),
        }
    }
}

/// Sample counts per session
#[derive(Debug, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_sample_count")]
    pub train_samples: u64,
    #[serde(default = "default_sample_count")]
    pub test_samples: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            train_samples: default_sample_count(),
            test_samples: default_sample_count(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_model_name() -> String {
    "model".to_string()
}

fn default_dimension() -> usize {
    FEATURE_COUNT
}

fn default_service_url() -> String {
    "http://127.0.0.1:5556".to_string()
}

fn default_request_timeout() -> u64 {
    5
}

fn default_training_timeout() -> u64 {
    60
}

fn default_sample_count() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_connections: usize,
    pub shutdown_grace: Duration,
    pub model: ModelSpec,
    pub service_url: String,
    pub request_timeout: Duration,
    pub training_timeout: Duration,
    pub train_samples: u64,
    pub test_samples: u64,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let algorithm = cli
            .algorithm
            .or(toml_config.model.algorithm)
            .ok_or(ConfigError::Missing("algorithm"))?;

        let config = Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            shutdown_grace: Duration::from_secs(toml_config.server.shutdown_grace_secs),
            model: ModelSpec {
                name: cli.name.unwrap_or(toml_config.model.name),
                algorithm,
                dimension: cli.dimension.unwrap_or(toml_config.model.dimension),
                index: cli.index.unwrap_or(toml_config.model.index),
            },
            service_url: cli.service_url.unwrap_or(toml_config.service.url),
            request_timeout: Duration::from_secs(toml_config.service.request_timeout_secs),
            training_timeout: Duration::from_secs(toml_config.service.training_timeout_secs),
            train_samples: cli
                .train_samples
                .unwrap_or(toml_config.session.train_samples),
            test_samples: cli
                .test_samples
                .unwrap_or(toml_config.session.test_samples),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.train_samples == 0 || self.test_samples == 0 {
            return Err(ConfigError::Invalid(
                "number of training and testing samples must be larger than 0".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be larger than 0".to_string(),
            ));
        }
        // Bounded by the permits a shutdown can reclaim in one acquire
        if self.max_connections > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_connections must be at most {}, got {}",
                u32::MAX,
                self.max_connections
            )));
        }
        if self.model.name.is_empty() || self.model.name.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "invalid model name '{}'",
                self.model.name
            )));
        }
        if self.model.algorithm.is_empty() {
            return Err(ConfigError::Missing("algorithm"));
        }
        // Devices always send the full feature set
        if self.model.dimension != FEATURE_COUNT {
            return Err(ConfigError::Invalid(format!(
                "model dimension must be {}, got {}",
                FEATURE_COUNT, self.model.dimension
            )));
        }
        if self.model.index >= self.model.dimension {
            return Err(ConfigError::Invalid(format!(
                "output index {} is out of range for dimension {}",
                self.model.index, self.model.dimension
            )));
        }
        if self.request_timeout.is_zero() || self.training_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "service timeouts must be larger than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            model_name: self.model.name.clone(),
            train_target: self.train_samples,
            test_target: self.test_samples,
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Missing(&'static str),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Missing(field) => write!(f, "Missing required setting: {}", field),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
