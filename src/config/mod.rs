//! Agent configuration loading, validation, and management.
//!
//! This module provides the top-level `Config` structure that aggregates
//! logging settings and the list of MQTT clients the agent runs. It handles
//! loading from TOML files and validation.
//!
//! The configuration is loaded early in the application lifecycle and is
//! intended to remain immutable thereafter.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use mqttlink_session::{Config as SessionConfig, QoS};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::config::logger::LoggerConfig;

pub mod logger;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "MQTTLINK_CONFIG";

/// Used when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mqttlink/config.toml";

/// Current UTC time for the pre-subscriber print macros.
pub fn timestamp() -> String {
    let format = time::macros::format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_default()
}

/// Simple macros for printing timestamped messages before the tracing subscriber
/// is initialized. These are used during early configuration loading.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Errors that can occur during configuration loading, parsing or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Generic configuration-related error with a descriptive message.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error while accessing configuration files.
    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    /// Failure to parse the TOML configuration file.
    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    /// Validation failure after successful parsing.
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Topic subscribed right after a client is created.
#[derive(Serialize, Deserialize, Debug, Validate, Clone)]
pub struct TopicSubscription {
    /// Subscriber id reported with every event of this subscription.
    /// Defaults to the topic filter.
    #[serde(default)]
    pub id: Option<String>,

    #[validate(length(min = 1, message = "Topic filter must not be empty"))]
    pub topic: String,

    #[serde(default)]
    pub qos: QoS,
}

impl TopicSubscription {
    pub fn subscriber_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.topic)
    }
}

/// One MQTT client run by the agent.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
pub struct ClientEntry {
    /// Session settings (flattened for ergonomic TOML usage).
    #[serde(flatten)]
    #[validate(nested)]
    pub session: SessionConfig,

    #[serde(default)]
    #[validate(nested)]
    pub subscriptions: Vec<TopicSubscription>,
}

/// Top-level agent configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Logging subsystem configuration.
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Clients to create on startup.
    #[validate(nested, custom(function = "validate_unique_clients"))]
    pub clients: Vec<ClientEntry>,
}

/// Rejects two clients sharing an explicit client id.
fn validate_unique_clients(clients: &[ClientEntry]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for client in clients {
        let id = client.session.client_id.trim();
        if !id.is_empty() && !seen.insert(id) {
            let mut err = ValidationError::new("duplicate_client_id");
            err.message = Some(format!("Duplicate client id: {}", id).into());
            return Err(err);
        }
    }
    Ok(())
}

impl Config {
    /// Constructs a new configuration by locating and loading the config file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the configuration file cannot be found,
    /// read, parsed, or validated.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// Determines the configuration file path.
    ///
    /// Priority:
    /// 1. `MQTTLINK_CONFIG` environment variable
    /// 2. `/etc/mqttlink/config.toml`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Config` if no suitable file is found.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(
            "No configuration file found.".to_string(),
        ))
    }

    /// Loads and validates configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Propagates IO, parsing, and validation errors as `ConfigError`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(path.to_string_lossy().to_string()));
        }

        let config_str = fs::read_to_string(path)?;
        let config = Self::parse(&config_str)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn parse(content: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(config)
    }
}
