//! Configuration management for evfetch
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use evfetch::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Timer ceiling: {:?}", config.engine.timer_ceiling());
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `EVFETCH__<section>__<key>`
//!
//! Examples:
//! - `EVFETCH__ENGINE__MAX_TIMER_DELAY_MS=250`
//! - `EVFETCH__ENGINE__TIMER_MODE=repeating`
//! - `EVFETCH__TRANSFER__MAX_BODY_BYTES=10MB`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/evfetch.toml`.
//! This can be overridden using the `EVFETCH_CONFIG` environment variable.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{Config, EngineConfig, TelemetryConfig, TransferConfig};
pub use sources::config_path;
pub use validation::{MAX_TIMER_CEILING_MS, ValidationError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Failed to render configuration: {0}")]
    RenderError(#[from] toml::ser::Error),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`EVFETCH__*`)
    /// 2. TOML file (default: `config/evfetch.toml`)
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file is malformed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Resolved configuration as a TOML document
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}
