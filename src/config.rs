//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub timeline: TimelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Federation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Maximum delivery attempts before a job is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    /// Base delay for exponential backoff, in seconds
    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: u64,
    /// Backoff cap, in seconds
    #[serde(default = "default_backoff_cap_seconds")]
    pub backoff_cap_seconds: u64,
    /// Per-request delivery timeout, in seconds
    #[serde(default = "default_delivery_timeout_seconds")]
    pub delivery_timeout_seconds: u64,
    /// Worker polling interval, in seconds
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// Delivery job time-to-live, in seconds
    #[serde(default = "default_job_ttl_seconds")]
    pub job_ttl_seconds: i64,
    /// Pull token lifetime, in seconds
    #[serde(default = "default_token_ttl_seconds")]
    pub token_ttl_seconds: i64,
    /// Nonce retention, in seconds
    #[serde(default = "default_nonce_ttl_seconds")]
    pub nonce_ttl_seconds: i64,
    /// Maximum viewers returned by the pull-audience computation
    #[serde(default = "default_pull_audience_cap")]
    pub pull_audience_cap: usize,
    /// Issuer public key cache TTL, in seconds
    #[serde(default = "default_key_cache_ttl_seconds")]
    pub key_cache_ttl_seconds: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_seconds: default_backoff_base_seconds(),
            backoff_cap_seconds: default_backoff_cap_seconds(),
            delivery_timeout_seconds: default_delivery_timeout_seconds(),
            poll_interval_seconds: default_poll_interval_seconds(),
            job_ttl_seconds: default_job_ttl_seconds(),
            token_ttl_seconds: default_token_ttl_seconds(),
            nonce_ttl_seconds: default_nonce_ttl_seconds(),
            pull_audience_cap: default_pull_audience_cap(),
            key_cache_ttl_seconds: default_key_cache_ttl_seconds(),
        }
    }
}

fn default_max_attempts() -> i64 {
    5
}

fn default_backoff_base_seconds() -> u64 {
    30
}

fn default_backoff_cap_seconds() -> u64 {
    3600
}

fn default_delivery_timeout_seconds() -> u64 {
    10
}

fn default_poll_interval_seconds() -> u64 {
    5
}

fn default_job_ttl_seconds() -> i64 {
    7 * 24 * 3600
}

fn default_token_ttl_seconds() -> i64 {
    60
}

fn default_nonce_ttl_seconds() -> i64 {
    300
}

fn default_pull_audience_cap() -> usize {
    500
}

fn default_key_cache_ttl_seconds() -> u64 {
    3600
}

/// Timeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TimelineConfig {
    /// Fan-out job max attempts
    #[serde(default = "default_fanout_max_attempts")]
    pub fanout_max_attempts: i64,
    /// Fan-out worker polling interval, in seconds
    #[serde(default = "default_fanout_poll_interval_seconds")]
    pub fanout_poll_interval_seconds: u64,
    /// Soft-deleted entry retention before the sweep hard-deletes, in seconds
    #[serde(default = "default_retention_seconds")]
    pub retention_seconds: i64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            fanout_max_attempts: default_fanout_max_attempts(),
            fanout_poll_interval_seconds: default_fanout_poll_interval_seconds(),
            retention_seconds: default_retention_seconds(),
        }
    }
}

fn default_fanout_max_attempts() -> i64 {
    5
}

fn default_fanout_poll_interval_seconds() -> u64 {
    2
}

fn default_retention_seconds() -> i64 {
    30 * 24 * 3600
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (LAGOON__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.domain", "localhost")?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/lagoon.db")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (LAGOON__*)
            .add_source(
                Environment::with_prefix("LAGOON")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: Self = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Validate cross-field constraints that serde defaults cannot express.
    fn validate(&self) -> Result<(), crate::error::AppError> {
        if self.server.protocol != "http" && self.server.protocol != "https" {
            return Err(crate::error::AppError::Config(format!(
                "server.protocol must be http or https, got {}",
                self.server.protocol
            )));
        }
        if self.federation.max_attempts < 1 {
            return Err(crate::error::AppError::Config(
                "federation.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.federation.backoff_base_seconds == 0 {
            return Err(crate::error::AppError::Config(
                "federation.backoff_base_seconds must be nonzero".to_string(),
            ));
        }
        if self.federation.backoff_cap_seconds < self.federation.backoff_base_seconds {
            return Err(crate::error::AppError::Config(
                "federation.backoff_cap_seconds must be >= backoff_base_seconds".to_string(),
            ));
        }
        if self.federation.token_ttl_seconds < 1 || self.federation.token_ttl_seconds > 60 {
            return Err(crate::error::AppError::Config(
                "federation.token_ttl_seconds must be within 1..=60".to_string(),
            ));
        }
        Ok(())
    }
}
