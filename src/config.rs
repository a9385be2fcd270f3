//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub federation: FederationConfig,
    pub delivery: DeliveryConfig,
    pub keys: KeysConfig,
    pub logging: LoggingConfig,
}

/// Public identity of this deployment
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Public domain (e.g., "shelf.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the deployment root URL
    ///
    /// # Returns
    /// Full URL like "https://shelf.example.com"
    pub fn root_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Actor and envelope settings
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Path prefix for local actors (default: "/u")
    #[serde(default = "default_actor_path_prefix")]
    pub actor_path_prefix: String,
    /// Name advertised in `object.context` (default: "Shelfpost")
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            actor_path_prefix: default_actor_path_prefix(),
            instance_name: default_instance_name(),
        }
    }
}

fn default_actor_path_prefix() -> String {
    "/u".to_string()
}

fn default_instance_name() -> String {
    "Shelfpost".to_string()
}

/// Outbound delivery settings
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum in-flight deliveries per activity (default: 10)
    pub max_concurrent: usize,
    /// Per-attempt timeout in seconds (default: 10)
    pub timeout_seconds: u64,
    /// User-Agent sent to remote inboxes
    pub user_agent: String,
    /// Attach a transport-level HTTP Signature header (default: true)
    pub http_signatures: bool,
}

impl DeliveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            timeout_seconds: 10,
            user_agent: concat!("Shelfpost/", env!("CARGO_PKG_VERSION")).to_string(),
            http_signatures: true,
        }
    }
}

/// Signing key storage
#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    /// Directory holding `<username>.pem` private keys
    pub directory: PathBuf,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("keys"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (SHELFPOST__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let delivery = DeliveryConfig::default();
        let config = Config::builder()
            .set_default("server.protocol", "https")?
            .set_default("federation.actor_path_prefix", default_actor_path_prefix())?
            .set_default("federation.instance_name", default_instance_name())?
            .set_default("delivery.max_concurrent", delivery.max_concurrent as u64)?
            .set_default("delivery.timeout_seconds", delivery.timeout_seconds)?
            .set_default("delivery.user_agent", delivery.user_agent)?
            .set_default("delivery.http_signatures", delivery.http_signatures)?
            .set_default("keys.directory", "keys")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("SHELFPOST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: Self = config.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn root_url(&self) -> String {
        self.server.root_url()
    }

    /// Reject settings the outbox cannot run with.
    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.server.domain.trim().is_empty() {
            return Err(AppError::Configuration(
                "server.domain must not be empty".to_string(),
            ));
        }

        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(AppError::Configuration(format!(
                "server.protocol must be http or https, got {}",
                self.server.protocol
            )));
        }

        if self.delivery.max_concurrent == 0 {
            return Err(AppError::Configuration(
                "delivery.max_concurrent must be greater than 0".to_string(),
            ));
        }

        if self.delivery.timeout_seconds == 0 {
            return Err(AppError::Configuration(
                "delivery.timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if !self.federation.actor_path_prefix.starts_with('/') {
            return Err(AppError::Configuration(
                "federation.actor_path_prefix must start with '/'".to_string(),
            ));
        }

        Ok(())
    }
}
