//! Configuration loading and validation for the socket-transfer binary.

use crate::options::{Heartbeat, TransferOptions, DEFAULT_PORT};
use balance::{Strategy, Target};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSettings,

    /// Initial target set. May be empty; the relay then refuses connections
    /// until targets are pushed.
    #[serde(default)]
    pub targets: Vec<Target>,

    #[serde(default)]
    pub heartbeat: Heartbeat,

    #[serde(default)]
    pub probe: ProbeSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.probe.validate()?;
        self.heartbeat
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

/// Listener and dialing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// TCP listen port.
    pub port: u16,

    /// TCP bind address.
    pub address: IpAddr,

    /// Outbound-dial host for target connections.
    pub bind: IpAddr,

    /// Balancing strategy.
    pub strategy: Strategy,
}

/// Handshake probe settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProbeSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_probe_timeout")]
    pub timeout: Duration,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            address: IpAddr::from([127, 0, 0, 1]),
            bind: IpAddr::from([0, 0, 0, 0]),
            strategy: Strategy::default(),
        }
    }
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
        }
    }
}

fn validate_probe_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    let millis = timeout.as_millis();
    if !(100..=10_000).contains(&millis) {
        return Err(ValidationError::new("probe_timeout_out_of_range"));
    }
    Ok(())
}

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/socket-transfer/transfer.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./transfer.yaml"));

        paths
            .into_iter()
            .find(|p: &PathBuf| p.exists() && p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/socket-transfer/transfer.yaml"))
    }

    /// Convert to the supervisor's construction options
    pub fn to_options(&self) -> TransferOptions {
        TransferOptions {
            port: self.server.port,
            address: self.server.address,
            bind: self.server.bind,
            strategy: self.server.strategy,
            targets: self.targets.clone(),
            heartbeat: self.heartbeat.clone(),
        }
    }

    /// Per-probe deadline for the handshake checker
    pub fn probe_timeout(&self) -> Duration {
        self.probe.timeout
    }
}
