//! Configuration structures for DuraMQ

use crate::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default port the broker listens on
pub const DEFAULT_PORT: u16 = 2011;

/// Default upper bound for a single wire frame (8 MiB)
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Prefix for environment overrides, e.g. `DURAMQ__SERVER__PORT=4000`
const ENV_PREFIX: &str = "DURAMQ";

/// Broker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listener settings
    pub server: ServerSettings,
    /// Queue storage settings
    pub storage: StorageSettings,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind the listening socket to
    pub bind_address: String,
    /// TCP port for incoming client connections (0 picks an ephemeral port)
    pub port: u16,
    /// Largest accepted request frame in bytes
    pub max_frame_length: usize,
    /// Close connections idle for this many seconds (0 disables)
    pub idle_timeout_secs: u64,
}

/// Queue storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory holding one log file and one checkpoint file per destination
    pub directory: PathBuf,
    /// fsync log and checkpoint records after every write
    pub sync_on_write: bool,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker host address
    pub address: String,
    /// Broker port
    pub port: u16,
    /// Connect and request timeout in seconds
    pub timeout_seconds: u64,
    /// Largest accepted reply frame in bytes
    pub max_frame_length: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            idle_timeout_secs: 300,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./data"),
            sync_on_write: true,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            timeout_seconds: 5,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl BrokerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BrokerError::Config(format!("Failed to read config file: {}", e)))?;

        let config: BrokerConfig = toml::from_str(&content)
            .map_err(|e| BrokerError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Layer defaults, an optional TOML file and `DURAMQ__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: BrokerConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| BrokerError::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.bind_address.is_empty() {
            return Err(BrokerError::Config("Bind address cannot be empty".to_string()));
        }
        if self.server.max_frame_length == 0 {
            return Err(BrokerError::Config("Max frame length must be positive".to_string()));
        }
        if self.storage.directory.as_os_str().is_empty() {
            return Err(BrokerError::Config("Storage directory cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Socket address string the listener binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.bind_address, self.server.port)
    }
}

impl ClientConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(BrokerError::Config("Broker address cannot be empty".to_string()));
        }
        if self.port == 0 {
            return Err(BrokerError::Config("Broker port cannot be 0".to_string()));
        }
        if self.timeout_seconds == 0 {
            return Err(BrokerError::Config("Timeout must be at least one second".to_string()));
        }
        if self.max_frame_length == 0 {
            return Err(BrokerError::Config("Max frame length must be positive".to_string()));
        }
        Ok(())
    }
}
