//! Configuration file support for volmgrd
//!
//! Loads and validates volmgrd configuration from TOML files.
//! Default location: /etc/volmgr/volmgrd.toml

use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use volmgr_common::channel::{QmpChannelConfig, DEFAULT_COMMAND_TIMEOUT};
use volmgr_common::image::DEFAULT_DISK_ROOT;
use volmgr_common::store::{DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT};
use volmgr_common::{CapacityLimits, OrchestratorSettings, RedisStoreConfig, StoreKeys};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/volmgr/volmgrd.toml";

/// Configuration file errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Replicated store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Redis host
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    /// Redis port
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Redis database number
    #[serde(default)]
    pub redis_db: u32,

    /// Prefix for every key volmgrd writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on each store call in milliseconds
    #[serde(default = "default_store_timeout")]
    pub timeout_ms: u64,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

/// Hypervisor control channel configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HypervisorConfig {
    /// Directory holding one `<host>.qmp` socket per VM
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Bound on each monitor command in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

/// Image storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the qcow2 images
    #[serde(default = "default_disk_root")]
    pub disk_root: PathBuf,
}

/// Capacity advertised on /capacity and enforced on create/resize
#[derive(Debug, Clone, Deserialize)]
pub struct CapacityConfig {
    #[serde(default = "default_available")]
    pub available: u64,

    #[serde(default = "default_maximum_volume_size")]
    pub maximum_volume_size: u64,

    #[serde(default = "default_minimum_volume_size")]
    pub minimum_volume_size: u64,
}

/// Complete volmgrd configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VolmgrConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub hypervisor: HypervisorConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub capacity: CapacityConfig,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_store_timeout() -> u64 {
    DEFAULT_STORE_TIMEOUT.as_millis() as u64
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/run/volmgr/qmp")
}

fn default_command_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT.as_millis() as u64
}

fn default_disk_root() -> PathBuf {
    PathBuf::from(DEFAULT_DISK_ROOT)
}

fn default_available() -> u64 {
    CapacityLimits::default().available
}

fn default_maximum_volume_size() -> u64 {
    CapacityLimits::default().maximum_volume_size
}

fn default_minimum_volume_size() -> u64 {
    CapacityLimits::default().minimum_volume_size
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            redis_db: 0,
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout(),
            connection_timeout_secs: default_connection_timeout(),
        }
    }
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            disk_root: default_disk_root(),
        }
    }
}

impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            available: default_available(),
            maximum_volume_size: default_maximum_volume_size(),
            minimum_volume_size: default_minimum_volume_size(),
        }
    }
}

impl VolmgrConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("listen '{}': {}", self.server.listen, e)))
    }

    /// Store call timeout as Duration
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store.timeout_ms)
    }

    /// Monitor command timeout as Duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.hypervisor.command_timeout_ms)
    }

    /// Redis connection settings
    pub fn redis_config(&self) -> RedisStoreConfig {
        let mut config = RedisStoreConfig::new(
            &self.store.redis_host,
            self.store.redis_port,
            self.store.redis_db,
        );
        config.connect_timeout = Duration::from_secs(self.store.connection_timeout_secs);
        config
    }

    /// QMP channel settings
    pub fn qmp_config(&self) -> QmpChannelConfig {
        let mut config = QmpChannelConfig::new(&self.hypervisor.socket_dir);
        config.timeout = self.command_timeout();
        config
    }

    /// Orchestrator store layout and timeouts
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            keys: StoreKeys::new(&self.store.key_prefix),
            store_timeout: self.store_timeout(),
            command_timeout: self.command_timeout(),
        }
    }

    /// Capacity limits for the image manager
    pub fn capacity_limits(&self) -> CapacityLimits {
        CapacityLimits {
            available: self.capacity.available,
            maximum_volume_size: self.capacity.maximum_volume_size,
            minimum_volume_size: self.capacity.minimum_volume_size,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.store.redis_port == 0 {
            return Err(ConfigError::Invalid("redis_port must be > 0".to_string()));
        }

        if self.store.key_prefix.is_empty() {
            return Err(ConfigError::Invalid("key_prefix must not be empty".to_string()));
        }

        if self.store.timeout_ms == 0 || self.hypervisor.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".to_string()));
        }

        let disk_root = self.storage.disk_root.to_string_lossy();
        if !self.storage.disk_root.is_absolute() {
            return Err(ConfigError::Invalid(format!(
                "disk_root '{}' must be absolute",
                disk_root
            )));
        }
        // The image path is embedded in a comma-separated drive option list.
        if disk_root.contains(',') {
            return Err(ConfigError::Invalid(format!(
                "disk_root '{}' must not contain ','",
                disk_root
            )));
        }

        let cap = &self.capacity;
        if cap.minimum_volume_size == 0 || cap.minimum_volume_size > cap.maximum_volume_size {
            return Err(ConfigError::Invalid(
                "capacity requires 0 < minimum_volume_size <= maximum_volume_size".to_string(),
            ));
        }

        Ok(())
    }
}
