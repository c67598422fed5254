//! Configuration management for the peer courier.
//!
//! TOML-based configuration with three layers: built-in defaults, an optional
//! configuration file, and `MESSENGER_*` environment overrides.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "messenger.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "MESSENGER";

/// Complete configuration for the courier
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Local account
    pub identity: IdentityConfig,
    /// Network configuration
    pub network: NetworkConfig,
    /// Envelope encryption
    pub crypto: CryptoConfig,
    /// File transfer tuning
    pub transfer: TransferConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Local account settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Stable account identifier; also the transport-routable peer id
    pub username: String,
    /// Human-readable name announced in handshakes
    pub display_name: String,
}

/// Network and connection lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the TCP transport listens on
    pub listen_address: SocketAddr,
    /// Static address book: peer id -> socket address
    pub peers: BTreeMap<String, SocketAddr>,
    /// Reconnect poll interval for peers of interest, in seconds
    pub reconnect_interval_secs: u64,
    /// Backoff before retrying a taken local identifier, in seconds
    pub identifier_retry_secs: u64,
    /// Maximum identifier registration retries (`None` = unbounded)
    pub identifier_retry_limit: Option<u32>,
    /// Dial timeout in seconds
    pub connect_timeout_secs: u64,
}

/// Envelope encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Pre-shared application passphrase for the compatibility key
    pub shared_passphrase: String,
    /// Fall back to the shared key when no per-pair key is available
    pub allow_shared_key: bool,
}

/// File transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Chunk size in bytes
    pub chunk_size: usize,
    /// Largest file accepted for sending or receiving, in bytes
    pub max_file_size: u64,
    /// Incomplete transfers older than this are evicted, in seconds
    pub transfer_timeout_secs: u64,
    /// How often the eviction sweep runs, in seconds
    pub sweep_interval_secs: u64,
    /// Incoming transfers one peer may have in flight at once
    pub max_transfers_per_peer: usize,
}

/// Storage and persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory for data storage
    pub data_dir: PathBuf,
    /// Directory for identity keys
    pub keys_dir: PathBuf,
    /// Directory for the key-value store and received files
    pub store_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        let username = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "user".to_string());
        Self {
            display_name: username.clone(),
            username,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], crate::defaults::DEFAULT_PORT)),
            peers: BTreeMap::new(),
            reconnect_interval_secs: crate::defaults::DEFAULT_RECONNECT_INTERVAL,
            identifier_retry_secs: crate::defaults::DEFAULT_IDENTIFIER_RETRY,
            identifier_retry_limit: None,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            shared_passphrase: "my-super-secret-demo-key".to_string(),
            allow_shared_key: true,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::transfer::DEFAULT_CHUNK_SIZE,
            max_file_size: 64 * 1024 * 1024,
            transfer_timeout_secs: 120,
            sweep_interval_secs: 10,
            max_transfers_per_peer: crate::transfer::DEFAULT_TRANSFERS_PER_PEER,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("peer-courier");
        Self::rooted_at(data_dir)
    }
}

impl StorageConfig {
    /// Layout with every directory under `data_dir`
    pub fn rooted_at(data_dir: PathBuf) -> Self {
        Self {
            keys_dir: data_dir.join("keys"),
            store_dir: data_dir.join("store"),
            data_dir,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl TransferConfig {
    /// Transfer deadline as a `Duration`
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }
}

impl NetworkConfig {
    /// Reconnect poll period as a `Duration`
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    /// Identifier registration backoff as a `Duration`
    pub fn identifier_retry(&self) -> Duration {
        Duration::from_secs(self.identifier_retry_secs)
    }
}

impl MessengerConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_file {
            if path.exists() {
                config = Self::from_file(path)?;
            } else {
                return Err(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
                .into());
            }
        } else {
            let default_locations = [
                PathBuf::from(DEFAULT_CONFIG_FILE),
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("peer-courier")
                    .join(DEFAULT_CONFIG_FILE),
            ];

            if let Some(location) = default_locations.iter().find(|l| l.exists()) {
                config = Self::from_file(location)?;
            }
        }

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml_string()?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `MESSENGER_*` environment overrides
    fn merge_from_env(mut self) -> Result<Self> {
        if let Ok(username) = std::env::var(format!("{ENV_PREFIX}_IDENTITY_USERNAME")) {
            self.identity.username = username;
        }

        if let Ok(addr) = std::env::var(format!("{ENV_PREFIX}_NETWORK_LISTEN_ADDRESS")) {
            self.network.listen_address = addr.parse().map_err(|_| ConfigError::InvalidValue {
                field: format!("{ENV_PREFIX}_NETWORK_LISTEN_ADDRESS"),
                value: addr,
            })?;
        }

        if let Ok(secs) = std::env::var(format!("{ENV_PREFIX}_NETWORK_RECONNECT_INTERVAL_SECS")) {
            self.network.reconnect_interval_secs =
                secs.parse().map_err(|_| ConfigError::InvalidValue {
                    field: format!("{ENV_PREFIX}_NETWORK_RECONNECT_INTERVAL_SECS"),
                    value: secs,
                })?;
        }

        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        if let Ok(data_dir) = std::env::var(format!("{ENV_PREFIX}_STORAGE_DATA_DIR")) {
            self.storage = StorageConfig::rooted_at(PathBuf::from(data_dir));
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, value: impl ToString) -> ConfigError {
            ConfigError::InvalidValue {
                field: field.to_string(),
                value: value.to_string(),
            }
        }

        if self.identity.username.trim().is_empty() {
            return Err(invalid("identity.username", "").into());
        }

        if self.network.reconnect_interval_secs == 0 {
            return Err(invalid("network.reconnect_interval_secs", 0).into());
        }

        if self.network.identifier_retry_secs == 0 {
            return Err(invalid("network.identifier_retry_secs", 0).into());
        }

        let chunk_sizes = crate::transfer::MIN_CHUNK_SIZE..=crate::transfer::MAX_CHUNK_SIZE;
        if !chunk_sizes.contains(&self.transfer.chunk_size) {
            return Err(invalid("transfer.chunk_size", self.transfer.chunk_size).into());
        }

        if self.transfer.transfer_timeout_secs == 0 {
            return Err(invalid("transfer.transfer_timeout_secs", 0).into());
        }

        if self.transfer.sweep_interval_secs == 0 {
            return Err(invalid("transfer.sweep_interval_secs", 0).into());
        }

        if self.transfer.max_transfers_per_peer == 0 {
            return Err(invalid("transfer.max_transfers_per_peer", 0).into());
        }

        if self.crypto.allow_shared_key && self.crypto.shared_passphrase.is_empty() {
            return Err(invalid("crypto.shared_passphrase", "").into());
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => return Err(invalid("logging.level", other).into()),
        }

        Ok(())
    }

    /// Ensure all required directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        let dirs_to_create = [
            &self.storage.data_dir,
            &self.storage.keys_dir,
            &self.storage.store_dir,
        ];

        for dir in &dirs_to_create {
            if !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|_| ConfigError::DirectoryCreation {
                    path: dir.display().to_string(),
                })?;
            }
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MessengerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.reconnect_interval_secs, 5);
        assert_eq!(config.network.identifier_retry_secs, 2);
        assert_eq!(config.transfer.chunk_size, 16 * 1024);
        assert!(config.crypto.allow_shared_key);
    }

    #[test]
    fn test_config_serialization() {
        let config = MessengerConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("reconnect_interval_secs"));
        assert!(toml_str.contains("chunk_size"));
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = MessengerConfig::default();
        config.identity.username = "phone-5551234".to_string();
        config
            .network
            .peers
            .insert("phone-777".to_string(), "127.0.0.1:4100".parse().unwrap());
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = MessengerConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.identity.username, "phone-5551234");
        assert_eq!(
            loaded.network.peers.get("phone-777"),
            Some(&"127.0.0.1:4100".parse().unwrap())
        );
        assert_eq!(loaded.transfer.chunk_size, config.transfer.chunk_size);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(
            temp_file.path(),
            "[identity]\nusername = \"phone-1\"\ndisplay_name = \"One\"\n",
        )
        .unwrap();

        let loaded = MessengerConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.identity.display_name, "One");
        assert_eq!(loaded.network.reconnect_interval_secs, 5);
    }

    #[test]
    fn test_config_validation() {
        let mut config = MessengerConfig::default();
        assert!(config.validate().is_ok());

        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());

        config.transfer.chunk_size = 100;
        assert!(config.validate().is_err());

        config.transfer.chunk_size = 4 * 1024 * 1024;
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.transfer.sweep_interval_secs = 0;
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.transfer.max_transfers_per_peer = 0;
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.network.reconnect_interval_secs = 0;
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.identity.username = "  ".to_string();
        assert!(config.validate().is_err());

        config = MessengerConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("MESSENGER_NETWORK_RECONNECT_INTERVAL_SECS", "9");

        let config = MessengerConfig::default().merge_from_env().unwrap();
        assert_eq!(config.network.reconnect_interval_secs, 9);

        std::env::remove_var("MESSENGER_NETWORK_RECONNECT_INTERVAL_SECS");
    }

    #[test]
    fn test_directory_paths() {
        let config = MessengerConfig::default();
        assert!(config.storage.keys_dir.starts_with(&config.storage.data_dir));
        assert!(config.storage.store_dir.starts_with(&config.storage.data_dir));
    }
}
