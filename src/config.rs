//! Configuration management for Ferry.
//!
//! This module handles loading, saving, and managing configuration for both
//! the hosting server and the sending client. Configuration is stored in TOML
//! format and includes settings for the transfer protocol, socket tuning and
//! the Groundfish cipher engine.

use crate::error::TransferError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// Protocol geometry constants
// A chunk is the unit carried by one wire message; a portion is the unit of
// acknowledgement. The defaults match the sizes the protocol was tuned for.
pub const FILE_CHUNK_SIZE: u64 = 1024;
pub const FILE_CHUNKS_PER_PORTION: u64 = 500;
pub const FILE_PORTION_SIZE: u64 = FILE_CHUNK_SIZE * FILE_CHUNKS_PER_PORTION; // 512000
pub const CHUNK_CHECKSUM_LEN: usize = 4;

// Wire limits, enforced before any buffer allocation
pub const MAX_FRAME_SIZE: usize = 128 * 1024;
pub const MAX_WIRE_CHUNK_SIZE: u64 = 64 * 1024;
pub const MAX_CHUNKS_PER_PORTION: u64 = 32_768;
pub const MAX_PORTION_BYTES: u64 = 16 * 1024 * 1024;
pub const MAX_METADATA_LEN: usize = 4096;

// Pacing and reliability constants
// Only the portion-complete control message is retried; chunk loss is
// recovered through the receiver's chunks-remaining report instead.
pub const PORTION_REMIND_INTERVAL_MS: u64 = 250;
pub const TICK_INTERVAL_MS: u64 = 10;
pub const TICK_BURST: u32 = 64;

// Network constants
pub const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

// Cipher constants
pub const DEFAULT_TABLE_DIRECTORY: &str = "./groundfish";

/// Main configuration structure containing all subsystem configurations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hosting-server configuration.
    pub server: ServerConfig,
    /// Sending-client configuration.
    pub client: ClientConfig,
    /// Transfer protocol geometry and pacing.
    pub transfer: TransferConfig,
    /// Groundfish word list storage.
    pub cipher: CipherConfig,
}

/// Configuration for the hosting server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub output_directory: String,
    pub registry_path: String,
    pub decrypt_received: bool,
    pub max_file_size: u64,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
}

/// Configuration for the sending client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server_address: String,
    pub server_port: u16,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
}

/// Transfer protocol geometry and pacing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub chunk_size: u64,
    pub chunks_per_portion: u64,
    pub remind_interval_ms: u64,
    pub tick_interval_ms: u64,
    pub tick_burst: u32,
}

/// Groundfish cipher engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherConfig {
    pub table_directory: String,
}

impl Config {
    /// Loads configuration from a file, or creates a new default configuration
    /// if the file doesn't exist.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file (TOML format)
    ///
    /// # Returns
    ///
    /// Returns the loaded or newly created configuration, or an error if
    /// the file exists but cannot be read or parsed.
    pub fn load_or_create(path: &Path) -> Result<Self, TransferError> {
        if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| TransferError::Io(e))?;
            toml::from_str(&content).map_err(|e| TransferError::TomlDeserialization(e))
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to a file in TOML format.
    ///
    /// # Arguments
    ///
    /// * `path` - Path where the configuration should be saved
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails or the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| TransferError::TomlSerialization(e))?;
        fs::write(path, content).map_err(|e| TransferError::Io(e))?;
        Ok(())
    }

    /// Validates the transfer geometry against the wire limits.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` naming the offending setting if the chunk
    /// size, the portion width or the resulting portion byte size falls
    /// outside what the wire format can carry.
    pub fn validate(&self) -> Result<(), TransferError> {
        let transfer = &self.transfer;
        if transfer.chunk_size == 0 || transfer.chunk_size > MAX_WIRE_CHUNK_SIZE {
            return Err(TransferError::ConfigError(format!(
                "chunk_size {} must be between 1 and {}",
                transfer.chunk_size, MAX_WIRE_CHUNK_SIZE
            )));
        }
        if transfer.chunks_per_portion == 0 || transfer.chunks_per_portion > MAX_CHUNKS_PER_PORTION
        {
            return Err(TransferError::ConfigError(format!(
                "chunks_per_portion {} must be between 1 and {}",
                transfer.chunks_per_portion, MAX_CHUNKS_PER_PORTION
            )));
        }
        let portion_bytes = transfer.chunk_size * transfer.chunks_per_portion;
        if portion_bytes > MAX_PORTION_BYTES {
            return Err(TransferError::ConfigError(format!(
                "portion byte size {} exceeds the {} limit",
                portion_bytes, MAX_PORTION_BYTES
            )));
        }
        if transfer.tick_burst == 0 {
            return Err(TransferError::ConfigError(
                "tick_burst must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            transfer: TransferConfig::default(),
            cipher: CipherConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 9440,
            output_directory: "./hosted".to_string(),
            registry_path: "./hosted/registry.json".to_string(),
            decrypt_received: false,
            max_file_size: 1024 * 1024 * 1024, // 1GB
            send_buffer_size: Some(SOCKET_BUFFER_SIZE),
            recv_buffer_size: Some(SOCKET_BUFFER_SIZE),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 9440,
            send_buffer_size: Some(SOCKET_BUFFER_SIZE),
            recv_buffer_size: Some(SOCKET_BUFFER_SIZE),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: FILE_CHUNK_SIZE,
            chunks_per_portion: FILE_CHUNKS_PER_PORTION,
            remind_interval_ms: PORTION_REMIND_INTERVAL_MS,
            tick_interval_ms: TICK_INTERVAL_MS,
            tick_burst: TICK_BURST,
        }
    }
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            table_directory: DEFAULT_TABLE_DIRECTORY.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.server.address, "127.0.0.1");
        assert_eq!(config.server.port, 9440);
        assert_eq!(config.client.server_address, "127.0.0.1");
        assert_eq!(config.client.server_port, 9440);
        assert_eq!(config.transfer.chunk_size, FILE_CHUNK_SIZE);
        assert_eq!(config.cipher.table_directory, DEFAULT_TABLE_DIRECTORY);
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();

        assert_eq!(config.address, "127.0.0.1");
        assert_eq!(config.port, 9440);
        assert_eq!(config.output_directory, "./hosted");
        assert_eq!(config.registry_path, "./hosted/registry.json");
        assert!(!config.decrypt_received);
        assert_eq!(config.max_file_size, 1024 * 1024 * 1024);
        assert_eq!(config.send_buffer_size, Some(SOCKET_BUFFER_SIZE));
        assert_eq!(config.recv_buffer_size, Some(SOCKET_BUFFER_SIZE));
    }

    #[test]
    fn test_transfer_config_default() {
        let config = TransferConfig::default();

        assert_eq!(config.chunk_size, FILE_CHUNK_SIZE);
        assert_eq!(config.chunks_per_portion, FILE_CHUNKS_PER_PORTION);
        assert_eq!(config.remind_interval_ms, PORTION_REMIND_INTERVAL_MS);
        assert_eq!(config.tick_interval_ms, TICK_INTERVAL_MS);
        assert_eq!(config.tick_burst, TICK_BURST);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();

        assert_eq!(config.server.address, deserialized.server.address);
        assert_eq!(config.server.port, deserialized.server.port);
        assert_eq!(config.transfer.chunk_size, deserialized.transfer.chunk_size);
        assert_eq!(
            config.transfer.chunks_per_portion,
            deserialized.transfer.chunks_per_portion
        );
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let original_config = Config::default();
        original_config.save(&config_path).unwrap();

        let loaded_config = Config::load_or_create(&config_path).unwrap();

        assert_eq!(original_config.server.address, loaded_config.server.address);
        assert_eq!(original_config.server.port, loaded_config.server.port);
        assert_eq!(
            original_config.transfer.remind_interval_ms,
            loaded_config.transfer.remind_interval_ms
        );
    }

    #[test]
    fn test_config_create_new() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("new_config.toml");

        // Should create new config file
        let config = Config::load_or_create(&config_path).unwrap();

        assert!(config_path.exists());
        assert_eq!(config.server.address, "127.0.0.1");
        assert_eq!(config.server.port, 9440);
    }

    #[test]
    fn test_validate_accepts_defaults() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_chunk_size() {
        let mut config = Config::default();
        config.transfer.chunk_size = 0;

        match config.validate() {
            Err(TransferError::ConfigError(msg)) => assert!(msg.contains("chunk_size")),
            other => panic!("Expected ConfigError, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_oversized_portion() {
        let mut config = Config::default();
        config.transfer.chunk_size = MAX_WIRE_CHUNK_SIZE;
        config.transfer.chunks_per_portion = MAX_CHUNKS_PER_PORTION;

        match config.validate() {
            Err(TransferError::ConfigError(msg)) => assert!(msg.contains("portion byte size")),
            other => panic!("Expected ConfigError, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_wide_portion() {
        let mut config = Config::default();
        config.transfer.chunks_per_portion = MAX_CHUNKS_PER_PORTION + 1;

        match config.validate() {
            Err(TransferError::ConfigError(msg)) => assert!(msg.contains("chunks_per_portion")),
            other => panic!("Expected ConfigError, got {:?}", other),
        }
    }

    #[test]
    fn test_constants() {
        assert_eq!(FILE_CHUNK_SIZE, 1024);
        assert_eq!(FILE_CHUNKS_PER_PORTION, 500);
        assert_eq!(FILE_PORTION_SIZE, 512_000);
        assert_eq!(CHUNK_CHECKSUM_LEN, 4);
        assert_eq!(PORTION_REMIND_INTERVAL_MS, 250);
        assert!(MAX_WIRE_CHUNK_SIZE as usize + 64 <= MAX_FRAME_SIZE);
        assert!(FILE_PORTION_SIZE <= MAX_PORTION_BYTES);
        assert!(FILE_CHUNKS_PER_PORTION <= MAX_CHUNKS_PER_PORTION);
    }

    #[test]
    fn test_custom_config() {
        let mut config = Config::default();
        config.server.address = "0.0.0.0".to_string();
        config.server.port = 9000;
        config.transfer.chunk_size = 2048;
        config.transfer.chunks_per_portion = 250;

        assert_eq!(config.server.address, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert!(config.validate().is_ok());
    }
}
