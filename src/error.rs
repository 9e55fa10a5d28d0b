//! Error types for the Ferry transfer system.
//!
//! This module defines the error types used throughout the hosting server,
//! the sending client and the Groundfish cipher engine. Errors carry enough
//! context to tell a corrupt wire payload apart from a protocol violation or
//! a plain I/O failure, because the connection loop treats those differently.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during file hosting and transfer operations.
///
/// Malformed payloads are recoverable at the connection level (the frame is
/// dropped, the stream stays aligned), while protocol errors and I/O errors
/// tear down the affected task or connection.
#[derive(Debug, Error)]
pub enum TransferError {
    /// An I/O error occurred during file or network operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize or deserialize JSON data.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to serialize data to TOML format.
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// Failed to deserialize data from TOML format.
    #[error("TOML deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),

    /// A wire or cipher payload did not match its declared layout.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// A protocol-level error occurred (invalid state, limit violation, oversized frame, etc.).
    #[error("Transfer protocol error: {0}")]
    ProtocolError(String),

    /// A chunk failed validation (checksum mismatch or size mismatch).
    #[error("Chunk validation failed for portion {portion_index} chunk {chunk_index}")]
    ChunkValidationFailed { portion_index: u64, chunk_index: u16 },

    /// A configuration error (invalid settings, corrupt word list file, etc.).
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The requested file was not found.
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// A network-level error occurred (connection refused, reset, etc.).
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A transfer was torn down before completion.
    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    /// The transfer was cancelled by the user or the remote peer.
    #[error("Transfer cancelled")]
    Cancelled,
}

/// Convenience alias used by every module in the crate.
pub type Result<T> = std::result::Result<T, TransferError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let transfer_error: TransferError = io_error.into();

        match transfer_error {
            TransferError::Io(_) => {}
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_error = serde_json::from_str::<i32>("invalid json").unwrap_err();
        let transfer_error: TransferError = json_error.into();

        match transfer_error {
            TransferError::Serialization(_) => {}
            _ => panic!("Expected Serialization error variant"),
        }
    }

    #[test]
    fn test_toml_serialization_error_conversion() {
        // A bare integer is not a valid top-level TOML document.
        let toml_error = toml::to_string(&42).unwrap_err();
        let transfer_error: TransferError = toml_error.into();

        match transfer_error {
            TransferError::TomlSerialization(_) => {}
            _ => panic!("Expected TomlSerialization error variant"),
        }
    }

    #[test]
    fn test_toml_deserialization_error_conversion() {
        let toml_error = toml::from_str::<i32>("invalid toml").unwrap_err();
        let transfer_error: TransferError = toml_error.into();

        match transfer_error {
            TransferError::TomlDeserialization(_) => {}
            _ => panic!("Expected TomlDeserialization error variant"),
        }
    }

    #[test]
    fn test_malformed_payload_error() {
        let error = TransferError::MalformedPayload("checksum length 7 is not 4".to_string());
        let error_string = error.to_string();
        assert!(error_string.contains("Malformed payload"));
        assert!(error_string.contains("checksum length 7"));
    }

    #[test]
    fn test_protocol_error() {
        let error = TransferError::ProtocolError("Invalid message format".to_string());
        let error_string = error.to_string();
        assert!(error_string.contains("Invalid message format"));
    }

    #[test]
    fn test_chunk_validation_error() {
        let error = TransferError::ChunkValidationFailed {
            portion_index: 2,
            chunk_index: 171,
        };
        let error_string = error.to_string();
        assert!(error_string.contains("portion 2"));
        assert!(error_string.contains("chunk 171"));
    }

    #[test]
    fn test_config_error() {
        let error = TransferError::ConfigError("Missing required field".to_string());
        let error_string = error.to_string();
        assert!(error_string.contains("Missing required field"));
    }

    #[test]
    fn test_file_not_found_error() {
        let path = PathBuf::from("/nonexistent/file.txt");
        let error = TransferError::FileNotFound(path.clone());
        let error_string = error.to_string();
        assert!(error_string.contains(path.to_string_lossy().as_ref()));
    }

    #[test]
    fn test_network_error() {
        let error = TransferError::NetworkError("Connection refused".to_string());
        let error_string = error.to_string();
        assert!(error_string.contains("Connection refused"));
    }

    #[test]
    fn test_transfer_failed_error() {
        let error = TransferError::TransferFailed("peer cancelled the upload".to_string());
        let error_string = error.to_string();
        assert!(error_string.contains("peer cancelled the upload"));
    }

    #[test]
    fn test_cancelled_error() {
        let error = TransferError::Cancelled;
        let error_string = error.to_string();
        assert_eq!(error_string, "Transfer cancelled");
    }

    #[test]
    fn test_error_debug_format() {
        let error = TransferError::ProtocolError("Test error".to_string());
        let debug_string = format!("{:?}", error);
        assert!(debug_string.contains("ProtocolError"));
        assert!(debug_string.contains("Test error"));
    }
}
