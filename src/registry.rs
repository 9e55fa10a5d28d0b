//! Persistent record of files the server hosts.
//!
//! Every completed upload is appended to a JSON registry so the `list`
//! command can enumerate hosted content without scanning the output
//! directory. Name, title and description are stored exactly as they came
//! off the wire, Groundfish-encrypted; only a holder of the word list can
//! read them back.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TransferError};
use crate::receiver::ReceiveMetadata;

/// One hosted file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostedFile {
    pub path: PathBuf,
    pub encrypted_name: Vec<u8>,
    pub encrypted_title: Vec<u8>,
    pub encrypted_description: Vec<u8>,
    pub type_id: u16,
    pub sub_type_id: u16,
    pub file_size: u64,
    /// CRC32 of the hosted bytes, for offline integrity checks.
    pub checksum: u32,
    /// Unix timestamp of the completed upload.
    pub uploaded_at: u64,
}

impl HostedFile {
    /// Builds a record for a file already sitting at its hosted path,
    /// reading it once to compute size and checksum.
    ///
    /// # Errors
    ///
    /// Fails if the hosted file cannot be read.
    pub fn from_hosted(path: &Path, metadata: &ReceiveMetadata) -> Result<Self> {
        let file_size = fs::metadata(path).map_err(|e| TransferError::Io(e))?.len();
        Ok(Self {
            path: path.to_path_buf(),
            encrypted_name: metadata.encrypted_name.clone(),
            encrypted_title: metadata.encrypted_title.clone(),
            encrypted_description: metadata.encrypted_description.clone(),
            type_id: metadata.type_id,
            sub_type_id: metadata.sub_type_id,
            file_size,
            checksum: file_crc32(path)?,
            uploaded_at: unix_timestamp(),
        })
    }
}

/// The registry file: a JSON array of [`HostedFile`] records.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    entries: Vec<HostedFile>,
}

impl Registry {
    /// Loads the registry, starting empty if the file does not exist yet.
    ///
    /// # Errors
    ///
    /// Fails if an existing registry file cannot be read or parsed.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| TransferError::Io(e))?;
            serde_json::from_str(&contents).map_err(|e| TransferError::Serialization(e))?
        } else {
            Vec::new()
        };
        debug!(path = %path.display(), entries = entries.len(), "Loaded registry");
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Inserts a record and persists the registry. A record for the same
    /// hosted path replaces the previous one.
    ///
    /// # Errors
    ///
    /// Fails if the registry file cannot be rewritten.
    pub fn insert(&mut self, record: HostedFile) -> Result<()> {
        self.entries.retain(|entry| entry.path != record.path);
        info!(
            path = %record.path.display(),
            size = record.file_size,
            "Recording hosted file"
        );
        self.entries.push(record);
        self.persist()
    }

    pub fn entries(&self) -> &[HostedFile] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rewrites the registry file through a temp file and rename so a crash
    /// mid-write cannot truncate the existing registry.
    fn persist(&self) -> Result<()> {
        let serialized = serde_json::to_string_pretty(&self.entries)
            .map_err(|e| TransferError::Serialization(e))?;
        let temp_path = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| TransferError::Io(e))?;
            }
        }
        fs::write(&temp_path, serialized).map_err(|e| TransferError::Io(e))?;
        fs::rename(&temp_path, &self.path).map_err(|e| TransferError::Io(e))?;
        Ok(())
    }
}

/// CRC32 of a file's contents, streamed in 64 KiB reads.
///
/// # Errors
///
/// Fails if the file cannot be opened or read.
pub fn file_crc32(path: &Path) -> Result<u32> {
    let mut file = File::open(path).map_err(|e| TransferError::Io(e))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|e| TransferError::Io(e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize())
}

/// Seconds since the Unix epoch.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_metadata() -> ReceiveMetadata {
        ReceiveMetadata {
            encrypted_name: vec![1, 2, 3],
            encrypted_title: vec![4, 5],
            encrypted_description: vec![],
            type_id: 3,
            sub_type_id: 1,
        }
    }

    #[test]
    fn test_starts_empty_without_file() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::load_or_create(&dir.path().join("registry.json")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_insert_persists_and_reloads() {
        let dir = TempDir::new().unwrap();
        let registry_path = dir.path().join("registry.json");
        let hosted = dir.path().join("report.pdf");
        fs::write(&hosted, b"hosted bytes").unwrap();

        let mut registry = Registry::load_or_create(&registry_path).unwrap();
        let record = HostedFile::from_hosted(&hosted, &sample_metadata()).unwrap();
        registry.insert(record.clone()).unwrap();

        let reloaded = Registry::load_or_create(&registry_path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.entries()[0], record);
    }

    #[test]
    fn test_same_path_replaces_previous_record() {
        let dir = TempDir::new().unwrap();
        let registry_path = dir.path().join("registry.json");
        let hosted = dir.path().join("report.pdf");

        let mut registry = Registry::load_or_create(&registry_path).unwrap();
        fs::write(&hosted, b"first upload").unwrap();
        registry
            .insert(HostedFile::from_hosted(&hosted, &sample_metadata()).unwrap())
            .unwrap();
        fs::write(&hosted, b"second upload, different bytes").unwrap();
        registry
            .insert(HostedFile::from_hosted(&hosted, &sample_metadata()).unwrap())
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.entries()[0].file_size, 30);
    }

    #[test]
    fn test_record_checksum_matches_contents() {
        let dir = TempDir::new().unwrap();
        let hosted = dir.path().join("data.bin");
        fs::write(&hosted, b"checksum me").unwrap();

        let record = HostedFile::from_hosted(&hosted, &sample_metadata()).unwrap();
        assert_eq!(record.checksum, crc32fast::hash(b"checksum me"));
        assert_eq!(record.file_size, 11);
        assert!(record.uploaded_at > 0);
    }

    #[test]
    fn test_corrupt_registry_rejected() {
        let dir = TempDir::new().unwrap();
        let registry_path = dir.path().join("registry.json");
        fs::write(&registry_path, b"not json at all").unwrap();

        let result = Registry::load_or_create(&registry_path);
        assert!(matches!(result, Err(TransferError::Serialization(_))));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let registry_path = dir.path().join("registry.json");
        let hosted = dir.path().join("a.bin");
        fs::write(&hosted, b"x").unwrap();

        let mut registry = Registry::load_or_create(&registry_path).unwrap();
        registry
            .insert(HostedFile::from_hosted(&hosted, &sample_metadata()).unwrap())
            .unwrap();
        assert!(registry_path.exists());
        assert!(!registry_path.with_extension("json.tmp").exists());
    }
}
