//! The Groundfish substitution cipher engine.
//!
//! Groundfish obfuscates file names, titles, descriptions and whole files by
//! walking each byte through one of 256 shuffled byte alphabets ("words").
//! It is a substitution cipher for at-rest obfuscation of hosted content, not
//! a confidentiality mechanism; both peers must share the same word list
//! file.
//!
//! Tables are versioned. Every encrypted payload and file records the table
//! version it was produced under, and the [`CipherContext`] keeps superseded
//! tables in an archive so old content keeps decrypting after a rotation.

pub mod payload;
pub mod stream;
pub mod table;

pub use stream::FileDecryptTask;
pub use table::WordList;

use crate::error::{Result, TransferError};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File name of the active word list inside the table directory.
pub const CURRENT_TABLE_FILE: &str = "wordlist.bin";

const ARCHIVE_PREFIX: &str = "wordlist.v";
const ARCHIVE_SUFFIX: &str = ".bin";

/// The process-wide cipher state: the active word list plus every archived
/// predecessor found in the table directory.
///
/// The context is read-only in steady state and is shared across connections
/// behind an `Arc`. Rotation mutates the context and must only happen with no
/// transfers in flight, which in practice means through the `keygen` command
/// while the server is down.
#[derive(Debug)]
pub struct CipherContext {
    directory: PathBuf,
    current: WordList,
    archived: HashMap<u32, WordList>,
}

impl CipherContext {
    /// Loads the word lists from a directory, generating and persisting a
    /// version-1 list first if the directory has none.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or read, or if
    /// any word list file fails its corruption checks.
    pub fn load_or_generate(directory: &Path) -> Result<Self> {
        fs::create_dir_all(directory).map_err(|e| TransferError::Io(e))?;

        let current_path = directory.join(CURRENT_TABLE_FILE);
        let current = if current_path.exists() {
            WordList::load(&current_path)?
        } else {
            let list = WordList::generate(1, &mut rand::thread_rng());
            list.save(&current_path)?;
            info!(
                version = 1,
                path = %current_path.display(),
                "Generated initial Groundfish word list"
            );
            list
        };

        let mut archived = HashMap::new();
        for entry in fs::read_dir(directory).map_err(|e| TransferError::Io(e))? {
            let entry = entry.map_err(|e| TransferError::Io(e))?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(version_text) = file_name
                .strip_prefix(ARCHIVE_PREFIX)
                .and_then(|rest| rest.strip_suffix(ARCHIVE_SUFFIX))
            else {
                continue;
            };
            if version_text.parse::<u32>().is_err() {
                continue;
            }

            let list = WordList::load(&entry.path())?;
            if list.version().to_string() != version_text {
                warn!(
                    file = %file_name,
                    embedded = list.version(),
                    "Archived word list file name disagrees with its embedded version"
                );
            }
            archived.insert(list.version(), list);
        }

        debug!(
            version = current.version(),
            archived = archived.len(),
            "Loaded Groundfish cipher context"
        );
        Ok(Self {
            directory: directory.to_path_buf(),
            current,
            archived,
        })
    }

    /// Archives the active word list and generates a fresh successor.
    ///
    /// Payloads encrypted under the old version keep decrypting through the
    /// archive. Must not be called with transfers in flight.
    ///
    /// # Returns
    ///
    /// The version number of the new active word list.
    pub fn rotate(&mut self) -> Result<u32> {
        let old_version = self.current.version();
        let archive_path = self.directory.join(format!(
            "{}{}{}",
            ARCHIVE_PREFIX, old_version, ARCHIVE_SUFFIX
        ));
        self.current.save(&archive_path)?;

        let next = WordList::generate(old_version + 1, &mut rand::thread_rng());
        next.save(&self.directory.join(CURRENT_TABLE_FILE))?;

        let old = std::mem::replace(&mut self.current, next);
        self.archived.insert(old_version, old);
        info!(
            version = self.current.version(),
            "Rotated Groundfish word list"
        );
        Ok(self.current.version())
    }

    /// The active word list.
    pub fn current(&self) -> &WordList {
        &self.current
    }

    /// Version of the active word list.
    pub fn version(&self) -> u32 {
        self.current.version()
    }

    /// Selects the word list for a payload's recorded version. An unknown
    /// version falls back to the active table, which yields garbage bytes
    /// rather than an error; the original system made the same trade to keep
    /// old records listable.
    pub fn table_for_version(&self, version: u32) -> &WordList {
        if version == self.current.version() {
            return &self.current;
        }
        match self.archived.get(&version) {
            Some(list) => list,
            None => {
                debug!(
                    requested = version,
                    active = self.current.version(),
                    "No word list for requested version, falling back to the active table"
                );
                &self.current
            }
        }
    }

    /// Encrypts a metadata buffer under the active table with a random
    /// starting word index.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        payload::encrypt(&self.current, plaintext, rand::random())
    }

    /// Encrypts a metadata buffer with a caller-chosen starting word index.
    pub fn encrypt_from(&self, plaintext: &[u8], start_index: u8) -> Vec<u8> {
        payload::encrypt(&self.current, plaintext, start_index)
    }

    /// Decrypts a metadata payload, selecting the word list by the version
    /// recorded in its header.
    ///
    /// # Errors
    ///
    /// Returns a `MalformedPayload` error if the header fails validation.
    pub fn decrypt(&self, encrypted: &[u8]) -> Result<Vec<u8>> {
        let header = payload::parse_header(encrypted)?;
        payload::decrypt(self.table_for_version(header.version), encrypted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generates_table_on_first_use() {
        let temp_dir = tempdir().unwrap();
        let dir = temp_dir.path().join("tables");

        let cipher = CipherContext::load_or_generate(&dir).unwrap();

        assert_eq!(cipher.version(), 1);
        assert!(dir.join(CURRENT_TABLE_FILE).exists());
    }

    #[test]
    fn test_payload_round_trips_across_instances() {
        let temp_dir = tempdir().unwrap();
        let dir = temp_dir.path().join("tables");

        let first = CipherContext::load_or_generate(&dir).unwrap();
        let encrypted = first.encrypt(b"annual-report.pdf");

        let second = CipherContext::load_or_generate(&dir).unwrap();
        assert_eq!(second.decrypt(&encrypted).unwrap(), b"annual-report.pdf");
    }

    #[test]
    fn test_rotation_archives_old_version() {
        let temp_dir = tempdir().unwrap();
        let dir = temp_dir.path().join("tables");

        let mut cipher = CipherContext::load_or_generate(&dir).unwrap();
        let old_payload = cipher.encrypt(b"before rotation");

        let new_version = cipher.rotate().unwrap();
        assert_eq!(new_version, 2);
        assert!(dir.join("wordlist.v1.bin").exists());

        // Old payloads decrypt through the archive, new ones under v2.
        assert_eq!(cipher.decrypt(&old_payload).unwrap(), b"before rotation");
        let new_payload = cipher.encrypt(b"after rotation");
        assert_eq!(payload::parse_header(&new_payload).unwrap().version, 2);
        assert_eq!(cipher.decrypt(&new_payload).unwrap(), b"after rotation");
    }

    #[test]
    fn test_fresh_context_loads_archive_from_disk() {
        let temp_dir = tempdir().unwrap();
        let dir = temp_dir.path().join("tables");

        let mut cipher = CipherContext::load_or_generate(&dir).unwrap();
        let old_payload = cipher.encrypt(b"survives restart");
        cipher.rotate().unwrap();
        drop(cipher);

        let reloaded = CipherContext::load_or_generate(&dir).unwrap();
        assert_eq!(reloaded.version(), 2);
        assert_eq!(reloaded.decrypt(&old_payload).unwrap(), b"survives restart");
    }

    #[test]
    fn test_unknown_version_falls_back_to_active_table() {
        let temp_dir = tempdir().unwrap();
        let cipher = CipherContext::load_or_generate(&temp_dir.path().join("tables")).unwrap();

        let mut encrypted = cipher.encrypt_from(b"mystery", 10);
        encrypted[0..4].copy_from_slice(&99i32.to_le_bytes());

        // Version 99 was never archived. Decryption must not fail; it falls
        // back to the active table, which here is the one that encrypted.
        assert_eq!(cipher.decrypt(&encrypted).unwrap(), b"mystery");
    }

    #[test]
    fn test_deterministic_start_index() {
        let temp_dir = tempdir().unwrap();
        let cipher = CipherContext::load_or_generate(&temp_dir.path().join("tables")).unwrap();

        let a = cipher.encrypt_from(b"same", 33);
        let b = cipher.encrypt_from(b"same", 33);
        assert_eq!(a, b);
    }
}
