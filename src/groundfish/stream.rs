//! Streaming Groundfish encryption for files of any size.
//!
//! Encrypted files carry a 13-byte header (word list version as i32, original
//! size as i64, starting word index as u8, little-endian) followed by the
//! substituted bytes. The body is processed in fixed steps with the word
//! index carried across step boundaries, so decryption can be spread over
//! many scheduler ticks without holding the whole file in memory.

use crate::error::{Result, TransferError};
use super::table::WordList;
use super::CipherContext;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Bytes of header before the encrypted body begins.
pub const FILE_HEADER_LEN: usize = 13;

/// Bytes processed per step of streaming encryption or decryption.
pub const CIPHER_STEP_SIZE: usize = 1024;

/// Encrypts a whole file under the given word list, returning the number of
/// plaintext bytes processed.
///
/// # Arguments
///
/// * `table` - Word list to substitute through
/// * `source` - Plaintext file to read
/// * `dest` - Encrypted file to create (truncated if it exists)
/// * `start_index` - First word index of the walk
///
/// # Errors
///
/// Returns an I/O error if either file cannot be read or written.
pub fn encrypt_file(table: &WordList, source: &Path, dest: &Path, start_index: u8) -> Result<u64> {
    let mut input = File::open(source).map_err(|e| TransferError::Io(e))?;
    let total_bytes = input.metadata().map_err(|e| TransferError::Io(e))?.len();
    let mut output = File::create(dest).map_err(|e| TransferError::Io(e))?;

    let mut header = [0u8; FILE_HEADER_LEN];
    header[0..4].copy_from_slice(&(table.version() as i32).to_le_bytes());
    header[4..12].copy_from_slice(&(total_bytes as i64).to_le_bytes());
    header[12] = start_index;
    output.write_all(&header).map_err(|e| TransferError::Io(e))?;

    let mut index = start_index;
    let mut buffer = vec![0u8; CIPHER_STEP_SIZE];
    loop {
        let read = match input.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::Io(e)),
        };
        for byte in &mut buffer[..read] {
            *byte = table.substitute(index, *byte);
            index = index.wrapping_add(1);
        }
        output.write_all(&buffer[..read]).map_err(|e| TransferError::Io(e))?;
    }

    output.sync_all().map_err(|e| TransferError::Io(e))?;
    Ok(total_bytes)
}

/// Resumable decryption of a Groundfish-encrypted file.
///
/// The task validates the header up front, then decrypts one step per call
/// to [`advance`](Self::advance) so a scheduler can interleave it with other
/// work. The word list is selected by the version recorded in the header,
/// falling back to the active table when that version is gone.
#[derive(Debug)]
pub struct FileDecryptTask {
    source: Option<File>,
    dest: File,
    source_path: PathBuf,
    dest_path: PathBuf,
    version: u32,
    total_bytes: u64,
    processed_bytes: u64,
    word_index: u8,
    delete_source: bool,
    complete: bool,
}

impl FileDecryptTask {
    /// Opens an encrypted file and validates its header.
    ///
    /// # Arguments
    ///
    /// * `source_path` - Encrypted file to decrypt
    /// * `dest_path` - Plaintext file to create (truncated if it exists)
    /// * `delete_source` - Remove the encrypted file once decryption finishes
    ///
    /// # Errors
    ///
    /// Returns a `MalformedPayload` error if the header is truncated,
    /// declares negative fields, or disagrees with the actual file length.
    pub fn new(source_path: &Path, dest_path: &Path, delete_source: bool) -> Result<Self> {
        let mut source = File::open(source_path).map_err(|e| TransferError::Io(e))?;
        let file_len = source.metadata().map_err(|e| TransferError::Io(e))?.len();

        let mut header = [0u8; FILE_HEADER_LEN];
        match source.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(TransferError::MalformedPayload(format!(
                    "encrypted file {} is shorter than its {} byte header",
                    source_path.display(),
                    FILE_HEADER_LEN
                )));
            }
            Err(e) => return Err(TransferError::Io(e)),
        }

        let mut version_bytes = [0u8; 4];
        version_bytes.copy_from_slice(&header[0..4]);
        let version = i32::from_le_bytes(version_bytes);
        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&header[4..12]);
        let total_bytes = i64::from_le_bytes(size_bytes);

        if version < 0 {
            return Err(TransferError::MalformedPayload(format!(
                "encrypted file {} declares negative word list version {}",
                source_path.display(),
                version
            )));
        }
        if total_bytes < 0 {
            return Err(TransferError::MalformedPayload(format!(
                "encrypted file {} declares negative size {}",
                source_path.display(),
                total_bytes
            )));
        }
        if file_len != FILE_HEADER_LEN as u64 + total_bytes as u64 {
            return Err(TransferError::MalformedPayload(format!(
                "encrypted file {} declares {} body bytes but is {} bytes long",
                source_path.display(),
                total_bytes,
                file_len
            )));
        }

        let dest = File::create(dest_path).map_err(|e| TransferError::Io(e))?;
        let mut task = Self {
            source: Some(source),
            dest,
            source_path: source_path.to_path_buf(),
            dest_path: dest_path.to_path_buf(),
            version: version as u32,
            total_bytes: total_bytes as u64,
            processed_bytes: 0,
            word_index: header[12],
            delete_source,
            complete: false,
        };
        if task.total_bytes == 0 {
            task.finish()?;
        }
        Ok(task)
    }

    /// Decrypts the next step of the file and returns the completion
    /// percentage. Calling `advance` on a completed task is a no-op.
    pub fn advance(&mut self, cipher: &CipherContext) -> Result<f64> {
        if self.complete {
            return Ok(100.0);
        }
        let Some(source) = self.source.as_mut() else {
            return Ok(100.0);
        };

        let remaining = self.total_bytes - self.processed_bytes;
        let step = remaining.min(CIPHER_STEP_SIZE as u64) as usize;
        let mut buffer = vec![0u8; step];
        match source.read_exact(&mut buffer) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(TransferError::MalformedPayload(format!(
                    "encrypted file {} truncated mid-body",
                    self.source_path.display()
                )));
            }
            Err(e) => return Err(TransferError::Io(e)),
        }

        let table = cipher.table_for_version(self.version);
        for byte in &mut buffer {
            *byte = table.invert(self.word_index, *byte);
            self.word_index = self.word_index.wrapping_add(1);
        }
        self.dest.write_all(&buffer).map_err(|e| TransferError::Io(e))?;
        self.processed_bytes += step as u64;

        if self.processed_bytes == self.total_bytes {
            self.finish()?;
        }
        Ok(self.percent())
    }

    /// Drives the task to completion in one call.
    pub fn run_to_completion(&mut self, cipher: &CipherContext) -> Result<()> {
        while !self.complete {
            self.advance(cipher)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.dest.sync_all().map_err(|e| TransferError::Io(e))?;
        self.complete = true;
        drop(self.source.take());
        if self.delete_source {
            fs::remove_file(&self.source_path).map_err(|e| TransferError::Io(e))?;
        }
        Ok(())
    }

    /// Abandons the task and removes the partially written destination file.
    pub fn abort(self) -> Result<()> {
        drop(self.dest);
        if !self.complete {
            fs::remove_file(&self.dest_path).map_err(|e| TransferError::Io(e))?;
        }
        Ok(())
    }

    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.processed_bytes as f64 / self.total_bytes as f64 * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn dest_path(&self) -> &Path {
        &self.dest_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i.wrapping_mul(31) >> 3) as u8).collect()
    }

    #[test]
    fn test_file_round_trip_various_sizes() {
        let temp_dir = tempdir().unwrap();
        let cipher = CipherContext::load_or_generate(&temp_dir.path().join("tables")).unwrap();

        for len in [0usize, 1, 1023, 1024, 1025, 3000] {
            let plain_path = temp_dir.path().join(format!("plain_{}", len));
            let cipher_path = temp_dir.path().join(format!("cipher_{}", len));
            let out_path = temp_dir.path().join(format!("out_{}", len));

            let plaintext = patterned(len);
            fs::write(&plain_path, &plaintext).unwrap();

            let written = encrypt_file(cipher.current(), &plain_path, &cipher_path, 42).unwrap();
            assert_eq!(written, len as u64);
            assert_eq!(
                fs::metadata(&cipher_path).unwrap().len(),
                (FILE_HEADER_LEN + len) as u64
            );

            let mut task = FileDecryptTask::new(&cipher_path, &out_path, false).unwrap();
            task.run_to_completion(&cipher).unwrap();
            assert_eq!(fs::read(&out_path).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_advance_reports_monotonic_progress() {
        let temp_dir = tempdir().unwrap();
        let cipher = CipherContext::load_or_generate(&temp_dir.path().join("tables")).unwrap();

        let plain_path = temp_dir.path().join("plain");
        let cipher_path = temp_dir.path().join("cipher");
        let out_path = temp_dir.path().join("out");
        fs::write(&plain_path, patterned(2500)).unwrap();
        encrypt_file(cipher.current(), &plain_path, &cipher_path, 0).unwrap();

        let mut task = FileDecryptTask::new(&cipher_path, &out_path, false).unwrap();
        let mut last = 0.0;
        let mut steps = 0;
        while !task.is_complete() {
            let percent = task.advance(&cipher).unwrap();
            assert!(percent >= last);
            last = percent;
            steps += 1;
        }

        assert_eq!(steps, 3); // 1024 + 1024 + 452
        assert_eq!(last, 100.0);
    }

    #[test]
    fn test_delete_source_after_completion() {
        let temp_dir = tempdir().unwrap();
        let cipher = CipherContext::load_or_generate(&temp_dir.path().join("tables")).unwrap();

        let plain_path = temp_dir.path().join("plain");
        let cipher_path = temp_dir.path().join("cipher");
        let out_path = temp_dir.path().join("out");
        fs::write(&plain_path, patterned(100)).unwrap();
        encrypt_file(cipher.current(), &plain_path, &cipher_path, 9).unwrap();

        let mut task = FileDecryptTask::new(&cipher_path, &out_path, true).unwrap();
        task.run_to_completion(&cipher).unwrap();

        assert!(!cipher_path.exists());
        assert!(out_path.exists());
    }

    #[test]
    fn test_rejects_truncated_header() {
        let temp_dir = tempdir().unwrap();
        let short_path = temp_dir.path().join("short");
        fs::write(&short_path, [0u8; FILE_HEADER_LEN - 1]).unwrap();

        match FileDecryptTask::new(&short_path, &temp_dir.path().join("out"), false) {
            Err(TransferError::MalformedPayload(msg)) => assert!(msg.contains("header")),
            other => panic!("Expected MalformedPayload, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let temp_dir = tempdir().unwrap();
        let bad_path = temp_dir.path().join("bad");

        // Header declares 100 body bytes but only 10 follow.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1i32.to_le_bytes());
        bytes.extend_from_slice(&100i64.to_le_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&[0u8; 10]);
        fs::write(&bad_path, bytes).unwrap();

        match FileDecryptTask::new(&bad_path, &temp_dir.path().join("out"), false) {
            Err(TransferError::MalformedPayload(msg)) => assert!(msg.contains("100")),
            other => panic!("Expected MalformedPayload, got {:?}", other),
        }
    }

    #[test]
    fn test_abort_removes_partial_output() {
        let temp_dir = tempdir().unwrap();
        let cipher = CipherContext::load_or_generate(&temp_dir.path().join("tables")).unwrap();

        let plain_path = temp_dir.path().join("plain");
        let cipher_path = temp_dir.path().join("cipher");
        let out_path = temp_dir.path().join("out");
        fs::write(&plain_path, patterned(5000)).unwrap();
        encrypt_file(cipher.current(), &plain_path, &cipher_path, 3).unwrap();

        let mut task = FileDecryptTask::new(&cipher_path, &out_path, false).unwrap();
        task.advance(&cipher).unwrap();
        task.abort().unwrap();

        assert!(!out_path.exists());
        assert!(cipher_path.exists());
    }
}
