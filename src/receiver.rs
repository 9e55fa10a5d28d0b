//! Inbound transfer state machine.
//!
//! A [`FileReceiveTask`] pre-allocates a temp file at the declared size and
//! writes chunks at their computed offsets as they arrive, so ordering never
//! matters. It answers each portion-complete announcement with either the
//! exact list of chunks still missing or a confirmation, and courtesy-confirms
//! stale announcements so a sender whose confirmation got delayed keeps
//! moving. Like the send side it is transport-free.

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::chunk::TransferGeometry;
use crate::config::CHUNK_CHECKSUM_LEN;
use crate::error::{Result, TransferError};
use crate::groundfish::FileDecryptTask;
use crate::message::{chunk_checksum, Message};
use crate::progress::{portion_progress, Direction, ProgressEvent};

/// Announcement fields retained for the hosted-file record.
#[derive(Debug, Clone, Default)]
pub struct ReceiveMetadata {
    pub encrypted_name: Vec<u8>,
    pub encrypted_title: Vec<u8>,
    pub encrypted_description: Vec<u8>,
    pub type_id: u16,
    pub sub_type_id: u16,
}

/// Receives one file into a pre-allocated temp path, portion by portion.
///
/// After the final portion is confirmed the caller finalizes the task, either
/// by renaming the temp file into place or by handing it to a
/// [`FileDecryptTask`].
pub struct FileReceiveTask {
    display_name: String,
    final_path: PathBuf,
    temp_path: PathBuf,
    geometry: TransferGeometry,
    metadata: ReceiveMetadata,
    file: Option<File>,
    portion_index: u64,
    pending_chunks: BTreeSet<u16>,
    complete: bool,
    started_at: Instant,
}

impl FileReceiveTask {
    /// Pre-allocates the temp file at the declared size and prepares the
    /// ready message the caller must deliver to start the chunk flow.
    ///
    /// # Errors
    ///
    /// Fails if the declared geometry is invalid or the temp file cannot be
    /// created and sized.
    pub fn new(
        display_name: &str,
        final_path: &Path,
        temp_path: &Path,
        file_size: u64,
        chunk_size: u64,
        chunks_per_portion: u64,
        metadata: ReceiveMetadata,
    ) -> Result<(Self, Message)> {
        let geometry = TransferGeometry::new(file_size, chunk_size, chunks_per_portion)?;
        if geometry.portion_count() == 0 {
            return Err(TransferError::ProtocolError(
                "cannot receive an empty file".to_string(),
            ));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_path)
            .map_err(|e| TransferError::Io(e))?;
        file.set_len(file_size).map_err(|e| TransferError::Io(e))?;

        let task = Self {
            display_name: display_name.to_string(),
            final_path: final_path.to_path_buf(),
            temp_path: temp_path.to_path_buf(),
            geometry,
            metadata,
            file: Some(file),
            portion_index: 0,
            pending_chunks: (0..geometry.chunks_in_portion(0) as u16).collect(),
            complete: false,
            started_at: Instant::now(),
        };

        info!(
            name = %task.display_name,
            size = file_size,
            portions = geometry.portion_count(),
            temp = %temp_path.display(),
            "Prepared inbound transfer"
        );
        Ok((task, Message::ReceiveReady))
    }

    /// Validates and stores one chunk.
    ///
    /// Chunks for a stale or future portion, chunks already written, and
    /// chunks whose checksum or length disagree with the payload are
    /// discarded without touching the file or the pending set; the portion
    /// handshake recovers anything that mattered. Returns a progress event
    /// when the chunk was actually written.
    ///
    /// # Errors
    ///
    /// Fails only when the temp file cannot be written.
    pub fn handle_chunk(
        &mut self,
        portion_index: u64,
        chunk_index: u16,
        checksum: [u8; CHUNK_CHECKSUM_LEN],
        data: &Bytes,
        now: Instant,
    ) -> Result<Option<ProgressEvent>> {
        if self.complete || portion_index != self.portion_index {
            debug!(
                portion = portion_index,
                chunk = chunk_index,
                current = self.portion_index,
                "Ignoring chunk outside the current portion"
            );
            return Ok(None);
        }
        if !self.pending_chunks.contains(&chunk_index) {
            debug!(
                portion = portion_index,
                chunk = chunk_index,
                "Ignoring duplicate chunk"
            );
            return Ok(None);
        }

        let expected_len = self.geometry.chunk_len(portion_index, chunk_index);
        if data.len() as u64 != expected_len {
            warn!(
                portion = portion_index,
                chunk = chunk_index,
                received = data.len(),
                expected = expected_len,
                "Discarding chunk with unexpected length"
            );
            return Ok(None);
        }
        if chunk_checksum(data) != checksum {
            let error = TransferError::ChunkValidationFailed {
                portion_index,
                chunk_index,
            };
            debug!(%error, "Discarding corrupt chunk");
            return Ok(None);
        }

        let Some(file) = self.file.as_mut() else {
            return Ok(None);
        };
        file.seek(SeekFrom::Start(
            self.geometry.chunk_offset(portion_index, chunk_index),
        ))
        .map_err(|e| TransferError::Io(e))?;
        file.write_all(data).map_err(|e| TransferError::Io(e))?;
        self.pending_chunks.remove(&chunk_index);

        Ok(Some(self.progress(now)))
    }

    /// Answers a portion-complete announcement.
    ///
    /// For the current portion this replies with the missing-chunk list, or
    /// confirms and advances when nothing is missing. Announcements for
    /// already-confirmed portions are confirmed again so the sender is not
    /// left waiting on a reply it never saw; announcements for portions the
    /// sender should not have reached yet are dropped.
    ///
    /// # Errors
    ///
    /// Fails only when flushing the completed file to disk fails.
    pub fn handle_portion_complete(&mut self, portion_index: u64) -> Result<Option<Message>> {
        if portion_index < self.portion_index {
            debug!(
                portion = portion_index,
                current = self.portion_index,
                "Re-confirming already complete portion"
            );
            return Ok(Some(Message::PortionCompleteConfirm { portion_index }));
        }
        if portion_index > self.portion_index || self.complete {
            debug!(
                portion = portion_index,
                current = self.portion_index,
                "Ignoring premature portion completion"
            );
            return Ok(None);
        }

        if !self.pending_chunks.is_empty() {
            let chunk_indexes: Vec<u16> = self.pending_chunks.iter().copied().collect();
            debug!(
                portion = portion_index,
                missing = chunk_indexes.len(),
                "Portion incomplete, requesting missing chunks"
            );
            return Ok(Some(Message::ChunksRemaining { chunk_indexes }));
        }

        let reply = Message::PortionCompleteConfirm {
            portion_index: self.portion_index,
        };
        if self.geometry.is_last_portion(self.portion_index) {
            if let Some(file) = self.file.as_ref() {
                file.sync_all().map_err(|e| TransferError::Io(e))?;
            }
            self.portion_index += 1;
            self.complete = true;
            info!(name = %self.display_name, "All portions received");
        } else {
            self.portion_index += 1;
            self.pending_chunks =
                (0..self.geometry.chunks_in_portion(self.portion_index) as u16).collect();
            debug!(portion = self.portion_index, "Portion confirmed, expecting next");
        }
        Ok(Some(reply))
    }

    /// Closes the temp file and verifies it holds the declared byte count.
    fn close_file(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all().map_err(|e| TransferError::Io(e))?;
            let written = file.metadata().map_err(|e| TransferError::Io(e))?.len();
            if written != self.geometry.file_size() {
                return Err(TransferError::TransferFailed(format!(
                    "received file holds {} bytes, expected {}",
                    written,
                    self.geometry.file_size()
                )));
            }
        }
        Ok(())
    }

    /// Moves the completed temp file to its final path.
    ///
    /// # Errors
    ///
    /// Fails if the transfer is not complete or the rename fails.
    pub fn finalize_rename(&mut self) -> Result<PathBuf> {
        if !self.complete {
            return Err(TransferError::ProtocolError(
                "cannot finalize an incomplete transfer".to_string(),
            ));
        }
        self.close_file()?;
        fs::rename(&self.temp_path, &self.final_path).map_err(|e| TransferError::Io(e))?;
        info!(path = %self.final_path.display(), "Stored received file");
        Ok(self.final_path.clone())
    }

    /// Hands the completed temp file to a streaming decrypt task that will
    /// produce the final path and delete the temp file when it finishes.
    ///
    /// # Errors
    ///
    /// Fails if the transfer is not complete or the received bytes do not
    /// start with a Groundfish file header.
    pub fn finalize_decrypt(&mut self) -> Result<FileDecryptTask> {
        if !self.complete {
            return Err(TransferError::ProtocolError(
                "cannot finalize an incomplete transfer".to_string(),
            ));
        }
        self.close_file()?;
        FileDecryptTask::new(&self.temp_path, &self.final_path, true)
    }

    /// Abandons the transfer and removes the partial temp file.
    pub fn cancel(&mut self) {
        self.file = None;
        if self.temp_path.exists() {
            if let Err(e) = fs::remove_file(&self.temp_path) {
                warn!(
                    path = %self.temp_path.display(),
                    error = %e,
                    "Failed to remove partial file"
                );
            }
        }
        info!(name = %self.display_name, "Inbound transfer abandoned");
    }

    pub fn progress(&self, now: Instant) -> ProgressEvent {
        let percent = portion_progress(
            self.portion_index,
            self.geometry.chunks_in_portion(self.portion_index),
            self.pending_chunks.len() as u64,
            self.geometry.portion_size(),
            self.geometry.file_size(),
        );
        ProgressEvent::new(
            &self.display_name,
            Direction::Download,
            percent,
            self.geometry.file_size(),
            now.duration_since(self.started_at),
        )
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn file_size(&self) -> u64 {
        self.geometry.file_size()
    }

    pub fn metadata(&self) -> &ReceiveMetadata {
        &self.metadata
    }

    pub fn portion_index(&self) -> u64 {
        self.portion_index
    }

    pub fn pending_chunks(&self) -> usize {
        self.pending_chunks.len()
    }
}
