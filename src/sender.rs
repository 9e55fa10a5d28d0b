//! Outbound transfer state machine.
//!
//! A [`FileSendTask`] walks a file one portion at a time. Chunks within the
//! current portion are fire-and-forget; reliability lives entirely at the
//! portion boundary, where the task announces completion and waits for the
//! receiver to either confirm the portion or report the chunks it is still
//! missing. The task is transport-free: callers feed it decoded messages and
//! clock ticks, and it hands back the messages to put on the wire.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info};

use crate::chunk::TransferGeometry;
use crate::error::{Result, TransferError};
use crate::groundfish::CipherContext;
use crate::message::{chunk_checksum, Message};
use crate::progress::{portion_progress, Direction, ProgressEvent};

/// Lifecycle of an outbound transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// Init announced, waiting for the receiver to report ready.
    AwaitingReady,
    /// Emitting chunks from the current portion's pending set.
    Sending,
    /// All pending chunks emitted; waiting for the portion verdict.
    PendingComplete,
    /// Every portion confirmed.
    Complete,
}

/// Descriptive fields announced alongside a transfer.
///
/// The name, title and description travel Groundfish-encrypted; the type
/// identifiers are plain routing hints for the receiving side.
#[derive(Debug, Clone, Default)]
pub struct SendMetadata {
    pub name: String,
    pub title: String,
    pub description: String,
    pub type_id: u16,
    pub sub_type_id: u16,
}

/// Sends one file portion by portion, retrying only what the receiver
/// reports missing.
pub struct FileSendTask {
    source_path: PathBuf,
    display_title: String,
    file: File,
    geometry: TransferGeometry,
    state: SendState,
    portion_index: u64,
    chunks_pending_send: BTreeSet<u16>,
    portion_buffer: Vec<u8>,
    remind_interval: Duration,
    last_complete_sent: Instant,
    started_at: Instant,
}

impl FileSendTask {
    /// Opens the source file and prepares the announcement message.
    ///
    /// The file handle stays open for the lifetime of the task so the bytes
    /// on disk cannot change identity mid-transfer. Returns the task together
    /// with the init message the caller must deliver first.
    ///
    /// # Errors
    ///
    /// Fails if the file is missing, empty, or the chunk dimensions are
    /// out of range.
    pub fn new(
        source_path: &Path,
        metadata: SendMetadata,
        cipher: &CipherContext,
        chunk_size: u64,
        chunks_per_portion: u64,
        remind_interval: Duration,
    ) -> Result<(Self, Message)> {
        let file = File::open(source_path)
            .map_err(|_| TransferError::FileNotFound(source_path.to_path_buf()))?;
        let file_size = file.metadata().map_err(|e| TransferError::Io(e))?.len();
        if file_size == 0 {
            return Err(TransferError::ProtocolError(
                "cannot transfer an empty file".to_string(),
            ));
        }

        let geometry = TransferGeometry::new(file_size, chunk_size, chunks_per_portion)?;
        let init = Message::SendInit {
            encrypted_name: cipher.encrypt(metadata.name.as_bytes()),
            encrypted_title: cipher.encrypt(metadata.title.as_bytes()),
            encrypted_description: cipher.encrypt(metadata.description.as_bytes()),
            type_id: metadata.type_id,
            sub_type_id: metadata.sub_type_id,
            file_size,
            chunk_size,
            chunks_per_portion,
        };

        let display_title = if metadata.title.is_empty() {
            metadata.name.clone()
        } else {
            metadata.title.clone()
        };

        let now = Instant::now();
        let mut task = Self {
            source_path: source_path.to_path_buf(),
            display_title,
            file,
            geometry,
            state: SendState::AwaitingReady,
            portion_index: 0,
            chunks_pending_send: BTreeSet::new(),
            portion_buffer: Vec::new(),
            remind_interval,
            last_complete_sent: now,
            started_at: now,
        };
        task.buffer_portion(0)?;

        info!(
            file = %source_path.display(),
            size = file_size,
            portions = task.geometry.portion_count(),
            chunks = task.geometry.chunk_count(),
            "Prepared outbound transfer"
        );
        Ok((task, init))
    }

    /// Reads one portion into memory and marks every chunk in it pending.
    fn buffer_portion(&mut self, portion_index: u64) -> Result<()> {
        let len = self.geometry.portion_len(portion_index) as usize;
        self.portion_buffer.resize(len, 0);
        self.file
            .seek(SeekFrom::Start(self.geometry.portion_offset(portion_index)))
            .map_err(|e| TransferError::Io(e))?;
        self.file
            .read_exact(&mut self.portion_buffer)
            .map_err(|e| TransferError::Io(e))?;
        self.portion_index = portion_index;
        self.chunks_pending_send =
            (0..self.geometry.chunks_in_portion(portion_index) as u16).collect();
        Ok(())
    }

    fn chunk_message(&self, chunk_index: u16) -> Message {
        let start = chunk_index as usize * self.geometry.chunk_size() as usize;
        let len = self.geometry.chunk_len(self.portion_index, chunk_index) as usize;
        let data = Bytes::copy_from_slice(&self.portion_buffer[start..start + len]);
        Message::Chunk {
            portion_index: self.portion_index,
            chunk_index,
            checksum: chunk_checksum(&data),
            data,
        }
    }

    fn announce_portion_complete(&mut self, now: Instant) -> Message {
        self.state = SendState::PendingComplete;
        self.last_complete_sent = now;
        Message::PortionComplete {
            portion_index: self.portion_index,
        }
    }

    /// Marks the receiver ready; chunk emission starts on the next tick.
    /// Duplicate ready messages are ignored.
    pub fn handle_receive_ready(&mut self) {
        if self.state == SendState::AwaitingReady {
            self.state = SendState::Sending;
            debug!(title = %self.display_title, "Receiver ready, sending");
        }
    }

    /// Advances the task by one tick.
    ///
    /// While sending this emits the lowest-indexed pending chunk, plus the
    /// portion-complete announcement if that chunk was the last one. While
    /// waiting on a portion verdict it re-announces completion once per
    /// remind interval; chunks themselves are never re-sent unprompted.
    pub fn tick(&mut self, now: Instant) -> Vec<Message> {
        match self.state {
            SendState::AwaitingReady | SendState::Complete => Vec::new(),
            SendState::Sending => {
                let Some(&chunk_index) = self.chunks_pending_send.iter().next() else {
                    return vec![self.announce_portion_complete(now)];
                };
                self.chunks_pending_send.remove(&chunk_index);
                let mut out = vec![self.chunk_message(chunk_index)];
                if self.chunks_pending_send.is_empty() {
                    out.push(self.announce_portion_complete(now));
                }
                out
            }
            SendState::PendingComplete => {
                if now.duration_since(self.last_complete_sent) >= self.remind_interval {
                    self.last_complete_sent = now;
                    debug!(
                        portion = self.portion_index,
                        "Re-announcing portion completion"
                    );
                    vec![Message::PortionComplete {
                        portion_index: self.portion_index,
                    }]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// Replaces the pending set with the chunks the receiver reports missing.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if any reported index falls outside the
    /// current portion; the pending set is left untouched in that case.
    pub fn handle_chunks_remaining(&mut self, chunk_indexes: &[u16]) -> Result<()> {
        if self.state != SendState::Sending && self.state != SendState::PendingComplete {
            debug!(state = ?self.state, "Ignoring chunks-remaining report");
            return Ok(());
        }
        let width = self.geometry.chunks_in_portion(self.portion_index);
        if let Some(&bad) = chunk_indexes.iter().find(|&&i| i as u64 >= width) {
            return Err(TransferError::ProtocolError(format!(
                "receiver reported missing chunk {} outside portion {} ({} chunks)",
                bad, self.portion_index, width
            )));
        }
        self.chunks_pending_send = chunk_indexes.iter().copied().collect();
        self.state = SendState::Sending;
        debug!(
            portion = self.portion_index,
            missing = chunk_indexes.len(),
            "Receiver reported missing chunks, resending"
        );
        Ok(())
    }

    /// Handles a portion confirmation, advancing to the next portion or
    /// finishing the transfer. Returns `true` when the whole transfer just
    /// completed. Confirmations for any other portion index are stale
    /// retransmits and are ignored.
    ///
    /// # Errors
    ///
    /// Fails if the next portion cannot be read from disk.
    pub fn handle_portion_complete_confirm(&mut self, portion_index: u64) -> Result<bool> {
        if self.state == SendState::Complete || self.state == SendState::AwaitingReady {
            return Ok(false);
        }
        if portion_index != self.portion_index {
            debug!(
                confirmed = portion_index,
                current = self.portion_index,
                "Ignoring stale portion confirmation"
            );
            return Ok(false);
        }

        let next = self.portion_index + 1;
        if next < self.geometry.portion_count() {
            self.buffer_portion(next)?;
            self.state = SendState::Sending;
            debug!(portion = next, "Portion confirmed, advancing");
            Ok(false)
        } else {
            self.portion_index = next;
            self.chunks_pending_send.clear();
            self.portion_buffer = Vec::new();
            self.state = SendState::Complete;
            info!(title = %self.display_title, "Transfer complete");
            Ok(true)
        }
    }

    pub fn progress(&self, now: Instant) -> ProgressEvent {
        let percent = portion_progress(
            self.portion_index,
            self.geometry.chunks_in_portion(self.portion_index),
            self.chunks_pending_send.len() as u64,
            self.geometry.portion_size(),
            self.geometry.file_size(),
        );
        ProgressEvent::new(
            &self.display_title,
            Direction::Upload,
            percent,
            self.geometry.file_size(),
            now.duration_since(self.started_at),
        )
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == SendState::Complete
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn display_title(&self) -> &str {
        &self.display_title
    }

    pub fn file_size(&self) -> u64 {
        self.geometry.file_size()
    }

    pub fn portion_index(&self) -> u64 {
        self.portion_index
    }

    pub fn pending_chunks(&self) -> usize {
        self.chunks_pending_send.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FILE_CHUNKS_PER_PORTION, FILE_CHUNK_SIZE};
    use std::io::Write;
    use tempfile::TempDir;

    fn test_cipher(dir: &TempDir) -> CipherContext {
        CipherContext::load_or_generate(&dir.path().join("tables")).unwrap()
    }

    fn write_file(dir: &TempDir, name: &str, len: usize) -> PathBuf {
        let path = dir.path().join(name);
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut file = File::create(&path).unwrap();
        file.write_all(&data).unwrap();
        path
    }

    fn small_task(dir: &TempDir, len: usize, chunks_per_portion: u64) -> (FileSendTask, Message) {
        let cipher = test_cipher(dir);
        let path = write_file(dir, "source.bin", len);
        FileSendTask::new(
            &path,
            SendMetadata {
                name: "source.bin".to_string(),
                title: "Source".to_string(),
                ..Default::default()
            },
            &cipher,
            16,
            chunks_per_portion,
            Duration::from_millis(250),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_file_rejected() {
        let dir = TempDir::new().unwrap();
        let cipher = test_cipher(&dir);
        let path = write_file(&dir, "empty.bin", 0);
        let result = FileSendTask::new(
            &path,
            SendMetadata::default(),
            &cipher,
            FILE_CHUNK_SIZE,
            FILE_CHUNKS_PER_PORTION,
            Duration::from_millis(250),
        );
        assert!(matches!(result, Err(TransferError::ProtocolError(_))));
    }

    #[test]
    fn test_missing_file_rejected() {
        let dir = TempDir::new().unwrap();
        let cipher = test_cipher(&dir);
        let result = FileSendTask::new(
            dir.path().join("nope.bin").as_path(),
            SendMetadata::default(),
            &cipher,
            FILE_CHUNK_SIZE,
            FILE_CHUNKS_PER_PORTION,
            Duration::from_millis(250),
        );
        assert!(matches!(result, Err(TransferError::FileNotFound(_))));
    }

    #[test]
    fn test_init_message_declares_geometry() {
        let dir = TempDir::new().unwrap();
        let (task, init) = small_task(&dir, 100, 4);
        assert_eq!(task.state(), SendState::AwaitingReady);
        match init {
            Message::SendInit {
                file_size,
                chunk_size,
                chunks_per_portion,
                encrypted_name,
                ..
            } => {
                assert_eq!(file_size, 100);
                assert_eq!(chunk_size, 16);
                assert_eq!(chunks_per_portion, 4);
                assert!(!encrypted_name.is_empty());
            }
            other => panic!("expected SendInit, got {}", other.label()),
        }
    }

    #[test]
    fn test_no_chunks_before_receiver_ready() {
        let dir = TempDir::new().unwrap();
        let (mut task, _) = small_task(&dir, 100, 4);
        assert!(task.tick(Instant::now()).is_empty());
        task.handle_receive_ready();
        assert_eq!(task.state(), SendState::Sending);
        assert!(!task.tick(Instant::now()).is_empty());
    }

    #[test]
    fn test_chunks_emitted_lowest_index_first() {
        let dir = TempDir::new().unwrap();
        // 100 bytes, 16-byte chunks, 4 per portion: portion 0 holds chunks 0..4
        let (mut task, _) = small_task(&dir, 100, 4);
        task.handle_receive_ready();
        let now = Instant::now();
        let mut seen = Vec::new();
        for _ in 0..3 {
            for message in task.tick(now) {
                if let Message::Chunk { chunk_index, .. } = message {
                    seen.push(chunk_index);
                }
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_last_chunk_emits_portion_complete() {
        let dir = TempDir::new().unwrap();
        let (mut task, _) = small_task(&dir, 100, 4);
        task.handle_receive_ready();
        let now = Instant::now();
        for _ in 0..3 {
            task.tick(now);
        }
        let last = task.tick(now);
        assert_eq!(last.len(), 2);
        assert!(matches!(last[0], Message::Chunk { chunk_index: 3, .. }));
        assert!(matches!(
            last[1],
            Message::PortionComplete { portion_index: 0 }
        ));
        assert_eq!(task.state(), SendState::PendingComplete);
    }

    #[test]
    fn test_chunk_payload_matches_file_bytes() {
        let dir = TempDir::new().unwrap();
        let (mut task, _) = small_task(&dir, 100, 4);
        task.handle_receive_ready();
        let first = task.tick(Instant::now());
        match &first[0] {
            Message::Chunk {
                checksum, data, ..
            } => {
                let expected: Vec<u8> = (0..16).map(|i| (i % 251) as u8).collect();
                assert_eq!(&data[..], &expected[..]);
                assert_eq!(*checksum, chunk_checksum(data));
            }
            other => panic!("expected Chunk, got {}", other.label()),
        }
    }

    #[test]
    fn test_tail_chunk_is_short() {
        let dir = TempDir::new().unwrap();
        // 100 = 6 full 16-byte chunks + 4 bytes
        let (mut task, _) = small_task(&dir, 100, 4);
        task.handle_receive_ready();
        let now = Instant::now();
        for _ in 0..4 {
            task.tick(now);
        }
        task.handle_portion_complete_confirm(0).unwrap();
        let mut tail_len = None;
        for _ in 0..3 {
            for message in task.tick(now) {
                if let Message::Chunk {
                    chunk_index: 2,
                    data,
                    ..
                } = message
                {
                    tail_len = Some(data.len());
                }
            }
        }
        assert_eq!(tail_len, Some(4));
    }

    #[test]
    fn test_remind_timer_reannounces_portion_complete() {
        let dir = TempDir::new().unwrap();
        let (mut task, _) = small_task(&dir, 100, 4);
        task.handle_receive_ready();
        let start = Instant::now();
        for _ in 0..4 {
            task.tick(start);
        }
        assert_eq!(task.state(), SendState::PendingComplete);
        // Within the remind window nothing goes out.
        assert!(task.tick(start + Duration::from_millis(100)).is_empty());
        let reminded = task.tick(start + Duration::from_millis(300));
        assert_eq!(reminded.len(), 1);
        assert!(matches!(
            reminded[0],
            Message::PortionComplete { portion_index: 0 }
        ));
        // The remind clock resets after each announcement.
        assert!(task.tick(start + Duration::from_millis(400)).is_empty());
    }

    #[test]
    fn test_chunks_remaining_replaces_pending_set() {
        let dir = TempDir::new().unwrap();
        let (mut task, _) = small_task(&dir, 100, 4);
        task.handle_receive_ready();
        let now = Instant::now();
        for _ in 0..4 {
            task.tick(now);
        }
        task.handle_chunks_remaining(&[1, 3]).unwrap();
        assert_eq!(task.state(), SendState::Sending);
        assert_eq!(task.pending_chunks(), 2);

        let mut resent = Vec::new();
        for _ in 0..2 {
            for message in task.tick(now) {
                if let Message::Chunk { chunk_index, .. } = message {
                    resent.push(chunk_index);
                }
            }
        }
        assert_eq!(resent, vec![1, 3]);
        assert_eq!(task.state(), SendState::PendingComplete);
    }

    #[test]
    fn test_chunks_remaining_out_of_range_rejected() {
        let dir = TempDir::new().unwrap();
        let (mut task, _) = small_task(&dir, 100, 4);
        task.handle_receive_ready();
        let now = Instant::now();
        for _ in 0..4 {
            task.tick(now);
        }
        let result = task.handle_chunks_remaining(&[1, 9]);
        assert!(matches!(result, Err(TransferError::ProtocolError(_))));
        // Pending set untouched by the rejected report.
        assert_eq!(task.pending_chunks(), 0);
    }

    #[test]
    fn test_confirm_advances_to_next_portion() {
        let dir = TempDir::new().unwrap();
        let (mut task, _) = small_task(&dir, 100, 4);
        task.handle_receive_ready();
        let now = Instant::now();
        for _ in 0..4 {
            task.tick(now);
        }
        let done = task.handle_portion_complete_confirm(0).unwrap();
        assert!(!done);
        assert_eq!(task.portion_index(), 1);
        assert_eq!(task.state(), SendState::Sending);
        // Second portion of a 100-byte file holds chunks 4..7 (the tail).
        assert_eq!(task.pending_chunks(), 3);
    }

    #[test]
    fn test_stale_confirm_ignored() {
        let dir = TempDir::new().unwrap();
        let (mut task, _) = small_task(&dir, 100, 4);
        task.handle_receive_ready();
        let now = Instant::now();
        for _ in 0..4 {
            task.tick(now);
        }
        task.handle_portion_complete_confirm(0).unwrap();
        let done = task.handle_portion_complete_confirm(0).unwrap();
        assert!(!done);
        assert_eq!(task.portion_index(), 1);
        assert_eq!(task.pending_chunks(), 3);
    }

    #[test]
    fn test_final_confirm_completes_transfer() {
        let dir = TempDir::new().unwrap();
        let (mut task, _) = small_task(&dir, 100, 4);
        task.handle_receive_ready();
        let now = Instant::now();
        for _ in 0..4 {
            task.tick(now);
        }
        task.handle_portion_complete_confirm(0).unwrap();
        for _ in 0..3 {
            task.tick(now);
        }
        let done = task.handle_portion_complete_confirm(1).unwrap();
        assert!(done);
        assert!(task.is_complete());
        assert!(task.tick(now).is_empty());
        let progress = task.progress(now + Duration::from_millis(5));
        assert_eq!(progress.percent, 100.0);
    }

    #[test]
    fn test_progress_tracks_pending_chunks() {
        let dir = TempDir::new().unwrap();
        let (mut task, _) = small_task(&dir, 100, 4);
        task.handle_receive_ready();
        let now = Instant::now();
        let before = task.progress(now).percent;
        task.tick(now);
        task.tick(now);
        let after = task.progress(now).percent;
        assert!(after > before);
        assert!(after < 100.0);
    }
}
