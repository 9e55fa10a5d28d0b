//! Per-connection transfer orchestration.
//!
//! A [`TransferLink`] owns at most one [`FileSendTask`] and one
//! [`FileReceiveTask`] and routes decoded messages between them. The
//! connection loop feeds it inbound messages and clock ticks; the link hands
//! back outbound messages plus [`LinkEvent`]s for whatever the caller wants
//! to do about progress, completion and failure. Keeping the link free of
//! sockets is what lets the whole protocol run in tests without a network.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{
    TransferConfig, MAX_CHUNKS_PER_PORTION, MAX_PORTION_BYTES, MAX_WIRE_CHUNK_SIZE,
};
use crate::error::{Result, TransferError};
use crate::groundfish::{CipherContext, FileDecryptTask};
use crate::message::{CancelDirection, Message};
use crate::progress::ProgressEvent;
use crate::receiver::{FileReceiveTask, ReceiveMetadata};
use crate::sender::{FileSendTask, SendMetadata};

/// How inbound announcements are admitted and where received files land.
#[derive(Debug, Clone)]
pub struct ReceivePolicy {
    pub output_directory: PathBuf,
    /// Run received files through Groundfish decryption before hosting them.
    pub decrypt_received: bool,
    pub max_file_size: u64,
}

/// Something the connection loop should surface: progress, completion, or a
/// torn-down transfer.
#[derive(Debug)]
pub enum LinkEvent {
    SendCompleted { source: PathBuf, elapsed: Duration },
    SendFailed { error: String },
    SendCancelledByPeer,
    ReceiveStarted { name: String, file_size: u64 },
    ReceiveCompleted(CompletedReceive),
    ReceiveFailed { error: String },
    ReceiveCancelledByPeer,
    Progress(ProgressEvent),
}

/// A finished inbound transfer, ready for the hosted-file registry.
#[derive(Debug, Clone)]
pub struct CompletedReceive {
    pub path: PathBuf,
    pub name: String,
    /// Size as declared on the wire; the hosted file may be smaller after
    /// decryption strips the Groundfish header.
    pub file_size: u64,
    pub metadata: ReceiveMetadata,
}

/// Messages to write and events to surface after one link step.
#[derive(Debug, Default)]
pub struct LinkOutput {
    pub outbound: Vec<Message>,
    pub events: Vec<LinkEvent>,
}

impl LinkOutput {
    fn push_message(&mut self, message: Message) {
        self.outbound.push(message);
    }

    fn push_event(&mut self, event: LinkEvent) {
        self.events.push(event);
    }
}

/// Routes protocol messages between the tasks living on one connection.
pub struct TransferLink {
    cipher: Arc<CipherContext>,
    transfer: TransferConfig,
    receive_policy: Option<ReceivePolicy>,
    send_task: Option<FileSendTask>,
    receive_task: Option<FileReceiveTask>,
    decrypt_task: Option<(FileDecryptTask, CompletedReceive)>,
}

impl TransferLink {
    pub fn new(cipher: Arc<CipherContext>, transfer: TransferConfig) -> Self {
        Self {
            cipher,
            transfer,
            receive_policy: None,
            send_task: None,
            receive_task: None,
            decrypt_task: None,
        }
    }

    /// Allows this link to accept inbound transfers under the given policy.
    /// Links without a policy drop inbound announcements.
    pub fn with_receive_policy(mut self, policy: ReceivePolicy) -> Self {
        self.receive_policy = Some(policy);
        self
    }

    /// Starts an outbound transfer. The returned output carries the init
    /// message to deliver.
    ///
    /// # Errors
    ///
    /// Fails if a send is already in flight or the source file cannot be
    /// prepared.
    pub fn start_send(&mut self, source: &Path, metadata: SendMetadata) -> Result<LinkOutput> {
        if self.send_task.as_ref().is_some_and(|t| !t.is_complete()) {
            return Err(TransferError::ProtocolError(
                "a send task is already active on this connection".to_string(),
            ));
        }
        let (task, init) = FileSendTask::new(
            source,
            metadata,
            &self.cipher,
            self.transfer.chunk_size,
            self.transfer.chunks_per_portion,
            Duration::from_millis(self.transfer.remind_interval_ms),
        )?;
        self.send_task = Some(task);
        let mut output = LinkOutput::default();
        output.push_message(init);
        Ok(output)
    }

    /// Abandons the outbound transfer, telling the peer to drop its receive
    /// state.
    pub fn cancel_send(&mut self) -> LinkOutput {
        let mut output = LinkOutput::default();
        if self.send_task.take().is_some() {
            info!("Cancelling outbound transfer");
            output.push_message(Message::Cancelled {
                direction: CancelDirection::Outbound,
            });
        }
        output
    }

    /// Abandons the inbound transfer and its partial file, telling the peer
    /// to drop its send state.
    pub fn cancel_receive(&mut self) -> LinkOutput {
        let mut output = LinkOutput::default();
        if let Some(mut task) = self.receive_task.take() {
            task.cancel();
            output.push_message(Message::Cancelled {
                direction: CancelDirection::Inbound,
            });
        }
        output
    }

    /// Routes one decoded message to the task it belongs to.
    ///
    /// Handlers tolerate duplicates and stale indices, so the caller can
    /// feed every message it reads without ordering guarantees beyond what
    /// the stream provides. Messages for an absent task are logged and
    /// dropped.
    pub fn handle_message(&mut self, message: Message, now: Instant) -> LinkOutput {
        let mut output = LinkOutput::default();
        match message {
            Message::SendInit {
                encrypted_name,
                encrypted_title,
                encrypted_description,
                type_id,
                sub_type_id,
                file_size,
                chunk_size,
                chunks_per_portion,
            } => {
                let metadata = ReceiveMetadata {
                    encrypted_name,
                    encrypted_title,
                    encrypted_description,
                    type_id,
                    sub_type_id,
                };
                self.handle_send_init(metadata, file_size, chunk_size, chunks_per_portion, &mut output);
            }
            Message::ReceiveReady => match self.send_task.as_mut() {
                Some(task) => task.handle_receive_ready(),
                None => debug!("Ignoring ReceiveReady without a send task"),
            },
            Message::Chunk {
                portion_index,
                chunk_index,
                checksum,
                data,
            } => {
                let Some(task) = self.receive_task.as_mut() else {
                    debug!("Ignoring chunk without a receive task");
                    return output;
                };
                match task.handle_chunk(portion_index, chunk_index, checksum, &data, now) {
                    Ok(Some(progress)) => output.push_event(LinkEvent::Progress(progress)),
                    Ok(None) => {}
                    Err(e) => self.fail_receive(e, &mut output),
                }
            }
            Message::PortionComplete { portion_index } => {
                let Some(task) = self.receive_task.as_mut() else {
                    debug!(
                        portion = portion_index,
                        "Ignoring portion completion without a receive task"
                    );
                    return output;
                };
                let was_complete = task.is_complete();
                match task.handle_portion_complete(portion_index) {
                    Ok(Some(reply)) => {
                        output.push_message(reply);
                        if !was_complete && self.receive_task.as_ref().is_some_and(|t| t.is_complete()) {
                            self.finalize_receive(&mut output);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => self.fail_receive(e, &mut output),
                }
            }
            Message::ChunksRemaining { chunk_indexes } => {
                let Some(task) = self.send_task.as_mut() else {
                    debug!("Ignoring chunks-remaining without a send task");
                    return output;
                };
                if let Err(e) = task.handle_chunks_remaining(&chunk_indexes) {
                    warn!(error = %e, "Dropping invalid chunks-remaining report");
                }
            }
            Message::PortionCompleteConfirm { portion_index } => {
                let Some(task) = self.send_task.as_mut() else {
                    debug!(
                        portion = portion_index,
                        "Ignoring portion confirmation without a send task"
                    );
                    return output;
                };
                match task.handle_portion_complete_confirm(portion_index) {
                    Ok(true) => {
                        let elapsed = task.progress(now).elapsed;
                        output.push_event(LinkEvent::SendCompleted {
                            source: task.source_path().to_path_buf(),
                            elapsed,
                        });
                    }
                    Ok(false) => {}
                    Err(e) => self.fail_send(e, &mut output),
                }
            }
            Message::Cancelled { direction } => match direction {
                CancelDirection::Outbound => {
                    if let Some(mut task) = self.receive_task.take() {
                        task.cancel();
                        output.push_event(LinkEvent::ReceiveCancelledByPeer);
                    } else {
                        debug!("Peer cancelled a transfer we were not receiving");
                    }
                }
                CancelDirection::Inbound => {
                    if self.send_task.take().is_some() {
                        info!("Peer abandoned the inbound side of our transfer");
                        output.push_event(LinkEvent::SendCancelledByPeer);
                    } else {
                        debug!("Peer cancelled a transfer we were not sending");
                    }
                }
            },
        }
        output
    }

    fn handle_send_init(
        &mut self,
        metadata: ReceiveMetadata,
        file_size: u64,
        chunk_size: u64,
        chunks_per_portion: u64,
        output: &mut LinkOutput,
    ) {
        let Some(policy) = self.receive_policy.clone() else {
            warn!("Rejecting inbound transfer, this endpoint does not accept files");
            output.push_message(Message::Cancelled {
                direction: CancelDirection::Inbound,
            });
            return;
        };
        if self.receive_task.as_ref().is_some_and(|t| !t.is_complete()) {
            warn!("Rejecting inbound transfer, another receive is in flight");
            output.push_message(Message::Cancelled {
                direction: CancelDirection::Inbound,
            });
            return;
        }
        if let Err(e) = admit_geometry(file_size, chunk_size, chunks_per_portion, &policy) {
            warn!(error = %e, "Rejecting inbound transfer");
            output.push_message(Message::Cancelled {
                direction: CancelDirection::Inbound,
            });
            return;
        }

        let name = match self.cipher.decrypt(&metadata.encrypted_name) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!(error = %e, "Rejecting inbound transfer with undecryptable name");
                output.push_message(Message::Cancelled {
                    direction: CancelDirection::Inbound,
                });
                return;
            }
        };
        let Some(file_name) = sanitize_file_name(&name) else {
            warn!(raw = %name, "Rejecting inbound transfer with unusable file name");
            output.push_message(Message::Cancelled {
                direction: CancelDirection::Inbound,
            });
            return;
        };

        let final_path = policy.output_directory.join(&file_name);
        let temp_path = policy.output_directory.join(format!("{}.part", file_name));
        match FileReceiveTask::new(
            &file_name,
            &final_path,
            &temp_path,
            file_size,
            chunk_size,
            chunks_per_portion,
            metadata,
        ) {
            Ok((task, ready)) => {
                output.push_event(LinkEvent::ReceiveStarted {
                    name: file_name,
                    file_size,
                });
                self.receive_task = Some(task);
                output.push_message(ready);
            }
            Err(e) => {
                warn!(error = %e, "Failed to prepare inbound transfer");
                output.push_message(Message::Cancelled {
                    direction: CancelDirection::Inbound,
                });
            }
        }
    }

    /// Moves a fully received file into place, through the decrypt pass when
    /// the policy asks for one. Files that lack a Groundfish header are
    /// hosted as they arrived.
    fn finalize_receive(&mut self, output: &mut LinkOutput) {
        let Some(mut task) = self.receive_task.take() else {
            return;
        };
        let decrypt = self
            .receive_policy
            .as_ref()
            .is_some_and(|p| p.decrypt_received);
        let completed = CompletedReceive {
            path: task.final_path().to_path_buf(),
            name: task.display_name().to_string(),
            file_size: task.file_size(),
            metadata: task.metadata().clone(),
        };

        if decrypt {
            match task.finalize_decrypt() {
                Ok(decrypt_task) => {
                    debug!(name = %completed.name, "Decrypting received file");
                    self.decrypt_task = Some((decrypt_task, completed));
                    self.receive_task = Some(task);
                    return;
                }
                Err(TransferError::MalformedPayload(e)) => {
                    debug!(
                        name = %completed.name,
                        reason = %e,
                        "Received file is not Groundfish encrypted, hosting as-is"
                    );
                }
                Err(e) => {
                    self.fail_receive_task(task, e, output);
                    return;
                }
            }
        }

        match task.finalize_rename() {
            Ok(_) => {
                output.push_event(LinkEvent::ReceiveCompleted(completed));
                self.receive_task = Some(task);
            }
            Err(e) => self.fail_receive_task(task, e, output),
        }
    }

    fn fail_receive(&mut self, error: TransferError, output: &mut LinkOutput) {
        if let Some(task) = self.receive_task.take() {
            self.fail_receive_task(task, error, output);
        }
    }

    fn fail_receive_task(
        &mut self,
        mut task: FileReceiveTask,
        error: TransferError,
        output: &mut LinkOutput,
    ) {
        warn!(name = %task.display_name(), error = %error, "Inbound transfer failed");
        task.cancel();
        output.push_message(Message::Cancelled {
            direction: CancelDirection::Inbound,
        });
        output.push_event(LinkEvent::ReceiveFailed {
            error: error.to_string(),
        });
    }

    fn fail_send(&mut self, error: TransferError, output: &mut LinkOutput) {
        if let Some(task) = self.send_task.take() {
            warn!(title = %task.display_title(), error = %error, "Outbound transfer failed");
            output.push_message(Message::Cancelled {
                direction: CancelDirection::Outbound,
            });
            output.push_event(LinkEvent::SendFailed {
                error: error.to_string(),
            });
        }
    }

    /// Advances time-driven work by one step: the send task emits a chunk or
    /// a reminder, and a pending decrypt pass processes one block.
    pub fn tick(&mut self, now: Instant) -> LinkOutput {
        let mut output = LinkOutput::default();

        if let Some(task) = self.send_task.as_mut() {
            let messages = task.tick(now);
            if messages
                .iter()
                .any(|m| matches!(m, Message::Chunk { .. }))
            {
                output.push_event(LinkEvent::Progress(task.progress(now)));
            }
            for message in messages {
                output.push_message(message);
            }
        }

        if let Some((mut decrypt_task, completed)) = self.decrypt_task.take() {
            match decrypt_task.advance(&self.cipher) {
                Ok(_) if decrypt_task.is_complete() => {
                    info!(path = %completed.path.display(), "Decrypted received file");
                    output.push_event(LinkEvent::ReceiveCompleted(completed));
                }
                Ok(_) => self.decrypt_task = Some((decrypt_task, completed)),
                Err(e) => {
                    warn!(name = %completed.name, error = %e, "Decrypt pass failed");
                    if let Err(abort_err) = decrypt_task.abort() {
                        warn!(error = %abort_err, "Failed to clean up decrypt output");
                    }
                    output.push_event(LinkEvent::ReceiveFailed {
                        error: e.to_string(),
                    });
                }
            }
        }

        output
    }

    /// True while a received file is still being decrypted into place.
    pub fn has_decrypt_work(&self) -> bool {
        self.decrypt_task.is_some()
    }

    /// True when no transfer or decrypt pass needs further ticks.
    pub fn is_idle(&self) -> bool {
        self.send_task.as_ref().map_or(true, |t| t.is_complete())
            && self.receive_task.as_ref().map_or(true, |t| t.is_complete())
            && self.decrypt_task.is_none()
    }

    pub fn send_task(&self) -> Option<&FileSendTask> {
        self.send_task.as_ref()
    }

    pub fn receive_task(&self) -> Option<&FileReceiveTask> {
        self.receive_task.as_ref()
    }
}

fn admit_geometry(
    file_size: u64,
    chunk_size: u64,
    chunks_per_portion: u64,
    policy: &ReceivePolicy,
) -> Result<()> {
    if file_size == 0 {
        return Err(TransferError::ProtocolError(
            "peer declared an empty file".to_string(),
        ));
    }
    if policy.max_file_size > 0 && file_size > policy.max_file_size {
        return Err(TransferError::ProtocolError(format!(
            "declared size {} exceeds the {} byte limit",
            file_size, policy.max_file_size
        )));
    }
    if chunk_size == 0 || chunk_size > MAX_WIRE_CHUNK_SIZE {
        return Err(TransferError::ProtocolError(format!(
            "declared chunk size {} outside 1..={}",
            chunk_size, MAX_WIRE_CHUNK_SIZE
        )));
    }
    if chunks_per_portion == 0 || chunks_per_portion > MAX_CHUNKS_PER_PORTION {
        return Err(TransferError::ProtocolError(format!(
            "declared chunks per portion {} outside 1..={}",
            chunks_per_portion, MAX_CHUNKS_PER_PORTION
        )));
    }
    if chunk_size * chunks_per_portion > MAX_PORTION_BYTES {
        return Err(TransferError::ProtocolError(format!(
            "declared portion of {} bytes exceeds the {} byte limit",
            chunk_size * chunks_per_portion,
            MAX_PORTION_BYTES
        )));
    }
    Ok(())
}

/// Reduces a peer-supplied name to a bare file name, refusing anything that
/// would escape the output directory.
fn sanitize_file_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let name = Path::new(trimmed).file_name()?.to_string_lossy().into_owned();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
