//! Upload client.
//!
//! Connects to a hosting server, announces one file and drives the send
//! state machine until the final portion is confirmed. The optional
//! pre-transfer Groundfish pass produces a temporary encrypted artifact that
//! is transmitted instead of the source and removed again afterwards.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::SockRef;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, TransferError};
use crate::groundfish::{stream::encrypt_file, CipherContext};
use crate::link::{LinkEvent, LinkOutput, TransferLink};
use crate::message::Message;
use crate::progress::ProgressDisplay;
use crate::sender::SendMetadata;
use crate::utils::format_speed;

/// What to send and how to describe it.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub source: PathBuf,
    pub title: String,
    pub description: String,
    pub type_id: u16,
    pub sub_type_id: u16,
    /// Encrypt the file with the active word list before transmission.
    pub encrypt: bool,
    pub show_progress: bool,
}

/// Applies TCP tuning to a connected stream. Nagle is always disabled; the
/// kernel buffer sizes are best-effort and fall back to the OS defaults.
///
/// # Errors
///
/// Fails only if `TCP_NODELAY` cannot be set.
pub fn tune_socket(
    stream: &TcpStream,
    send_buffer: Option<usize>,
    recv_buffer: Option<usize>,
) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| TransferError::NetworkError(format!("failed to set TCP_NODELAY: {}", e)))?;
    let sock = SockRef::from(stream);
    if let Some(size) = send_buffer {
        if let Err(e) = sock.set_send_buffer_size(size) {
            warn!(size, error = %e, "Failed to set SO_SNDBUF, using OS default");
        }
    }
    if let Some(size) = recv_buffer {
        if let Err(e) = sock.set_recv_buffer_size(size) {
            warn!(size, error = %e, "Failed to set SO_RCVBUF, using OS default");
        }
    }
    Ok(())
}

/// Reads frames off the socket and forwards them to the connection loop.
///
/// Malformed frames are forwarded as errors but reading continues, because
/// the length prefix keeps the stream aligned past a payload we could not
/// decode. Any other error, and clean EOF, ends the pump; the closed channel
/// tells the loop the connection is gone.
pub(crate) async fn read_messages(mut reader: OwnedReadHalf, tx: mpsc::Sender<Result<Message>>) {
    loop {
        match Message::read_from_stream(&mut reader).await {
            Ok(Some(message)) => {
                if tx.send(Ok(message)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => {
                let recoverable = matches!(error, TransferError::MalformedPayload(_));
                if tx.send(Err(error)).await.is_err() || !recoverable {
                    break;
                }
            }
        }
    }
}

/// Uploads one file to the configured server.
///
/// # Errors
///
/// Fails if the server is unreachable, rejects the transfer, or the
/// connection drops before the final portion is confirmed.
pub async fn upload(
    config: &Config,
    cipher: Arc<CipherContext>,
    options: UploadOptions,
) -> Result<()> {
    let file_name = options
        .source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| TransferError::FileNotFound(options.source.clone()))?;

    let (send_path, artifact) = if options.encrypt {
        let artifact = encrypted_artifact_path(&options.source);
        let written = encrypt_file(cipher.current(), &options.source, &artifact, rand::random())?;
        info!(
            artifact = %artifact.display(),
            bytes = written,
            "Encrypted file for transfer"
        );
        (artifact.clone(), Some(artifact))
    } else {
        (options.source.clone(), None)
    };

    let result = run_upload(config, cipher, &send_path, &file_name, &options).await;

    if let Some(artifact) = artifact {
        if let Err(e) = std::fs::remove_file(&artifact) {
            warn!(path = %artifact.display(), error = %e, "Failed to remove encrypted artifact");
        }
    }
    result
}

/// Sibling path for a Groundfish-encrypted copy of a file.
pub fn encrypted_artifact_path(source: &Path) -> PathBuf {
    let mut name = source
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".gf");
    source.with_file_name(name)
}

async fn run_upload(
    config: &Config,
    cipher: Arc<CipherContext>,
    send_path: &Path,
    file_name: &str,
    options: &UploadOptions,
) -> Result<()> {
    let address = format!(
        "{}:{}",
        config.client.server_address, config.client.server_port
    );
    info!(address = %address, file = %file_name, "Connecting to hosting server");
    let stream = TcpStream::connect(&address).await.map_err(|e| {
        TransferError::NetworkError(format!("failed to connect to {}: {}", address, e))
    })?;
    tune_socket(
        &stream,
        config.client.send_buffer_size,
        config.client.recv_buffer_size,
    )?;

    let mut link = TransferLink::new(cipher, config.transfer.clone());
    let metadata = SendMetadata {
        name: file_name.to_string(),
        title: options.title.clone(),
        description: options.description.clone(),
        type_id: options.type_id,
        sub_type_id: options.sub_type_id,
    };
    let announce = link.start_send(send_path, metadata)?;
    let total_bytes = link.send_task().map(|t| t.file_size()).unwrap_or(0);
    let display = options
        .show_progress
        .then(|| ProgressDisplay::new(file_name, total_bytes));

    let (reader, mut writer) = stream.into_split();
    let (inbound_tx, mut inbound_rx) = mpsc::channel(64);
    let reader_task = tokio::spawn(read_messages(reader, inbound_tx));

    let mut outcome: Option<Result<()>> = None;
    apply_output(&mut writer, announce, display.as_ref(), total_bytes, &mut outcome).await?;

    let mut tick = tokio::time::interval(Duration::from_millis(config.transfer.tick_interval_ms));
    let result = loop {
        if let Some(result) = outcome.take() {
            break result;
        }
        tokio::select! {
            inbound = inbound_rx.recv() => match inbound {
                Some(Ok(message)) => {
                    let output = link.handle_message(message, Instant::now());
                    apply_output(&mut writer, output, display.as_ref(), total_bytes, &mut outcome).await?;
                }
                Some(Err(TransferError::MalformedPayload(reason))) => {
                    warn!(reason = %reason, "Dropping malformed frame from server");
                }
                Some(Err(e)) => break Err(e),
                None => break Err(TransferError::NetworkError(
                    "server closed the connection mid-transfer".to_string(),
                )),
            },
            _ = tick.tick() => {
                for _ in 0..config.transfer.tick_burst {
                    let output = link.tick(Instant::now());
                    let emitted = !output.outbound.is_empty();
                    apply_output(&mut writer, output, display.as_ref(), total_bytes, &mut outcome).await?;
                    if !emitted {
                        break;
                    }
                }
                writer.flush().await.map_err(|e| TransferError::Io(e))?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, cancelling upload");
                let output = link.cancel_send();
                apply_output(&mut writer, output, display.as_ref(), total_bytes, &mut outcome).await?;
                writer.flush().await.map_err(|e| TransferError::Io(e))?;
                break Err(TransferError::Cancelled);
            }
        }
    };
    reader_task.abort();

    if let Some(display) = display {
        if result.is_ok() {
            display.finish();
        }
    }
    result
}

/// Writes outbound messages and reacts to link events.
async fn apply_output(
    writer: &mut OwnedWriteHalf,
    output: LinkOutput,
    display: Option<&ProgressDisplay>,
    total_bytes: u64,
    outcome: &mut Option<Result<()>>,
) -> Result<()> {
    for message in output.outbound {
        message.write_to_stream(writer).await?;
    }
    for event in output.events {
        match event {
            LinkEvent::Progress(progress) => {
                if let Some(display) = display {
                    display.apply(&progress);
                }
            }
            LinkEvent::SendCompleted { source, elapsed } => {
                let seconds = elapsed.as_secs_f64().max(0.001);
                info!(
                    file = %source.display(),
                    seconds = format!("{:.2}", seconds),
                    speed = %format_speed(total_bytes as f64 / seconds),
                    "Upload confirmed by server"
                );
                *outcome = Some(Ok(()));
            }
            LinkEvent::SendFailed { error } => {
                *outcome = Some(Err(TransferError::TransferFailed(error)));
            }
            LinkEvent::SendCancelledByPeer => {
                *outcome = Some(Err(TransferError::Cancelled));
            }
            other => debug!(event = ?other, "Ignoring event with no upload meaning"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_path_appends_extension() {
        assert_eq!(
            encrypted_artifact_path(Path::new("/data/report.pdf")),
            PathBuf::from("/data/report.pdf.gf")
        );
        assert_eq!(
            encrypted_artifact_path(Path::new("archive")),
            PathBuf::from("archive.gf")
        );
    }
}
