//! Hosting server.
//!
//! Accepts client connections, receives announced files portion by portion
//! and records each completed upload in the hosted-file registry. Every
//! connection gets its own task and its own [`TransferLink`]; the registry
//! is the only shared state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::client::{read_messages, tune_socket};
use crate::config::{ServerConfig, TransferConfig};
use crate::error::{Result, TransferError};
use crate::groundfish::CipherContext;
use crate::link::{LinkEvent, LinkOutput, ReceivePolicy, TransferLink};
use crate::registry::{HostedFile, Registry};
use crate::utils::format_bytes;

/// The accept loop plus the shared state every connection handler needs.
pub struct HostServer {
    server: ServerConfig,
    transfer: TransferConfig,
    cipher: Arc<CipherContext>,
    registry: Arc<Mutex<Registry>>,
}

impl HostServer {
    pub fn new(
        server: ServerConfig,
        transfer: TransferConfig,
        cipher: Arc<CipherContext>,
        registry: Registry,
    ) -> Self {
        Self {
            server,
            transfer,
            cipher,
            registry: Arc::new(Mutex::new(registry)),
        }
    }

    /// Binds the configured address and serves until interrupted.
    ///
    /// # Errors
    ///
    /// Fails if the output directory cannot be created or the listener
    /// cannot bind.
    pub async fn run(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.server.output_directory)
            .await
            .map_err(|e| TransferError::Io(e))?;

        let address = format!("{}:{}", self.server.address, self.server.port);
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            TransferError::NetworkError(format!("failed to bind {}: {}", address, e))
        })?;
        info!(
            address = %address,
            output = %self.server.output_directory,
            "Hosting server listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.map_err(|e| {
                        TransferError::NetworkError(format!("accept failed: {}", e))
                    })?;
                    info!(peer = %peer, "Client connected");
                    let server = self.server.clone();
                    let transfer = self.transfer.clone();
                    let cipher = Arc::clone(&self.cipher);
                    let registry = Arc::clone(&self.registry);
                    tokio::spawn(async move {
                        match handle_connection(stream, server, transfer, cipher, registry).await {
                            Ok(()) => info!(peer = %peer, "Client disconnected"),
                            Err(e) => error!(peer = %peer, error = %e, "Connection failed"),
                        }
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}

/// Runs one connection: inbound frames and the tick clock are multiplexed
/// into the link, and whatever the link hands back goes out on the socket or
/// into the log and registry.
async fn handle_connection(
    stream: TcpStream,
    server: ServerConfig,
    transfer: TransferConfig,
    cipher: Arc<CipherContext>,
    registry: Arc<Mutex<Registry>>,
) -> Result<()> {
    tune_socket(&stream, server.send_buffer_size, server.recv_buffer_size)?;
    let policy = ReceivePolicy {
        output_directory: PathBuf::from(&server.output_directory),
        decrypt_received: server.decrypt_received,
        max_file_size: server.max_file_size,
    };
    let tick_burst = transfer.tick_burst;
    let tick_interval = Duration::from_millis(transfer.tick_interval_ms);
    let mut link = TransferLink::new(cipher, transfer).with_receive_policy(policy);

    let (reader, mut writer) = stream.into_split();
    let (inbound_tx, mut inbound_rx) = mpsc::channel(64);
    let reader_task = tokio::spawn(read_messages(reader, inbound_tx));

    let mut tick = tokio::time::interval(tick_interval);
    let result = loop {
        tokio::select! {
            inbound = inbound_rx.recv() => match inbound {
                Some(Ok(message)) => {
                    let output = link.handle_message(message, Instant::now());
                    dispatch_output(&mut writer, output, &registry).await?;
                }
                Some(Err(TransferError::MalformedPayload(reason))) => {
                    warn!(reason = %reason, "Dropping malformed frame");
                }
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            },
            _ = tick.tick() => {
                for _ in 0..tick_burst {
                    let output = link.tick(Instant::now());
                    let emitted = !output.outbound.is_empty();
                    dispatch_output(&mut writer, output, &registry).await?;
                    if !emitted && !link.has_decrypt_work() {
                        break;
                    }
                }
                writer.flush().await.map_err(|e| TransferError::Io(e))?;
            }
        }
    };
    reader_task.abort();
    result
}

/// Writes the link's outbound messages and acts on its events.
async fn dispatch_output(
    writer: &mut OwnedWriteHalf,
    output: LinkOutput,
    registry: &Arc<Mutex<Registry>>,
) -> Result<()> {
    for message in output.outbound {
        message.write_to_stream(writer).await?;
    }
    for event in output.events {
        match event {
            LinkEvent::ReceiveStarted { name, file_size } => {
                info!(
                    name = %name,
                    size = %format_bytes(file_size),
                    "Inbound transfer started"
                );
            }
            LinkEvent::Progress(progress) => {
                debug!(
                    name = %progress.title,
                    direction = %progress.direction,
                    percent = format!("{:.1}", progress.percent),
                    "Transfer progress"
                );
            }
            LinkEvent::ReceiveCompleted(completed) => {
                let record = HostedFile::from_hosted(&completed.path, &completed.metadata)?;
                info!(
                    path = %completed.path.display(),
                    size = %format_bytes(record.file_size),
                    checksum = format!("{:08x}", record.checksum),
                    "Hosting received file"
                );
                registry.lock().await.insert(record)?;
            }
            LinkEvent::ReceiveFailed { error } => {
                warn!(error = %error, "Inbound transfer failed");
            }
            LinkEvent::ReceiveCancelledByPeer => {
                info!("Peer cancelled its upload");
            }
            other => debug!(event = ?other, "Ignoring event with no hosting meaning"),
        }
    }
    Ok(())
}
