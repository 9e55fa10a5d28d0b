//! Ferry - portion-acknowledged file hosting library.
//!
//! Ferry moves files over TCP in fixed-size chunks grouped into portions.
//! Chunks are fire-and-forget; acknowledgement happens once per portion, and
//! only chunks the receiver reports missing are ever sent again. File names
//! and descriptive metadata travel obfuscated by the Groundfish substitution
//! cipher, which can also encrypt whole files before they leave the disk.
//!
//! # Features
//!
//! - **Portion-level reliability**: one round-trip per 500 chunks, exact
//!   missing-chunk retransmission, no per-chunk ACKs
//! - **Transport-free state machines**: sender and receiver run without
//!   sockets, so the whole protocol is testable in memory
//! - **Groundfish obfuscation**: versioned 256x256 substitution tables with
//!   rotation and archived decryption of older content
//! - **Hosted-file registry**: completed uploads are recorded with checksums
//!   for later listing
//!
//! # Example
//!
//! ```no_run
//! use ferry::{server::HostServer, registry::Registry, CipherContext, Config};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn serve() -> Result<(), ferry::TransferError> {
//! let config = Config::load_or_create(Path::new("ferry.toml"))?;
//! let cipher = Arc::new(CipherContext::load_or_generate(Path::new("./groundfish"))?);
//! let registry = Registry::load_or_create(Path::new(&config.server.registry_path))?;
//! let server = HostServer::new(config.server.clone(), config.transfer.clone(), cipher, registry);
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod client;
pub mod config;
pub mod error;
pub mod groundfish;
pub mod link;
pub mod message;
pub mod progress;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod server;
pub mod utils;

pub use chunk::TransferGeometry;
pub use config::Config;
pub use error::{Result, TransferError};
pub use groundfish::CipherContext;
pub use link::TransferLink;
pub use message::Message;
pub use receiver::FileReceiveTask;
pub use sender::FileSendTask;

// Re-export commonly used types for convenience
pub use bytes;
pub use serde;
pub use tokio;
