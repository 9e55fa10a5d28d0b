//! Wire protocol messages for chunked file transfer.
//!
//! Every message travels as one length-prefixed frame: a little-endian u32
//! byte count followed by the payload. The payload starts with a one-byte
//! tag; all typed fields after it are little-endian. The decoder validates
//! every declared length against the bytes actually present before touching
//! them, so a malformed frame is dropped without desynchronizing the stream.

use crate::config::{
    CHUNK_CHECKSUM_LEN, MAX_CHUNKS_PER_PORTION, MAX_FRAME_SIZE, MAX_METADATA_LEN,
    MAX_WIRE_CHUNK_SIZE,
};
use crate::error::{Result, TransferError};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Message tags
const TAG_FILE_SEND_INIT: u8 = 0x01;
const TAG_FILE_RECEIVE_READY: u8 = 0x02;
const TAG_FILE_PORTION: u8 = 0x03;
const TAG_FILE_PORTION_COMPLETE: u8 = 0x04;
const TAG_FILE_CHUNKS_REMAINING: u8 = 0x05;
const TAG_FILE_PORTION_COMPLETE_CONFIRM: u8 = 0x06;
const TAG_TRANSFER_CANCELLED: u8 = 0x07;

/// Computes the checksum carried alongside every chunk: the first four bytes
/// of the SHA-256 digest of the chunk bytes.
pub fn chunk_checksum(data: &[u8]) -> [u8; CHUNK_CHECKSUM_LEN] {
    let digest = Sha256::digest(data);
    let mut checksum = [0u8; CHUNK_CHECKSUM_LEN];
    checksum.copy_from_slice(&digest[..CHUNK_CHECKSUM_LEN]);
    checksum
}

/// Which of the canceller's transfers a cancellation refers to, from the
/// canceller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDirection {
    /// The canceller was sending; the receiver of this message should drop
    /// its receive task.
    Outbound,
    /// The canceller was receiving; the receiver of this message should drop
    /// its send task.
    Inbound,
}

impl CancelDirection {
    fn as_byte(self) -> u8 {
        match self {
            CancelDirection::Outbound => 0,
            CancelDirection::Inbound => 1,
        }
    }

    fn from_byte(value: u8) -> Result<Self> {
        match value {
            0 => Ok(CancelDirection::Outbound),
            1 => Ok(CancelDirection::Inbound),
            other => Err(TransferError::MalformedPayload(format!(
                "unknown cancel direction {}",
                other
            ))),
        }
    }
}

/// A protocol message.
///
/// Metadata strings in `SendInit` are Groundfish payloads, opaque at this
/// layer. Chunk indices are portion-relative.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Announces an inbound file and its transfer geometry.
    SendInit {
        encrypted_name: Vec<u8>,
        encrypted_title: Vec<u8>,
        encrypted_description: Vec<u8>,
        type_id: u16,
        sub_type_id: u16,
        file_size: u64,
        chunk_size: u64,
        chunks_per_portion: u64,
    },
    /// Receiver has pre-allocated storage and is ready for chunks.
    ReceiveReady,
    /// One chunk of file data, fire-and-forget.
    Chunk {
        portion_index: u64,
        chunk_index: u16,
        checksum: [u8; CHUNK_CHECKSUM_LEN],
        data: Bytes,
    },
    /// Sender believes every chunk of the portion has been delivered.
    PortionComplete { portion_index: u64 },
    /// Receiver still misses these chunks of the current portion.
    ChunksRemaining { chunk_indexes: Vec<u16> },
    /// Receiver holds the complete portion; the sender may advance.
    PortionCompleteConfirm { portion_index: u64 },
    /// One side abandoned a transfer.
    Cancelled { direction: CancelDirection },
}

impl Message {
    /// Short name used in log lines.
    pub fn label(&self) -> &'static str {
        match self {
            Message::SendInit { .. } => "SendInit",
            Message::ReceiveReady => "ReceiveReady",
            Message::Chunk { .. } => "Chunk",
            Message::PortionComplete { .. } => "PortionComplete",
            Message::ChunksRemaining { .. } => "ChunksRemaining",
            Message::PortionCompleteConfirm { .. } => "PortionCompleteConfirm",
            Message::Cancelled { .. } => "Cancelled",
        }
    }

    /// Encodes the message payload, tag byte included but length prefix not.
    pub fn encode(&self) -> Vec<u8> {
        match self {
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
                let mut out = Vec::with_capacity(
                    1 + 12
                        + encrypted_name.len()
                        + encrypted_title.len()
                        + encrypted_description.len()
                        + 28,
                );
                out.push(TAG_FILE_SEND_INIT);
                for blob in [encrypted_name, encrypted_title, encrypted_description] {
                    out.extend_from_slice(&(blob.len() as i32).to_le_bytes());
                    out.extend_from_slice(blob);
                }
                out.extend_from_slice(&type_id.to_le_bytes());
                out.extend_from_slice(&sub_type_id.to_le_bytes());
                out.extend_from_slice(&(*file_size as i64).to_le_bytes());
                out.extend_from_slice(&(*chunk_size as i64).to_le_bytes());
                out.extend_from_slice(&(*chunks_per_portion as i64).to_le_bytes());
                out
            }
            Message::ReceiveReady => vec![TAG_FILE_RECEIVE_READY],
            Message::Chunk {
                portion_index,
                chunk_index,
                checksum,
                data,
            } => {
                let mut out = Vec::with_capacity(1 + 24 + 4 + CHUNK_CHECKSUM_LEN + data.len());
                out.push(TAG_FILE_PORTION);
                out.extend_from_slice(&(*portion_index as i64).to_le_bytes());
                out.extend_from_slice(&(*chunk_index as i64).to_le_bytes());
                out.extend_from_slice(&(data.len() as i64).to_le_bytes());
                out.extend_from_slice(&(CHUNK_CHECKSUM_LEN as i32).to_le_bytes());
                out.extend_from_slice(checksum);
                out.extend_from_slice(data);
                out
            }
            Message::PortionComplete { portion_index } => {
                let mut out = Vec::with_capacity(9);
                out.push(TAG_FILE_PORTION_COMPLETE);
                out.extend_from_slice(&(*portion_index as i64).to_le_bytes());
                out
            }
            Message::ChunksRemaining { chunk_indexes } => {
                let mut out = Vec::with_capacity(5 + 2 * chunk_indexes.len());
                out.push(TAG_FILE_CHUNKS_REMAINING);
                out.extend_from_slice(&(chunk_indexes.len() as i32).to_le_bytes());
                for index in chunk_indexes {
                    out.extend_from_slice(&index.to_le_bytes());
                }
                out
            }
            Message::PortionCompleteConfirm { portion_index } => {
                let mut out = Vec::with_capacity(9);
                out.push(TAG_FILE_PORTION_COMPLETE_CONFIRM);
                out.extend_from_slice(&(*portion_index as i64).to_le_bytes());
                out
            }
            Message::Cancelled { direction } => {
                vec![TAG_TRANSFER_CANCELLED, direction.as_byte()]
            }
        }
    }

    /// Decodes one message payload.
    ///
    /// # Errors
    ///
    /// Returns a `MalformedPayload` error naming the offending field if the
    /// payload is truncated, carries trailing bytes, declares a negative or
    /// out-of-range value, or states a checksum length other than four.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(payload);
        let tag = reader.read_u8("message tag")?;

        let message = match tag {
            TAG_FILE_SEND_INIT => {
                let encrypted_name = read_metadata_blob(&mut reader, "encrypted name")?;
                let encrypted_title = read_metadata_blob(&mut reader, "encrypted title")?;
                let encrypted_description =
                    read_metadata_blob(&mut reader, "encrypted description")?;
                let type_id = reader.read_u16("type id")?;
                let sub_type_id = reader.read_u16("subtype id")?;
                let file_size = non_negative(reader.read_i64("file size")?, "file size")?;
                let chunk_size = non_negative(reader.read_i64("chunk size")?, "chunk size")?;
                let chunks_per_portion = non_negative(
                    reader.read_i64("chunks per portion")?,
                    "chunks per portion",
                )?;
                Message::SendInit {
                    encrypted_name,
                    encrypted_title,
                    encrypted_description,
                    type_id,
                    sub_type_id,
                    file_size,
                    chunk_size,
                    chunks_per_portion,
                }
            }
            TAG_FILE_RECEIVE_READY => Message::ReceiveReady,
            TAG_FILE_PORTION => {
                let portion_index =
                    non_negative(reader.read_i64("portion index")?, "portion index")?;
                let chunk_index = chunk_index_from_wire(reader.read_i64("chunk index")?)?;
                let byte_length =
                    non_negative(reader.read_i64("chunk byte length")?, "chunk byte length")?;
                if byte_length > MAX_WIRE_CHUNK_SIZE {
                    return Err(TransferError::MalformedPayload(format!(
                        "chunk byte length {} exceeds the {} byte limit",
                        byte_length, MAX_WIRE_CHUNK_SIZE
                    )));
                }
                let checksum_length = reader.read_i32("checksum length")?;
                if checksum_length != CHUNK_CHECKSUM_LEN as i32 {
                    return Err(TransferError::MalformedPayload(format!(
                        "checksum length {} is not {}",
                        checksum_length, CHUNK_CHECKSUM_LEN
                    )));
                }
                let mut checksum = [0u8; CHUNK_CHECKSUM_LEN];
                checksum.copy_from_slice(reader.take(CHUNK_CHECKSUM_LEN, "chunk checksum")?);
                let data = reader.take(byte_length as usize, "chunk bytes")?;
                Message::Chunk {
                    portion_index,
                    chunk_index,
                    checksum,
                    data: Bytes::copy_from_slice(data),
                }
            }
            TAG_FILE_PORTION_COMPLETE => Message::PortionComplete {
                portion_index: non_negative(reader.read_i64("portion index")?, "portion index")?,
            },
            TAG_FILE_CHUNKS_REMAINING => {
                let count = reader.read_i32("remaining count")?;
                if count < 0 {
                    return Err(TransferError::MalformedPayload(format!(
                        "negative remaining count {}",
                        count
                    )));
                }
                if count as u64 > MAX_CHUNKS_PER_PORTION {
                    return Err(TransferError::MalformedPayload(format!(
                        "remaining count {} exceeds the {} chunk portion limit",
                        count, MAX_CHUNKS_PER_PORTION
                    )));
                }
                let mut chunk_indexes = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    chunk_indexes.push(reader.read_u16("remaining chunk index")?);
                }
                Message::ChunksRemaining { chunk_indexes }
            }
            TAG_FILE_PORTION_COMPLETE_CONFIRM => Message::PortionCompleteConfirm {
                portion_index: non_negative(reader.read_i64("portion index")?, "portion index")?,
            },
            TAG_TRANSFER_CANCELLED => Message::Cancelled {
                direction: CancelDirection::from_byte(reader.read_u8("cancel direction")?)?,
            },
            other => {
                return Err(TransferError::MalformedPayload(format!(
                    "unknown message tag 0x{:02x}",
                    other
                )))
            }
        };

        reader.finish()?;
        Ok(message)
    }

    /// Writes the message as one length-prefixed frame.
    ///
    /// Control messages are flushed immediately; chunk frames are left to
    /// batch in the writer so a tick burst goes out as one write.
    pub async fn write_to_stream<T>(&self, writer: &mut T) -> Result<()>
    where
        T: AsyncWrite + Unpin,
    {
        let payload = self.encode();
        writer
            .write_all(&(payload.len() as u32).to_le_bytes())
            .await
            .map_err(|e| TransferError::Io(e))?;
        writer
            .write_all(&payload)
            .await
            .map_err(|e| TransferError::Io(e))?;
        if !matches!(self, Message::Chunk { .. }) {
            writer.flush().await.map_err(|e| TransferError::Io(e))?;
        }
        Ok(())
    }

    /// Reads one length-prefixed frame and decodes it.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the peer closed the connection cleanly between
    /// frames. EOF in the middle of a frame is an I/O error, an oversized
    /// length prefix is a protocol error (the stream cannot be resynchronized
    /// past it), and a decode failure is a `MalformedPayload` error that
    /// leaves the stream aligned on the next frame.
    pub async fn read_from_stream<T>(reader: &mut T) -> Result<Option<Self>>
    where
        T: AsyncRead + Unpin,
    {
        let mut length_bytes = [0u8; 4];
        match reader.read_exact(&mut length_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(e) => return Err(TransferError::Io(e)),
        }

        let length = u32::from_le_bytes(length_bytes) as usize;
        if length == 0 {
            return Err(TransferError::MalformedPayload(
                "zero length frame".to_string(),
            ));
        }
        if length > MAX_FRAME_SIZE {
            return Err(TransferError::ProtocolError(format!(
                "frame of {} bytes exceeds the {} byte limit",
                length, MAX_FRAME_SIZE
            )));
        }

        let mut payload = vec![0u8; length];
        reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| TransferError::Io(e))?;
        Self::decode(&payload).map(Some)
    }
}

/// Bounds-checked cursor over one frame payload.
struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < len {
            return Err(TransferError::MalformedPayload(format!(
                "truncated while reading {}",
                what
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn read_u16(&mut self, what: &str) -> Result<u16> {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(self.take(2, what)?);
        Ok(u16::from_le_bytes(bytes))
    }

    fn read_i32(&mut self, what: &str) -> Result<i32> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4, what)?);
        Ok(i32::from_le_bytes(bytes))
    }

    fn read_i64(&mut self, what: &str) -> Result<i64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8, what)?);
        Ok(i64::from_le_bytes(bytes))
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(TransferError::MalformedPayload(format!(
                "{} trailing bytes after message",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

fn non_negative(value: i64, what: &str) -> Result<u64> {
    if value < 0 {
        return Err(TransferError::MalformedPayload(format!(
            "negative {}: {}",
            what, value
        )));
    }
    Ok(value as u64)
}

fn chunk_index_from_wire(value: i64) -> Result<u16> {
    if !(0..=u16::MAX as i64).contains(&value) {
        return Err(TransferError::MalformedPayload(format!(
            "chunk index {} outside the 16-bit range",
            value
        )));
    }
    Ok(value as u16)
}

fn read_metadata_blob(reader: &mut FieldReader<'_>, what: &str) -> Result<Vec<u8>> {
    let length = reader.read_i32(what)?;
    if length < 0 {
        return Err(TransferError::MalformedPayload(format!(
            "negative {} length {}",
            what, length
        )));
    }
    if length as usize > MAX_METADATA_LEN {
        return Err(TransferError::MalformedPayload(format!(
            "{} of {} bytes exceeds the {} byte limit",
            what, length, MAX_METADATA_LEN
        )));
    }
    Ok(reader.take(length as usize, what)?.to_vec())
}
