//! Groundfish codec for short metadata buffers.
//!
//! An encrypted payload is a 9-byte header followed by the ciphertext: the
//! word list version (i32), the plaintext length (i32) and the starting word
//! index (u8), all little-endian. Each plaintext byte is substituted through
//! the word at the walking index, which wraps past 255.

use crate::error::{Result, TransferError};
use super::table::WordList;

/// Bytes of header before the ciphertext begins.
pub const PAYLOAD_HEADER_LEN: usize = 9;

/// Parsed header of an encrypted payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub version: u32,
    pub length: usize,
    pub start_index: u8,
}

/// Parses and validates the header of an encrypted payload.
///
/// # Errors
///
/// Returns a `MalformedPayload` error if the buffer is shorter than the
/// header, declares a negative version or length, or does not carry exactly
/// the declared number of ciphertext bytes.
pub fn parse_header(payload: &[u8]) -> Result<PayloadHeader> {
    if payload.len() < PAYLOAD_HEADER_LEN {
        return Err(TransferError::MalformedPayload(format!(
            "encrypted payload of {} bytes is shorter than its {} byte header",
            payload.len(),
            PAYLOAD_HEADER_LEN
        )));
    }

    let mut field = [0u8; 4];
    field.copy_from_slice(&payload[0..4]);
    let version = i32::from_le_bytes(field);
    field.copy_from_slice(&payload[4..8]);
    let length = i32::from_le_bytes(field);

    if version < 0 {
        return Err(TransferError::MalformedPayload(format!(
            "encrypted payload declares negative word list version {}",
            version
        )));
    }
    if length < 0 {
        return Err(TransferError::MalformedPayload(format!(
            "encrypted payload declares negative length {}",
            length
        )));
    }
    if payload.len() - PAYLOAD_HEADER_LEN != length as usize {
        return Err(TransferError::MalformedPayload(format!(
            "encrypted payload declares {} ciphertext bytes but carries {}",
            length,
            payload.len() - PAYLOAD_HEADER_LEN
        )));
    }

    Ok(PayloadHeader {
        version: version as u32,
        length: length as usize,
        start_index: payload[8],
    })
}

/// Encrypts a plaintext buffer under the given word list, starting the word
/// index walk at `start_index`.
pub fn encrypt(table: &WordList, plaintext: &[u8], start_index: u8) -> Vec<u8> {
    debug_assert!(plaintext.len() <= i32::MAX as usize);

    let mut out = Vec::with_capacity(PAYLOAD_HEADER_LEN + plaintext.len());
    out.extend_from_slice(&(table.version() as i32).to_le_bytes());
    out.extend_from_slice(&(plaintext.len() as i32).to_le_bytes());
    out.push(start_index);

    let mut index = start_index;
    for &byte in plaintext {
        out.push(table.substitute(index, byte));
        index = index.wrapping_add(1);
    }
    out
}

/// Decrypts a payload with a word list the caller already selected for the
/// payload's version.
///
/// # Errors
///
/// Returns a `MalformedPayload` error if the header fails validation.
pub fn decrypt(table: &WordList, payload: &[u8]) -> Result<Vec<u8>> {
    let header = parse_header(payload)?;

    let mut out = Vec::with_capacity(header.length);
    let mut index = header.start_index;
    for &byte in &payload[PAYLOAD_HEADER_LEN..] {
        out.push(table.invert(index, byte));
        index = index.wrapping_add(1);
    }
    Ok(out)
}
