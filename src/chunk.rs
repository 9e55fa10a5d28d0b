//! Chunk and portion geometry for a single transfer.
//!
//! A file is cut into fixed-size chunks, and chunks are grouped into portions.
//! Chunks are the unit of wire transmission; portions are the unit of
//! acknowledgement. All derived quantities (counts, offsets, tail lengths)
//! come from the ceiling-division arithmetic in this module so the sender and
//! the receiver always agree on the layout.

use crate::error::TransferError;

/// Geometry of one transfer: file size plus the negotiated chunk and portion
/// dimensions, with every derived count and offset computed on demand.
///
/// Chunk indices are portion-relative and fit in `u16`, matching the 16-bit
/// chunk index field of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferGeometry {
    file_size: u64,
    chunk_size: u64,
    chunks_per_portion: u64,
}

impl TransferGeometry {
    /// Creates the geometry for a transfer.
    ///
    /// # Errors
    ///
    /// Returns a `ProtocolError` if `chunk_size` is zero or if
    /// `chunks_per_portion` is zero or too wide for 16-bit chunk indices.
    pub fn new(
        file_size: u64,
        chunk_size: u64,
        chunks_per_portion: u64,
    ) -> Result<Self, TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::ProtocolError(
                "chunk size must be at least 1".to_string(),
            ));
        }
        if chunks_per_portion == 0 || chunks_per_portion > u16::MAX as u64 {
            return Err(TransferError::ProtocolError(format!(
                "chunks per portion {} outside the 1..={} range",
                chunks_per_portion,
                u16::MAX
            )));
        }
        Ok(Self {
            file_size,
            chunk_size,
            chunks_per_portion,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunks_per_portion(&self) -> u64 {
        self.chunks_per_portion
    }

    /// Nominal byte size of a full portion.
    pub fn portion_size(&self) -> u64 {
        self.chunk_size * self.chunks_per_portion
    }

    /// Total number of chunks in the file, counting a short tail chunk.
    pub fn chunk_count(&self) -> u64 {
        self.file_size.div_ceil(self.chunk_size)
    }

    /// Total number of portions in the file, counting a short tail portion.
    pub fn portion_count(&self) -> u64 {
        self.chunk_count().div_ceil(self.chunks_per_portion)
    }

    /// Number of chunks carried by the given portion. Zero for a portion
    /// index past the end of the file.
    pub fn chunks_in_portion(&self, portion_index: u64) -> u64 {
        let consumed = portion_index.saturating_mul(self.chunks_per_portion);
        self.chunk_count()
            .saturating_sub(consumed)
            .min(self.chunks_per_portion)
    }

    /// Byte offset of the given portion within the file.
    pub fn portion_offset(&self, portion_index: u64) -> u64 {
        portion_index * self.portion_size()
    }

    /// Byte length of the given portion, shorter than `portion_size` only
    /// for the tail portion. Zero for a portion index past the end.
    pub fn portion_len(&self, portion_index: u64) -> u64 {
        self.file_size
            .saturating_sub(self.portion_offset(portion_index))
            .min(self.portion_size())
    }

    /// Absolute byte offset of a chunk, addressed by portion and
    /// portion-relative chunk index.
    pub fn chunk_offset(&self, portion_index: u64, chunk_index: u16) -> u64 {
        self.portion_offset(portion_index) + chunk_index as u64 * self.chunk_size
    }

    /// Byte length of a chunk, shorter than `chunk_size` only for the final
    /// chunk of the file. Zero for a chunk past the end.
    pub fn chunk_len(&self, portion_index: u64, chunk_index: u16) -> u64 {
        self.file_size
            .saturating_sub(self.chunk_offset(portion_index, chunk_index))
            .min(self.chunk_size)
    }

    pub fn is_last_portion(&self, portion_index: u64) -> bool {
        self.portion_count() > 0 && portion_index == self.portion_count() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FILE_CHUNKS_PER_PORTION, FILE_CHUNK_SIZE};

    fn geometry(file_size: u64) -> TransferGeometry {
        TransferGeometry::new(file_size, FILE_CHUNK_SIZE, FILE_CHUNKS_PER_PORTION).unwrap()
    }

    #[test]
    fn test_chunk_and_portion_counts() {
        let cases = [
            (0u64, 0u64, 0u64),
            (1, 1, 1),
            (1023, 1, 1),
            (1024, 1, 1),
            (1025, 2, 1),
            (512_000, 500, 1),
            (512_001, 501, 2),
            (1_200_000, 1172, 3),
        ];

        for (file_size, chunks, portions) in cases {
            let g = geometry(file_size);
            assert_eq!(g.chunk_count(), chunks, "chunk count for {}", file_size);
            assert_eq!(
                g.portion_count(),
                portions,
                "portion count for {}",
                file_size
            );
        }
    }

    #[test]
    fn test_tail_portion_width() {
        let g = geometry(1_200_000);

        assert_eq!(g.chunks_in_portion(0), 500);
        assert_eq!(g.chunks_in_portion(1), 500);
        assert_eq!(g.chunks_in_portion(2), 172);
        assert_eq!(g.chunks_in_portion(3), 0);
    }

    #[test]
    fn test_portion_offsets_and_lengths() {
        let g = geometry(1_200_000);

        assert_eq!(g.portion_size(), 512_000);
        assert_eq!(g.portion_offset(0), 0);
        assert_eq!(g.portion_offset(2), 1_024_000);
        assert_eq!(g.portion_len(0), 512_000);
        assert_eq!(g.portion_len(2), 176_000);
        assert_eq!(g.portion_len(3), 0);
    }

    #[test]
    fn test_chunk_offsets_and_lengths() {
        let g = geometry(1_200_000);

        assert_eq!(g.chunk_len(0, 0), 1024);
        assert_eq!(g.chunk_offset(1, 0), 512_000);
        assert_eq!(g.chunk_offset(2, 171), 1_199_104);
        // The final chunk carries only the remainder of the file.
        assert_eq!(g.chunk_len(2, 171), 896);
        assert_eq!(g.chunk_offset(2, 171) + g.chunk_len(2, 171), 1_200_000);
    }

    #[test]
    fn test_exact_multiple_has_full_tail_chunk() {
        let g = geometry(2048);

        assert_eq!(g.chunk_count(), 2);
        assert_eq!(g.chunk_len(0, 1), 1024);
    }

    #[test]
    fn test_single_byte_file() {
        let g = geometry(1);

        assert_eq!(g.chunks_in_portion(0), 1);
        assert_eq!(g.chunk_len(0, 0), 1);
        assert_eq!(g.portion_len(0), 1);
        assert!(g.is_last_portion(0));
    }

    #[test]
    fn test_empty_file_is_total() {
        let g = geometry(0);

        assert_eq!(g.chunk_count(), 0);
        assert_eq!(g.portion_count(), 0);
        assert_eq!(g.chunks_in_portion(0), 0);
        assert_eq!(g.portion_len(0), 0);
        assert!(!g.is_last_portion(0));
    }

    #[test]
    fn test_portion_lengths_sum_to_file_size() {
        let g = geometry(1_200_000);
        let total: u64 = (0..g.portion_count()).map(|p| g.portion_len(p)).sum();

        assert_eq!(total, 1_200_000);
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        assert!(TransferGeometry::new(100, 0, 500).is_err());
    }

    #[test]
    fn test_rejects_wide_portion() {
        assert!(TransferGeometry::new(100, 1024, 0).is_err());
        assert!(TransferGeometry::new(100, 1024, u16::MAX as u64 + 1).is_err());
    }
}
