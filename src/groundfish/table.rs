//! Word list generation and persistence for the Groundfish cipher.
//!
//! A word list is 256 independently shuffled byte alphabets. Each "word" is a
//! permutation of the 256 possible byte values, so substitution through any
//! word is invertible by construction. The inverse table is materialized once
//! at generation time and persisted next to the forward table.

use crate::error::{Result, TransferError};
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs;
use std::path::Path;

/// Words per list, and byte values per word.
pub const TABLE_ROWS: usize = 256;

/// On-disk size of a persisted word list: a 4-byte version followed by the
/// forward and inverse tables.
pub const WORD_LIST_FILE_LEN: usize = 4 + 2 * TABLE_ROWS * TABLE_ROWS;

/// A versioned substitution table pair for the Groundfish cipher.
///
/// `forward[w][b]` gives the ciphertext byte for plaintext `b` under word
/// `w`; `inverse[w]` undoes it. Every row of `forward` is a permutation of
/// `0..=255`, checked at generation and at load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordList {
    version: u32,
    forward: Vec<[u8; TABLE_ROWS]>,
    inverse: Vec<[u8; TABLE_ROWS]>,
}

impl WordList {
    /// Generates a fresh word list by Fisher-Yates shuffling the identity
    /// alphabet once per word.
    ///
    /// Panics if a shuffled row is not a permutation; that would mean the
    /// table cannot be inverted and nothing encrypted under it could ever be
    /// recovered.
    pub fn generate<R: Rng + ?Sized>(version: u32, rng: &mut R) -> Self {
        let mut forward = Vec::with_capacity(TABLE_ROWS);
        for _ in 0..TABLE_ROWS {
            let mut row = [0u8; TABLE_ROWS];
            for (value, slot) in row.iter_mut().enumerate() {
                *slot = value as u8;
            }
            row.shuffle(rng);
            forward.push(row);
        }

        for (word, row) in forward.iter().enumerate() {
            assert!(
                is_permutation(row),
                "generated word {} is not a permutation",
                word
            );
        }

        let inverse = build_inverse(&forward);
        Self {
            version,
            forward,
            inverse,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Substitutes one plaintext byte through the given word.
    pub fn substitute(&self, word_index: u8, byte: u8) -> u8 {
        self.forward[word_index as usize][byte as usize]
    }

    /// Recovers one plaintext byte from its substitution under the given word.
    pub fn invert(&self, word_index: u8, byte: u8) -> u8 {
        self.inverse[word_index as usize][byte as usize]
    }

    /// Writes the word list to disk as raw little-endian binary.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut bytes = Vec::with_capacity(WORD_LIST_FILE_LEN);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        for row in &self.forward {
            bytes.extend_from_slice(row);
        }
        for row in &self.inverse {
            bytes.extend_from_slice(row);
        }
        fs::write(path, bytes).map_err(|e| TransferError::Io(e))?;
        Ok(())
    }

    /// Reads a word list back from disk, verifying the file length, that
    /// every forward row is a permutation, and that the stored inverse
    /// actually inverts the stored forward table.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` describing the corruption if any check fails.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| TransferError::Io(e))?;
        if bytes.len() != WORD_LIST_FILE_LEN {
            return Err(TransferError::ConfigError(format!(
                "word list file {} has {} bytes, expected {}",
                path.display(),
                bytes.len(),
                WORD_LIST_FILE_LEN
            )));
        }

        let mut version_bytes = [0u8; 4];
        version_bytes.copy_from_slice(&bytes[0..4]);
        let version = u32::from_le_bytes(version_bytes);

        let mut offset = 4;
        let mut read_table = || {
            let mut table = Vec::with_capacity(TABLE_ROWS);
            for _ in 0..TABLE_ROWS {
                let mut row = [0u8; TABLE_ROWS];
                row.copy_from_slice(&bytes[offset..offset + TABLE_ROWS]);
                table.push(row);
                offset += TABLE_ROWS;
            }
            table
        };
        let forward = read_table();
        let inverse = read_table();

        for (word, row) in forward.iter().enumerate() {
            if !is_permutation(row) {
                return Err(TransferError::ConfigError(format!(
                    "word list file {} is corrupt: word {} is not a permutation",
                    path.display(),
                    word
                )));
            }
        }
        if inverse != build_inverse(&forward) {
            return Err(TransferError::ConfigError(format!(
                "word list file {} is corrupt: inverse table does not match",
                path.display()
            )));
        }

        Ok(Self {
            version,
            forward,
            inverse,
        })
    }
}

fn is_permutation(row: &[u8; TABLE_ROWS]) -> bool {
    let mut seen = [false; TABLE_ROWS];
    for &value in row {
        if seen[value as usize] {
            return false;
        }
        seen[value as usize] = true;
    }
    true
}

fn build_inverse(forward: &[[u8; TABLE_ROWS]]) -> Vec<[u8; TABLE_ROWS]> {
    let mut inverse = vec![[0u8; TABLE_ROWS]; TABLE_ROWS];
    for (word, row) in forward.iter().enumerate() {
        for (plain, &cipher) in row.iter().enumerate() {
            inverse[word][cipher as usize] = plain as u8;
        }
    }
    inverse
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn test_list(version: u32) -> WordList {
        WordList::generate(version, &mut StdRng::seed_from_u64(0x6f72_6361))
    }

    #[test]
    fn test_every_word_round_trips() {
        let list = test_list(1);

        for word in 0..=255u8 {
            for byte in 0..=255u8 {
                let cipher = list.substitute(word, byte);
                assert_eq!(list.invert(word, cipher), byte);
            }
        }
    }

    #[test]
    fn test_generation_actually_scrambles() {
        let list = test_list(1);

        // With 256 independent shuffles, at least one word must differ from
        // the identity alphabet.
        let scrambled = (0..=255u8).any(|word| (0..=255u8).any(|b| list.substitute(word, b) != b));
        assert!(scrambled);
    }

    #[test]
    fn test_generation_is_seed_deterministic() {
        let a = WordList::generate(3, &mut StdRng::seed_from_u64(7));
        let b = WordList::generate(3, &mut StdRng::seed_from_u64(7));

        assert_eq!(a, b);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("wordlist.bin");

        let original = test_list(7);
        original.save(&path).unwrap();
        let loaded = WordList::load(&path).unwrap();

        assert_eq!(loaded.version(), 7);
        assert_eq!(loaded, original);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            WORD_LIST_FILE_LEN as u64
        );
    }

    #[test]
    fn test_load_rejects_truncated_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("wordlist.bin");
        std::fs::write(&path, vec![0u8; WORD_LIST_FILE_LEN - 1]).unwrap();

        match WordList::load(&path) {
            Err(TransferError::ConfigError(msg)) => assert!(msg.contains("expected")),
            other => panic!("Expected ConfigError, got {:?}", other),
        }
    }

    #[test]
    fn test_load_rejects_tampered_forward_table() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("wordlist.bin");
        test_list(1).save(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        // Duplicate a value inside the first word so it is no longer a
        // permutation.
        bytes[5] = bytes[4];
        std::fs::write(&path, bytes).unwrap();

        match WordList::load(&path) {
            Err(TransferError::ConfigError(msg)) => assert!(msg.contains("not a permutation")),
            other => panic!("Expected ConfigError, got {:?}", other),
        }
    }

    #[test]
    fn test_load_rejects_mismatched_inverse_table() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("wordlist.bin");
        test_list(1).save(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let inverse_start = 4 + TABLE_ROWS * TABLE_ROWS;
        bytes[inverse_start] = bytes[inverse_start].wrapping_add(1);
        std::fs::write(&path, bytes).unwrap();

        match WordList::load(&path) {
            Err(TransferError::ConfigError(msg)) => assert!(msg.contains("inverse")),
            other => panic!("Expected ConfigError, got {:?}", other),
        }
    }
}
