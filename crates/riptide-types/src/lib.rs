#![forbid(unsafe_code)]
//! Shared identifier and quantity types for Riptide.
//!
//! Defines the newtype ids used to address cached data
//! (`StorageId`, `PieceIndex`, `BlockIndex`) and the validated
//! `BlockSize` quantity used to convert between byte offsets and block
//! indices.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default block size: 16 KiB, the transfer unit used on the wire.
pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// Opaque handle identifying an attached storage.
///
/// A storage owns a set of pieces; the engine assigns these ids when a
/// storage is attached and never reuses them within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorageId(pub u64);

/// Index of a piece within a storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PieceIndex(pub u32);

/// Index of a block within a piece.
///
/// Always less than that piece's block count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u32);

/// Validated block size (must be a power of two in 1024..=1048576).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [1 KiB, 1 MiB].
    pub fn new(value: u32) -> Result<Self, TypeError> {
        if !value.is_power_of_two() || !(1024..=1_048_576).contains(&value) {
            return Err(TypeError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=1048576",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Convert a byte offset within a piece to a block index (truncating).
    #[must_use]
    pub fn block_of(self, byte_offset: u32) -> BlockIndex {
        BlockIndex(byte_offset >> self.shift())
    }

    /// Byte offset within the block for a byte offset within the piece.
    #[must_use]
    pub fn offset_in_block(self, byte_offset: u32) -> u32 {
        byte_offset & (self.0 - 1)
    }

    /// Number of blocks needed to hold `piece_len` bytes (rounding up).
    #[must_use]
    pub fn blocks_in_piece(self, piece_len: u32) -> u32 {
        piece_len.div_ceil(self.0)
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(DEFAULT_BLOCK_SIZE)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_accepts_powers_of_two_in_range() {
        for shift in 10..=20 {
            let value = 1_u32 << shift;
            assert_eq!(BlockSize::new(value).expect("valid").get(), value);
        }
    }

    #[test]
    fn block_size_rejects_out_of_range_and_non_powers() {
        assert!(BlockSize::new(512).is_err());
        assert!(BlockSize::new(2 * 1_048_576).is_err());
        assert!(BlockSize::new(12_000).is_err());
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn byte_to_block_conversions() {
        let bs = BlockSize::new(16 * 1024).expect("valid");
        assert_eq!(bs.block_of(0), BlockIndex(0));
        assert_eq!(bs.block_of(16 * 1024 - 1), BlockIndex(0));
        assert_eq!(bs.block_of(16 * 1024), BlockIndex(1));
        assert_eq!(bs.offset_in_block(16 * 1024 + 7), 7);
    }

    #[test]
    fn blocks_in_piece_rounds_up() {
        let bs = BlockSize::new(16 * 1024).expect("valid");
        assert_eq!(bs.blocks_in_piece(0), 0);
        assert_eq!(bs.blocks_in_piece(1), 1);
        assert_eq!(bs.blocks_in_piece(16 * 1024), 1);
        assert_eq!(bs.blocks_in_piece(16 * 1024 + 1), 2);
        assert_eq!(bs.blocks_in_piece(64 * 1024), 4);
    }

    #[test]
    fn default_block_size_is_sixteen_kib() {
        assert_eq!(BlockSize::default().get(), DEFAULT_BLOCK_SIZE);
    }
}
