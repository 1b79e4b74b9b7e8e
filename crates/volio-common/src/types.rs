//! Core types shared across the volume layer

use crate::error::{VolumeError, VolumeResult};

/// Identifier of an object inside the backing store
pub type ObjectId = u64;

/// Store transaction generation
pub type Txg = u64;

/// Smallest logical block size the store supports
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Largest logical block size the store supports
pub const MAX_BLOCK_SIZE: u32 = 128 * 1024;

/// Validate a volume logical block size against the store's bounds.
pub fn validate_block_size(block_size: u32) -> VolumeResult<()> {
    if !block_size.is_power_of_two()
        || block_size < MIN_BLOCK_SIZE
        || block_size > MAX_BLOCK_SIZE
    {
        return Err(VolumeError::InvalidSize {
            size: u64::from(block_size),
            reason: format!(
                "block size must be a power of two in [{MIN_BLOCK_SIZE}, {MAX_BLOCK_SIZE}]"
            ),
        });
    }
    Ok(())
}

/// Validate a volume logical size against its block size.
pub fn validate_volume_size(size: u64, block_size: u32) -> VolumeResult<()> {
    if size == 0 {
        return Err(VolumeError::InvalidSize {
            size,
            reason: "size must be positive".to_string(),
        });
    }
    if size % u64::from(block_size) != 0 {
        return Err(VolumeError::InvalidSize {
            size,
            reason: format!("size is not a multiple of block size {block_size}"),
        });
    }
    Ok(())
}

/// A half-open byte interval `[offset, offset + length)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// Start offset in bytes
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
}

impl ByteRange {
    /// Create a new range
    #[must_use]
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// True when the two ranges share at least one byte
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// Clamp the range to `[0, limit)`. Returns the in-bounds portion,
    /// which may be empty.
    #[must_use]
    pub fn clamp_to(&self, limit: u64) -> Self {
        let offset = self.offset.min(limit);
        let length = self.length.min(limit.saturating_sub(offset));
        Self { offset, length }
    }

    /// True when the range has no bytes
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }
}
