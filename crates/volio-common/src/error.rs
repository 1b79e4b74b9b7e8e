//! Error types for the volume layer

use thiserror::Error;

/// Result type for volume operations
pub type VolumeResult<T> = Result<T, VolumeError>;

/// Volume layer error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VolumeError {
    /// Name is not bound to any volume
    #[error("volume not found: {0}")]
    NotFound(String),

    /// Duplicate create
    #[error("volume already exists: {0}")]
    Exists(String),

    /// Remove with outstanding opens, or a concurrent lifecycle operation
    #[error("volume busy: {0}")]
    Busy(String),

    /// Write, resize, or dump-activate attempted on a read-only volume
    #[error("volume is read-only: {0}")]
    ReadOnly(String),

    /// Misaligned or zero size
    #[error("invalid size {size}: {reason}")]
    InvalidSize { size: u64, reason: String },

    /// Dump activation found a block with no single physical address
    #[error("backing object is fragmented: {0}")]
    Fragmented(String),

    /// A store or log primitive failed
    #[error("I/O error: {0}")]
    Io(String),

    /// Replay encountered a record kind it cannot dispatch
    #[error("unsupported log record kind {0}")]
    Unsupported(u8),

    /// The store reported insufficient free space
    #[error("out of space: required {required} bytes, available {available} bytes")]
    OutOfSpace { required: u64, available: u64 },

    /// Request extended past end of volume; the in-bounds portion completed
    #[error("request crosses end of volume: {bytes_transferred} bytes completed")]
    Boundary { bytes_transferred: u64 },
}

impl VolumeError {
    /// Create an I/O error from any displayable cause
    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    /// True for conditions a caller is expected to handle and retry or
    /// reconfigure around, as opposed to programming errors.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Busy(_) | Self::Fragmented(_) | Self::OutOfSpace { .. }
        )
    }
}

impl From<std::io::Error> for VolumeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_classification() {
        assert!(VolumeError::Busy("vol0".into()).is_recoverable());
        assert!(
            VolumeError::OutOfSpace {
                required: 10,
                available: 1
            }
            .is_recoverable()
        );
        assert!(!VolumeError::Unsupported(9).is_recoverable());
    }

    #[test]
    fn io_error_conversion() {
        let err: VolumeError = std::io::Error::other("disk gone").into();
        assert!(matches!(err, VolumeError::Io(_)));
    }
}
