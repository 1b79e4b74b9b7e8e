//! Volio common types
//!
//! Shared building blocks for the volume emulation layer: the error
//! taxonomy used across every crate, byte-range and block-size helpers,
//! and the volume configuration structure.

pub mod config;
pub mod error;
pub mod types;

pub use config::VolumeConfig;
pub use error::{VolumeError, VolumeResult};
pub use types::{ByteRange, ObjectId, Txg, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
