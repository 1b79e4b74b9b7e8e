//! Configuration for the volume layer

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration shared by all volumes managed by one registry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Logical block size used when a volume does not specify one
    pub default_block_size: u32,
    /// Writes shorter than this are copied into the intent log record;
    /// longer writes log a pointer and fetch bytes at flush time
    pub immediate_write_max: u64,
    /// Directory holding per-volume intent log files
    pub log_dir: PathBuf,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            default_block_size: 8 * 1024,
            immediate_write_max: 32 * 1024,
            log_dir: PathBuf::from("/var/lib/volio/log"),
        }
    }
}

impl VolumeConfig {
    /// Path of the intent log file for a named volume. Slashes in
    /// pool/dataset style names are flattened so every volume maps to a
    /// single file directly under `log_dir`.
    #[must_use]
    pub fn log_path(&self, volume_name: &str) -> PathBuf {
        self.log_dir
            .join(format!("{}.ilog", volume_name.replace('/', "_")))
    }
}
