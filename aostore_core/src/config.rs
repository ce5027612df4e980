use serde::{Deserialize, Serialize};

use crate::codec::CompressionKind;
use crate::error::{Error, Result};
use crate::format::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Per-session storage settings.
///
/// Loaded from JSON by the CLI (`--attrs`) or built in code; call
/// [`StorageAttributes::validate`] before handing it to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageAttributes {
    /// Write header and content checksums into every block.
    pub checksum: bool,
    /// `None` stores every block uncompressed.
    pub compress: Option<CompressionKind>,
    pub compress_level: i32,
    /// Decompress each block again after compressing it and compare.
    pub verify_write: bool,
    /// Maximum block length in bytes; a multiple of 8 KiB in 8 KiB..=2 MiB.
    pub block_size: usize,
    /// Pad the tail of a file to this boundary before closing it. `0` disables.
    pub safe_fs_write_size: usize,
}

impl Default for StorageAttributes {
    fn default() -> Self {
        Self {
            checksum: true,
            compress: None,
            compress_level: 0,
            verify_write: false,
            block_size: DEFAULT_BLOCK_SIZE,
            safe_fs_write_size: 0,
        }
    }
}

impl StorageAttributes {
    pub fn compressed(kind: CompressionKind, level: i32) -> Self {
        Self {
            compress: Some(kind),
            compress_level: level,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_block_size(self.block_size)?;
        if let Some(kind) = self.compress {
            kind.check_level(self.compress_level)?;
        }
        if self.safe_fs_write_size != 0 && !self.safe_fs_write_size.is_power_of_two() {
            return Err(Error::config(format!(
                "safe_fs_write_size {} is not a power of two",
                self.safe_fs_write_size
            )));
        }
        if self.safe_fs_write_size > self.block_size {
            return Err(Error::config(format!(
                "block size {} is smaller than safe_fs_write_size {}",
                self.block_size, self.safe_fs_write_size
            )));
        }
        Ok(())
    }

    /// Largest single block, header included.
    pub fn max_buffer_len(&self) -> usize {
        self.block_size
    }

    /// Threshold at which the buffered appender issues a physical write.
    pub fn max_large_write_len(&self) -> usize {
        2 * self.block_size
    }
}

pub fn validate_block_size(block_size: usize) -> Result<()> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) || block_size % MIN_BLOCK_SIZE != 0 {
        return Err(Error::config(format!(
            "block size {} must be a multiple of {} between {} and {}",
            block_size, MIN_BLOCK_SIZE, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        )));
    }
    Ok(())
}
