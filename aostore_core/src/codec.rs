use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Compression algorithms a column or segment file can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    Zstd,
    Zlib,
    Lz4,
}

impl CompressionKind {
    pub fn name(self) -> &'static str {
        match self {
            CompressionKind::Zstd => "zstd",
            CompressionKind::Zlib => "zlib",
            CompressionKind::Lz4 => "lz4",
        }
    }

    /// Inclusive range of accepted compression levels.
    pub fn level_range(self) -> (i32, i32) {
        match self {
            CompressionKind::Zstd => (1, 19),
            CompressionKind::Zlib => (1, 9),
            // lz4_flex has a single level
            CompressionKind::Lz4 => (1, 1),
        }
    }

    pub fn default_level(self) -> i32 {
        match self {
            CompressionKind::Zstd => 3,
            CompressionKind::Zlib => 6,
            CompressionKind::Lz4 => 1,
        }
    }

    pub fn check_level(self, level: i32) -> Result<()> {
        let (lo, hi) = self.level_range();
        if level < lo || level > hi {
            return Err(Error::config(format!(
                "{} compression level {} outside {}..={}",
                self.name(),
                level,
                lo,
                hi
            )));
        }
        Ok(())
    }
}

impl fmt::Display for CompressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "zstd" => Ok(CompressionKind::Zstd),
            "zlib" => Ok(CompressionKind::Zlib),
            "lz4" => Ok(CompressionKind::Lz4),
            other => Err(Error::config(format!(
                "unknown compression type '{}'; expected zstd, zlib or lz4",
                other
            ))),
        }
    }
}

/// A compression context.
///
/// One context belongs to exactly one storage session and is never shared,
/// hence `&mut self` and no `Sync` bound. Blocks are compressed independently;
/// a context may keep scratch state between calls but no block depends on a
/// previous one.
pub trait Codec: Send {
    fn kind(&self) -> CompressionKind;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Compress `src` into `dst`.
    ///
    /// Returns `Ok(None)` when the compressed form does not fit in `dst`;
    /// callers size `dst` to the largest length worth storing, so `None`
    /// simply means "store uncompressed". Backend failures are errors.
    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<Option<usize>>;

    /// Decompress `src` into `dst`, returning the number of bytes produced.
    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize>;

    /// Release backend resources. Called exactly once when the owning session
    /// ends; the context is not used afterwards.
    fn close(&mut self) {}
}

/// Creates compression contexts for a configured algorithm.
pub trait CodecProvider: Send + Sync {
    fn create(&self, kind: CompressionKind, level: i32) -> Result<Box<dyn Codec>>;
}

/// Compresses `src` into `dst[..limit]` and keeps the result only when it is
/// strictly smaller than the source.
pub fn try_compress(codec: &mut dyn Codec, src: &[u8], dst: &mut [u8]) -> Result<Option<usize>> {
    if src.is_empty() {
        return Ok(None);
    }
    let limit = dst.len().min(src.len().saturating_sub(1));
    if limit == 0 {
        return Ok(None);
    }
    match codec.compress(src, &mut dst[..limit])? {
        Some(n) if n > 0 && n < src.len() => Ok(Some(n)),
        _ => Ok(None),
    }
}
