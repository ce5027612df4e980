//! Compression backends for append-only storage blocks.
//!
//! [`BundledCodecs`] hands out one fresh context per storage session.

mod lz4_codec;
mod zlib_codec;
mod zstd_codec;

pub use lz4_codec::Lz4Codec;
pub use zlib_codec::ZlibCodec;
pub use zstd_codec::ZstdCodec;

use aostore_core::codec::{Codec, CodecProvider, CompressionKind};
use aostore_core::error::Result;
use tracing::debug;

/// Provides zstd, zlib and lz4 contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct BundledCodecs;

impl CodecProvider for BundledCodecs {
    fn create(&self, kind: CompressionKind, level: i32) -> Result<Box<dyn Codec>> {
        kind.check_level(level)?;
        debug!(codec = kind.name(), level, "creating compression context");
        Ok(match kind {
            CompressionKind::Zstd => Box::new(ZstdCodec::new(level)?),
            CompressionKind::Zlib => Box::new(ZlibCodec::new(level)),
            CompressionKind::Lz4 => Box::new(Lz4Codec::new()),
        })
    }
}
