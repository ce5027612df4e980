use aostore_core::codec::{Codec, CompressionKind};
use aostore_core::error::{Error, Result};
use lz4_flex::block::{compress_into, decompress_into, CompressError};

/// LZ4 block format context. Stateless; lz4_flex has no levels.
#[derive(Debug, Default)]
pub struct Lz4Codec;

impl Lz4Codec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for Lz4Codec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Lz4
    }

    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<Option<usize>> {
        match compress_into(src, dst) {
            Ok(n) => Ok(Some(n)),
            Err(CompressError::OutputTooSmall { .. }) => Ok(None),
            #[allow(unreachable_patterns)]
            Err(e) => Err(Error::compression("lz4", e)),
        }
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        decompress_into(src, dst).map_err(|e| Error::compression("lz4", e))
    }
}
