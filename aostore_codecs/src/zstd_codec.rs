use aostore_core::codec::{Codec, CompressionKind};
use aostore_core::error::{Error, Result};
use zstd::bulk::{Compressor, Decompressor};

/// Zstandard context.
///
/// The compressor and decompressor are created once and reused for every
/// block of the session; each block is still an independent frame.
pub struct ZstdCodec {
    level: i32,
    compressor: Compressor<'static>,
    decompressor: Decompressor<'static>,
    /// Holds output when the caller's buffer is below the compress bound.
    scratch: Vec<u8>,
}

impl ZstdCodec {
    pub fn new(level: i32) -> Result<Self> {
        let compressor = Compressor::new(level).map_err(|e| Error::compression("zstd", e))?;
        let decompressor = Decompressor::new().map_err(|e| Error::compression("zstd", e))?;
        Ok(Self {
            level,
            compressor,
            decompressor,
            scratch: Vec::new(),
        })
    }

    pub fn level(&self) -> i32 {
        self.level
    }
}

impl Codec for ZstdCodec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Zstd
    }

    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<Option<usize>> {
        let bound = zstd::zstd_safe::compress_bound(src.len());
        if dst.len() >= bound {
            let n = self
                .compressor
                .compress_to_buffer(src, dst)
                .map_err(|e| Error::compression("zstd", e))?;
            return Ok(Some(n));
        }
        self.scratch.resize(bound, 0);
        let n = self
            .compressor
            .compress_to_buffer(src, &mut self.scratch[..])
            .map_err(|e| Error::compression("zstd", e))?;
        if n > dst.len() {
            return Ok(None);
        }
        dst[..n].copy_from_slice(&self.scratch[..n]);
        Ok(Some(n))
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        self.decompressor
            .decompress_to_buffer(src, dst)
            .map_err(|e| Error::compression("zstd", e))
    }

    fn close(&mut self) {
        self.scratch = Vec::new();
    }
}
