use aostore_core::codec::{Codec, CompressionKind};
use aostore_core::error::{Error, Result};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// zlib (deflate with zlib framing) context.
pub struct ZlibCodec {
    compress: Compress,
    decompress: Decompress,
}

impl ZlibCodec {
    pub fn new(level: i32) -> Self {
        Self {
            compress: Compress::new(Compression::new(level.clamp(0, 9) as u32), true),
            decompress: Decompress::new(true),
        }
    }
}

impl Codec for ZlibCodec {
    fn kind(&self) -> CompressionKind {
        CompressionKind::Zlib
    }

    fn compress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<Option<usize>> {
        self.compress.reset();
        let status = self
            .compress
            .compress(src, dst, FlushCompress::Finish)
            .map_err(|e| Error::compression("zlib", e))?;
        match status {
            Status::StreamEnd => Ok(Some(self.compress.total_out() as usize)),
            // ran out of output space
            Status::Ok | Status::BufError => Ok(None),
        }
    }

    fn decompress(&mut self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        self.decompress.reset(true);
        let status = self
            .decompress
            .decompress(src, dst, FlushDecompress::Finish)
            .map_err(|e| Error::compression("zlib", e))?;
        if status != Status::StreamEnd {
            return Err(Error::compression(
                "zlib",
                format!(
                    "stream did not end after {} input bytes and {} output bytes",
                    self.decompress.total_in(),
                    self.decompress.total_out()
                ),
            ));
        }
        Ok(self.decompress.total_out() as usize)
    }
}
