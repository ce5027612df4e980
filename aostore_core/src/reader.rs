use std::fs::File;
use std::path::Path;

use tracing::{debug, trace};

use crate::buffered_read::BufferedRead;
use crate::codec::{Codec, CodecProvider};
use crate::config::StorageAttributes;
use crate::error::{BlockContext, Error, Result};
use crate::format::{
    decode_header, get_header_info, verify_content_checksum, BlockInfo, FormatVersion, HeaderKind,
    CHECKSUM_SIZE, FIRST_ROW_NUM_SIZE, LONG_HEADER_SIZE,
};

const MAX_HEADER_LEN: usize = LONG_HEADER_SIZE + CHECKSUM_SIZE + FIRST_ROW_NUM_SIZE;

/// The block a [`StorageRead`] is positioned on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBlock {
    pub info: BlockInfo,
    pub header_offset: u64,
    /// Explicit first row number, or the one implied by the previous block.
    pub first_row_num: i64,
}

impl ReadBlock {
    pub fn row_count(&self) -> u32 {
        self.info.row_count
    }

    /// Row number after the last row of this block.
    pub fn next_row_num(&self) -> i64 {
        self.first_row_num + self.info.row_count as i64
    }

    pub fn contains_row(&self, row_num: i64) -> bool {
        row_num >= self.first_row_num && row_num < self.next_row_num()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadSessionStats {
    pub blocks: u64,
    pub blocks_decompressed: u64,
    pub physical_reads: u64,
    pub bytes_read: u64,
}

/// Reads blocks of one segment file at a time, up to its logical EOF.
///
/// `read_next_block` only validates the header. The payload is pulled (and
/// checked, and decompressed) by `content`, or stepped over by
/// `skip_current_block`.
pub struct StorageRead {
    attrs: StorageAttributes,
    relation_name: String,
    title: String,
    codec: Option<Box<dyn Codec>>,
    buffered: BufferedRead,
    version: FormatVersion,

    current: Option<ReadBlock>,
    payload_pending: bool,
    content: Vec<u8>,
    next_row_num: i64,
    stats: ReadSessionStats,
}

impl StorageRead {
    pub fn new(
        attrs: StorageAttributes,
        relation_name: &str,
        title: &str,
        codecs: Option<&dyn CodecProvider>,
    ) -> Result<Self> {
        attrs.validate()?;
        let codec = match (attrs.compress, codecs) {
            (Some(kind), Some(provider)) => Some(provider.create(kind, attrs.compress_level)?),
            (Some(kind), None) => {
                return Err(Error::config(format!(
                    "{} compression configured but no codecs available",
                    kind
                )))
            }
            (None, _) => None,
        };
        let buffered = BufferedRead::new(attrs.max_buffer_len(), attrs.max_large_write_len())?;
        Ok(Self {
            attrs,
            relation_name: relation_name.to_string(),
            title: title.to_string(),
            codec,
            buffered,
            version: FormatVersion::LATEST,
            current: None,
            payload_pending: false,
            content: Vec::new(),
            next_row_num: 1,
            stats: ReadSessionStats::default(),
        })
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn file_name(&self) -> &str {
        self.buffered.file_name()
    }

    pub fn open_file(&mut self, path: &Path, version: FormatVersion, logical_eof: u64) -> Result<()> {
        let name = path.display().to_string();
        let file = File::open(path)
            .map_err(|e| Error::io(format!("could not open segment file '{}'", name), e))?;
        let physical_len = file
            .metadata()
            .map_err(|e| Error::io(format!("could not stat segment file '{}'", name), e))?
            .len();
        if physical_len < logical_eof {
            return Err(Error::unexpected_eof(
                format!("physical length {} is below the logical EOF {}", physical_len, logical_eof),
                BlockContext::new(&self.relation_name, &name, physical_len),
            ));
        }
        self.buffered.set_file(file, &name, logical_eof);
        self.version = version;
        self.current = None;
        self.payload_pending = false;
        self.next_row_num = 1;
        debug!(relation = %self.relation_name, file = %name, logical_eof, ?version, "opened segment file for read");
        Ok(())
    }

    pub fn close_file(&mut self) {
        if self.buffered.is_open() {
            debug!(relation = %self.relation_name, file = %self.buffered.file_name(), "closed segment file");
        }
        self.buffered.close();
        self.current = None;
        self.payload_pending = false;
    }

    pub fn is_file_open(&self) -> bool {
        self.buffered.is_open()
    }

    pub fn logical_eof(&self) -> u64 {
        self.buffered.file_len()
    }

    pub fn current(&self) -> Option<&ReadBlock> {
        self.current.as_ref()
    }

    pub fn stats(&self) -> ReadSessionStats {
        let s = self.buffered.stats();
        ReadSessionStats {
            physical_reads: s.physical_reads,
            bytes_read: s.bytes_read,
            ..self.stats
        }
    }

    fn context(&self, offset: u64) -> BlockContext {
        BlockContext::new(&self.relation_name, self.buffered.file_name(), offset)
    }

    /// Position on a block boundary taken from a block directory entry.
    /// Blocks without an explicit first row number continue from
    /// `first_row_num`.
    pub fn seek_to(&mut self, offset: u64, first_row_num: i64) -> Result<()> {
        self.buffered.seek(offset)?;
        self.current = None;
        self.payload_pending = false;
        self.next_row_num = first_row_num;
        Ok(())
    }

    /// Advance to the next block. Returns `false` at the logical EOF.
    pub fn read_next_block(&mut self) -> Result<bool> {
        if self.payload_pending {
            self.skip_current_block()?;
        }
        let (info, header_offset) = match self.read_header()? {
            Some(h) => h,
            None => {
                self.current = None;
                return Ok(false);
            }
        };
        let first_row_num = info.first_row_num.unwrap_or(self.next_row_num);
        let block = ReadBlock {
            info,
            header_offset,
            first_row_num,
        };
        self.next_row_num = block.next_row_num();
        self.current = Some(block);
        self.payload_pending = true;
        self.stats.blocks += 1;
        trace!(relation = %self.relation_name, offset = header_offset, %info, "read block header");
        Ok(true)
    }

    /// Read and validate the next header, stepping over zero padding written
    /// at `safe_fs_write_size` boundaries. Leaves the position after the
    /// header.
    fn read_header(&mut self) -> Result<Option<(BlockInfo, u64)>> {
        loop {
            let remaining = self.buffered.remaining();
            if remaining == 0 {
                return Ok(None);
            }
            let offset = self.buffered.position();
            let context = self.context(offset);
            let peek_len = (remaining as usize).min(MAX_HEADER_LEN);
            let has_checksum = self.attrs.checksum;
            let bytes = self.buffered.peek(peek_len)?;

            let safe = self.attrs.safe_fs_write_size as u64;
            if safe > 0 && bytes.iter().take(4).all(|&b| b == 0) {
                let boundary = ((offset / safe + 1) * safe).min(self.buffered.file_len());
                let pad = (boundary - offset) as usize;
                let padding = self.buffered.peek(pad)?;
                if padding.len() < pad || padding.iter().any(|&b| b != 0) {
                    return Err(Error::corruption(
                        "non-zero bytes inside the zero padding before a write boundary",
                        context,
                    ));
                }
                self.buffered.advance(pad)?;
                continue;
            }

            let (_, header_len) = get_header_info(bytes, has_checksum)
                .map_err(|e| Error::from_header_check(e, context.clone()))?;
            if (remaining as usize) < header_len {
                return Err(Error::unexpected_eof(
                    format!("{} bytes left but the header needs {}", remaining, header_len),
                    context,
                ));
            }
            let info = decode_header(
                &bytes[..header_len],
                has_checksum,
                self.attrs.max_buffer_len(),
                self.version,
            )
            .map_err(|e| Error::from_header_check(e, context.clone()))?;
            if info.overall_block_len as u64 > remaining {
                return Err(Error::unexpected_eof(
                    format!("block of {} bytes extends past the logical EOF", info.overall_block_len),
                    context.with_header(info),
                ));
            }
            self.buffered.advance(header_len)?;
            return Ok(Some((info, offset)));
        }
    }

    /// Pull the payload of a non-large block into `out`, verifying its
    /// checksum and decompressing it.
    fn read_payload(&mut self, info: &BlockInfo, header_offset: u64, append: bool) -> Result<()> {
        let padded = info.overall_block_len - info.header_len;
        let context = self.context(header_offset).with_header(*info);
        let bytes = self.buffered.peek(padded)?;
        if bytes.len() < padded {
            return Err(Error::unexpected_eof("block payload is cut short", context));
        }
        let stored = &bytes[..info.stored_len()];
        verify_content_checksum(info, stored).map_err(|e| Error::from_header_check(e, context.clone()))?;

        let start = if append { self.content.len() } else { 0 };
        let len = info.uncompressed_len as usize;
        self.content.resize(start + len, 0);
        if info.is_compressed() {
            let codec = self.codec.as_mut().ok_or_else(|| {
                Error::corruption("compressed block in a session without compression", context.clone())
            })?;
            let n = codec
                .decompress(stored, &mut self.content[start..start + len])
                .map_err(|e| Error::corruption(format!("cannot decompress block: {}", e), context.clone()))?;
            if n != len {
                return Err(Error::corruption(
                    format!("decompressed {} bytes, header promises {}", n, len),
                    context,
                ));
            }
            self.stats.blocks_decompressed += 1;
        } else {
            self.content[start..start + len].copy_from_slice(stored);
        }
        self.buffered.advance(padded)?;
        Ok(())
    }

    /// Walk the fragments of a LargeContent object. Fragments are decoded
    /// into the content buffer only when `decode` is set.
    fn read_large_fragments(&mut self, block: &ReadBlock, decode: bool) -> Result<()> {
        let total = block.info.uncompressed_len as u64;
        let mut gathered = 0u64;
        while gathered < total {
            let (info, offset) = match self.read_header()? {
                Some(h) => h,
                None => {
                    return Err(Error::unexpected_eof(
                        format!("large content ended after {} of {} bytes", gathered, total),
                        self.context(block.header_offset).with_header(block.info),
                    ))
                }
            };
            if info.kind != HeaderKind::SmallContent || info.row_count != 0 || info.first_row_num.is_some() {
                return Err(Error::corruption(
                    "expected a large content fragment",
                    self.context(offset).with_header(info),
                ));
            }
            if decode {
                self.read_payload(&info, offset, true)?;
            } else {
                let pos = self.buffered.position();
                self.buffered.seek(pos + (info.overall_block_len - info.header_len) as u64)?;
            }
            gathered += info.uncompressed_len as u64;
        }
        if gathered != total {
            return Err(Error::corruption(
                format!("large content fragments hold {} bytes, header promises {}", gathered, total),
                self.context(block.header_offset).with_header(block.info),
            ));
        }
        Ok(())
    }

    /// Content of the current block, decompressed. Large content is
    /// reassembled from its fragments.
    pub fn content(&mut self) -> Result<&[u8]> {
        let block = self
            .current
            .ok_or_else(|| Error::contract("content() without a current block"))?;
        if self.payload_pending {
            self.content.clear();
            if block.info.kind == HeaderKind::LargeContent {
                self.read_large_fragments(&block, true)?;
            } else {
                self.read_payload(&block.info, block.header_offset, false)?;
            }
            self.payload_pending = false;
        }
        Ok(&self.content)
    }

    /// Move past the current block's payload without decoding it.
    pub fn skip_current_block(&mut self) -> Result<()> {
        if !self.payload_pending {
            return Ok(());
        }
        let block = self
            .current
            .ok_or_else(|| Error::contract("skip without a current block"))?;
        if block.info.kind == HeaderKind::LargeContent {
            self.read_large_fragments(&block, false)?;
        } else {
            let pos = self.buffered.position();
            self.buffered
                .seek(pos + (block.info.overall_block_len - block.info.header_len) as u64)?;
        }
        self.payload_pending = false;
        self.content.clear();
        Ok(())
    }

    pub fn finish_session(mut self) {
        self.close_file();
        if let Some(mut codec) = self.codec.take() {
            codec.close();
        }
    }
}

impl Drop for StorageRead {
    fn drop(&mut self) {
        if let Some(mut codec) = self.codec.take() {
            codec.close();
        }
    }
}
