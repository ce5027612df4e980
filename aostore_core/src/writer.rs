use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::buffered_append::{AppendFile, BufferedAppend, WalTarget};
use crate::codec::{try_compress, Codec, CodecProvider};
use crate::config::StorageAttributes;
use crate::error::{BlockContext, Error, Result};
use crate::format::{
    decode_header, header_length, BlockHeader, FormatVersion, HeaderKind, MAX_LARGE_CONTENT_LEN,
};
use crate::wal::{AoWal, RelFileNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Idle,
    BufferAcquired { kind: HeaderKind, header_len: usize },
}

/// Counters for one write session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub blocks: u64,
    pub rows: u64,
    pub compressed_blocks: u64,
    pub large_contents: u64,
    pub physical_writes: u64,
    pub bytes_written: u64,
}

/// Writes blocks to one segment file at a time.
///
/// # Block protocol
/// ```text
/// [set_first_row_num(n)]        optional, applies to the next block only
/// get_buffer(kind) -> &mut [u8] caller fills content
/// finish_buffer(len, kind, rows) header written, content compressed
///   or cancel_last_buffer()
/// ```
/// `content()` does all three and splits values larger than one block into a
/// LargeContent header followed by SmallContent fragments.
pub struct StorageWrite {
    attrs: StorageAttributes,
    relation_name: String,
    title: String,

    codec: Option<Box<dyn Codec>>,
    verify_codec: Option<Box<dyn Codec>>,
    /// Uncompressed content while a compressing session builds a block.
    compress_scratch: Vec<u8>,
    verify_scratch: Vec<u8>,

    buffered: BufferedAppend,
    wal: Option<Arc<dyn AoWal>>,
    temporary: bool,

    state: WriteState,
    first_row_num: Option<i64>,
    logical_block_start_offset: u64,
    stats: WriteStats,
}

impl StorageWrite {
    /// Create a session. Compression contexts come from `codecs` when the
    /// attributes ask for compression.
    pub fn new(
        attrs: StorageAttributes,
        relation_name: &str,
        title: &str,
        codecs: Option<&dyn CodecProvider>,
    ) -> Result<Self> {
        let (codec, verify_codec) = match attrs.compress {
            Some(kind) => {
                let provider = codecs.ok_or_else(|| {
                    Error::config(format!("{} compression requested but no codecs available", kind))
                })?;
                let codec = provider.create(kind, attrs.compress_level)?;
                let verify = if attrs.verify_write {
                    Some(provider.create(kind, attrs.compress_level)?)
                } else {
                    None
                };
                (Some(codec), verify)
            }
            None => (None, None),
        };
        Self::with_codecs(attrs, relation_name, title, codec, verify_codec)
    }

    /// Create a session around already constructed compression contexts.
    pub fn with_codecs(
        attrs: StorageAttributes,
        relation_name: &str,
        title: &str,
        codec: Option<Box<dyn Codec>>,
        verify_codec: Option<Box<dyn Codec>>,
    ) -> Result<Self> {
        attrs.validate()?;
        if attrs.compress.is_some() && codec.is_none() {
            return Err(Error::config("compression requested without a compression context"));
        }
        if attrs.verify_write && codec.is_some() && verify_codec.is_none() {
            warn!(
                relation = relation_name,
                "verify_write requested without a second compression context; compressed blocks will not be verified"
            );
        }
        let buffered = BufferedAppend::new(attrs.max_buffer_len(), attrs.max_large_write_len())?;
        let compress_scratch = if codec.is_some() {
            vec![0u8; attrs.max_buffer_len()]
        } else {
            Vec::new()
        };
        let verify_scratch = if verify_codec.is_some() {
            vec![0u8; attrs.max_buffer_len()]
        } else {
            Vec::new()
        };
        debug!(relation = relation_name, title, ?attrs, "storage write session created");
        Ok(Self {
            attrs,
            relation_name: relation_name.to_string(),
            title: title.to_string(),
            codec,
            verify_codec,
            compress_scratch,
            verify_scratch,
            buffered,
            wal: None,
            temporary: false,
            state: WriteState::Idle,
            first_row_num: None,
            logical_block_start_offset: 0,
            stats: WriteStats::default(),
        })
    }

    /// Log every physical write to `wal`.
    pub fn with_wal(mut self, wal: Arc<dyn AoWal>) -> Self {
        self.wal = Some(wal);
        self
    }

    /// Temporary relations are neither logged nor fsynced.
    pub fn temporary(mut self, temporary: bool) -> Self {
        self.temporary = temporary;
        self
    }

    pub fn attributes(&self) -> &StorageAttributes {
        &self.attrs
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    fn needs_wal(&self) -> bool {
        self.wal.is_some() && !self.temporary
    }

    fn context(&self, offset: u64) -> BlockContext {
        BlockContext::new(&self.relation_name, self.buffered.file_name(), offset)
    }

    // ── File lifecycle ──────────────────────────────────────────────────────

    /// Create the segment file if it does not exist yet and announce it in
    /// the WAL with an empty record.
    pub fn create_file(&self, path: &Path, node: RelFileNode, segment_file_num: u32) -> Result<()> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io(format!("could not create segment file '{}'", path.display()), e))?;
        if self.needs_wal() {
            if let Some(wal) = &self.wal {
                wal.append_ao_record(node, segment_file_num, 0, &[])?;
            }
        }
        debug!(relation = %self.relation_name, file = %path.display(), "created segment file");
        Ok(())
    }

    /// Open an existing segment file for appending at its committed EOF.
    /// Bytes past `logical_eof` left by an aborted writer are truncated.
    pub fn open_file(
        &mut self,
        path: &Path,
        version: FormatVersion,
        logical_eof: u64,
        eof_uncompressed: u64,
        node: RelFileNode,
        segment_file_num: u32,
    ) -> Result<()> {
        if version != FormatVersion::LATEST {
            return Err(Error::contract(format!(
                "cannot append to segment file '{}' with format version {:?}; only {:?} is written",
                path.display(),
                version,
                FormatVersion::LATEST
            )));
        }
        let name = path.display().to_string();
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
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
        if physical_len > logical_eof {
            debug!(file = %name, physical_len, logical_eof, "truncating uncommitted tail");
            file.set_len(logical_eof)
                .map_err(|e| Error::io(format!("could not truncate '{}'", name), e))?;
        }
        file.seek(SeekFrom::Start(logical_eof))
            .map_err(|e| Error::io(format!("could not seek in '{}'", name), e))?;
        self.attach_file(Box::new(file), &name, logical_eof, eof_uncompressed, node, segment_file_num)
    }

    /// Append to an already opened file positioned at `eof`.
    pub fn attach_file(
        &mut self,
        file: Box<dyn AppendFile>,
        name: &str,
        eof: u64,
        eof_uncompressed: u64,
        node: RelFileNode,
        segment_file_num: u32,
    ) -> Result<()> {
        let wal = if self.needs_wal() {
            self.wal.clone().map(|wal| WalTarget {
                wal,
                node,
                segment_file_num,
            })
        } else {
            None
        };
        self.buffered.set_file(file, name, eof, eof_uncompressed, wal)?;
        self.state = WriteState::Idle;
        self.first_row_num = None;
        self.logical_block_start_offset = eof;
        debug!(relation = %self.relation_name, file = name, eof, "opened segment file for append");
        Ok(())
    }

    pub fn is_file_open(&self) -> bool {
        self.buffered.is_open()
    }

    /// Pad, write out and fsync the current file.
    ///
    /// Returns `(new_logical_eof, new_eof_uncompressed)`, or `(0, 0)` when no
    /// file is open.
    pub fn flush_and_close_file(&mut self) -> Result<(u64, u64)> {
        if !self.buffered.is_open() {
            return Ok((0, 0));
        }
        if self.state != WriteState::Idle {
            return Err(Error::contract("cannot close a segment file with an outstanding buffer"));
        }
        let needs_wal = self.needs_wal();
        self.pad_out_remainder(needs_wal)?;
        let (eof, eof_uncompressed, mut file) = self.buffered.complete_file(needs_wal)?;
        if !self.temporary {
            file.sync_all().map_err(|e| {
                Error::io(format!("could not fsync segment file '{}'", self.buffered.file_name()), e)
            })?;
        }
        debug!(relation = %self.relation_name, eof, eof_uncompressed, "closed segment file");
        Ok((eof, eof_uncompressed))
    }

    /// Zero-fill up to the next `safe_fs_write_size` boundary.
    fn pad_out_remainder(&mut self, needs_wal: bool) -> Result<()> {
        let safe = self.attrs.safe_fs_write_size as u64;
        if safe == 0 {
            return Ok(());
        }
        let next = self.buffered.next_buffer_position();
        let remainder = ((next + safe - 1) / safe * safe - next) as usize;
        if remainder == 0 {
            return Ok(());
        }
        self.buffered.get_buffer(remainder)?.fill(0);
        self.buffered.finish_buffer(remainder, remainder, needs_wal)?;
        trace!(relation = %self.relation_name, next, remainder, "zero padded to safe write boundary");
        Ok(())
    }

    // ── Block protocol ──────────────────────────────────────────────────────

    /// Header length the next block of `kind` will have.
    pub fn complete_header_len(&self, kind: HeaderKind) -> usize {
        header_length(kind, self.attrs.checksum, self.first_row_num.is_some())
    }

    /// Largest content the next block of `kind` can hold.
    pub fn content_capacity(&self, kind: HeaderKind) -> usize {
        self.attrs.max_buffer_len() - self.complete_header_len(kind)
    }

    /// Explicit first row number for the next block only.
    pub fn set_first_row_num(&mut self, first_row_num: i64) -> Result<()> {
        if self.state != WriteState::Idle {
            return Err(Error::contract("set_first_row_num while a buffer is outstanding"));
        }
        if first_row_num < 0 {
            return Err(Error::contract(format!("first row number {} is negative", first_row_num)));
        }
        self.first_row_num = Some(first_row_num);
        Ok(())
    }

    pub fn is_buffer_allocated(&self) -> bool {
        self.state != WriteState::Idle
    }

    /// File offset the next block will start at.
    pub fn current_position(&self) -> u64 {
        self.buffered.next_buffer_position()
    }

    /// File offset of the most recently finished block.
    pub fn logical_block_start_offset(&self) -> u64 {
        self.logical_block_start_offset
    }

    /// Buffer for the content of the next block of `kind`.
    pub fn get_buffer(&mut self, kind: HeaderKind) -> Result<&mut [u8]> {
        if !self.buffered.is_open() {
            return Err(Error::contract("get_buffer without an open segment file"));
        }
        if self.state != WriteState::Idle {
            return Err(Error::contract("get_buffer while a buffer is outstanding"));
        }
        if kind == HeaderKind::LargeContent {
            return Err(Error::contract("LargeContent blocks are written through content()"));
        }
        let header_len = self.complete_header_len(kind);
        let capacity = self.attrs.max_buffer_len() - header_len;
        if self.codec.is_some() {
            self.state = WriteState::BufferAcquired { kind, header_len };
            Ok(&mut self.compress_scratch[..capacity])
        } else {
            let buf = self
                .buffered
                .get_max_buffer()
                .ok_or_else(|| Error::contract("buffered append has no buffer to hand out"))?;
            self.state = WriteState::BufferAcquired { kind, header_len };
            Ok(&mut buf[header_len..])
        }
    }

    /// Drop the outstanding buffer and the pending first row number.
    pub fn cancel_last_buffer(&mut self) {
        if self.state != WriteState::Idle {
            if self.buffered.is_buffer_outstanding() {
                self.buffered.cancel_last_buffer();
            }
            self.state = WriteState::Idle;
        }
        self.first_row_num = None;
    }

    /// Turn the first `content_len` bytes of the buffer into a block.
    pub fn finish_buffer(&mut self, content_len: usize, executor_kind: u8, row_count: u32) -> Result<()> {
        let (kind, header_len) = match self.state {
            WriteState::BufferAcquired { kind, header_len } => (kind, header_len),
            WriteState::Idle => return Err(Error::contract("finish_buffer without get_buffer")),
        };
        let result = self.write_block(kind, header_len, content_len, executor_kind, row_count);
        if result.is_err() {
            self.cancel_last_buffer();
        }
        result
    }

    fn write_block(
        &mut self,
        kind: HeaderKind,
        header_len: usize,
        content_len: usize,
        executor_kind: u8,
        row_count: u32,
    ) -> Result<()> {
        let max_buffer_len = self.attrs.max_buffer_len();
        if content_len > max_buffer_len - header_len {
            return Err(Error::contract(format!(
                "content length {} exceeds the {} bytes available after a {}-byte header",
                content_len,
                max_buffer_len - header_len,
                header_len
            )));
        }
        let header_offset = self.buffered.next_buffer_position();
        let context = self.context(header_offset);
        let needs_wal = self.needs_wal();
        let has_checksum = self.attrs.checksum;

        let (buf, compressed_len) = match self.codec.as_mut() {
            Some(codec) => {
                let buf = self
                    .buffered
                    .get_max_buffer()
                    .ok_or_else(|| Error::contract("buffered append has no buffer to hand out"))?;
                let src = &self.compress_scratch[..content_len];
                let compressed = if kind == HeaderKind::NonBulkDenseContent {
                    None
                } else {
                    try_compress(&mut **codec, src, &mut buf[header_len..])?
                };
                match compressed {
                    Some(n) => (buf, n),
                    None => {
                        buf[header_len..header_len + content_len].copy_from_slice(src);
                        (buf, 0)
                    }
                }
            }
            None => (self.buffered.outstanding_buffer()?, 0),
        };

        let header = BlockHeader {
            kind,
            executor_block_kind: executor_kind,
            row_count,
            first_row_num: self.first_row_num,
            uncompressed_len: content_len as u32,
            compressed_len: compressed_len as u32,
        };
        let overall = header.write_into(buf, has_checksum, FormatVersion::LATEST)?;

        if self.attrs.verify_write {
            verify_block(
                &buf[..overall],
                &header,
                has_checksum,
                max_buffer_len,
                &mut self.verify_codec,
                &mut self.verify_scratch,
                &self.compress_scratch,
                &context,
            )?;
        }
        trace!(relation = %self.relation_name, offset = header_offset, ?header, overall, "finished block");

        let uncompressed_accounted = header_len + FormatVersion::LATEST.round_up(content_len);
        self.buffered.finish_buffer(overall, uncompressed_accounted, needs_wal)?;

        self.stats.blocks += 1;
        self.stats.rows += row_count as u64;
        if compressed_len > 0 {
            self.stats.compressed_blocks += 1;
        }
        self.logical_block_start_offset = header_offset;
        self.first_row_num = None;
        self.state = WriteState::Idle;
        Ok(())
    }

    /// Write `content` as one logical unit of `row_count` rows.
    ///
    /// Content larger than a SmallContent block becomes a LargeContent header
    /// (carrying the row count and first row number) followed by SmallContent
    /// fragments with a row count of zero.
    pub fn content(&mut self, content: &[u8], executor_kind: u8, row_count: u32) -> Result<()> {
        if content.len() <= self.content_capacity(HeaderKind::SmallContent) {
            let buf = self.get_buffer(HeaderKind::SmallContent)?;
            buf[..content.len()].copy_from_slice(content);
            return self.finish_buffer(content.len(), executor_kind, row_count);
        }
        if content.len() > MAX_LARGE_CONTENT_LEN as usize {
            return Err(Error::contract(format!(
                "content of {} bytes exceeds the large content limit {}",
                content.len(),
                MAX_LARGE_CONTENT_LEN
            )));
        }
        if !self.buffered.is_open() || self.state != WriteState::Idle {
            return Err(Error::contract("content() needs an open file and no outstanding buffer"));
        }

        let header = BlockHeader {
            kind: HeaderKind::LargeContent,
            executor_block_kind: executor_kind,
            row_count,
            first_row_num: self.first_row_num,
            uncompressed_len: content.len() as u32,
            compressed_len: 0,
        };
        let header_len = header.header_len(self.attrs.checksum);
        let header_offset = self.buffered.next_buffer_position();
        let needs_wal = self.needs_wal();
        let buf = self.buffered.get_buffer(header_len)?;
        if let Err(e) = header.write_into(buf, self.attrs.checksum, FormatVersion::LATEST) {
            self.buffered.cancel_last_buffer();
            return Err(e);
        }
        self.buffered.finish_buffer(header_len, header_len, needs_wal)?;
        self.first_row_num = None;
        self.logical_block_start_offset = header_offset;
        self.stats.large_contents += 1;
        self.stats.blocks += 1;
        self.stats.rows += row_count as u64;
        debug!(
            relation = %self.relation_name,
            offset = header_offset,
            len = content.len(),
            "writing large content"
        );

        let fragment_len = self.content_capacity(HeaderKind::SmallContent);
        for fragment in content.chunks(fragment_len) {
            let buf = self.get_buffer(HeaderKind::SmallContent)?;
            buf[..fragment.len()].copy_from_slice(fragment);
            self.finish_buffer(fragment.len(), executor_kind, 0)?;
        }
        // the large content header is the block a directory entry points at
        self.logical_block_start_offset = header_offset;
        Ok(())
    }

    pub fn stats(&self) -> WriteStats {
        let appended = self.buffered.stats();
        WriteStats {
            physical_writes: appended.physical_writes,
            bytes_written: appended.bytes_written,
            ..self.stats
        }
    }

    /// End the session. An open file is left unflushed; callers close it
    /// first.
    pub fn finish_session(mut self) {
        if self.buffered.is_open() {
            warn!(relation = %self.relation_name, "write session finished with an open segment file");
        }
        self.release_codecs();
    }

    fn release_codecs(&mut self) {
        if let Some(mut codec) = self.codec.take() {
            codec.close();
        }
        if let Some(mut codec) = self.verify_codec.take() {
            codec.close();
        }
    }
}

impl Drop for StorageWrite {
    fn drop(&mut self) {
        self.release_codecs();
    }
}

/// Re-read a freshly built block and compare it with what was requested.
#[allow(clippy::too_many_arguments)]
fn verify_block(
    block: &[u8],
    expected: &BlockHeader,
    has_checksum: bool,
    max_block_len: usize,
    codec: &mut Option<Box<dyn Codec>>,
    scratch: &mut [u8],
    original: &[u8],
    context: &BlockContext,
) -> Result<()> {
    let info = decode_header(block, has_checksum, max_block_len, FormatVersion::LATEST)
        .map_err(|e| Error::from_header_check(e, context.clone()))?;
    if info.kind != expected.kind
        || info.uncompressed_len != expected.uncompressed_len
        || info.compressed_len != expected.compressed_len
        || info.executor_block_kind != expected.executor_block_kind
        || info.row_count != expected.row_count
        || info.first_row_num != expected.first_row_num
    {
        return Err(Error::corruption(
            format!("verify-write header mismatch: wrote {:?}", expected),
            context.clone().with_header(info),
        ));
    }
    if !info.is_compressed() {
        return Ok(());
    }
    let codec = match codec.as_mut() {
        Some(codec) => codec,
        None => return Ok(()),
    };
    let len = info.uncompressed_len as usize;
    let payload = &block[info.header_len..info.header_len + info.compressed_len as usize];
    let n = codec.decompress(payload, &mut scratch[..len]).map_err(|e| {
        Error::corruption(format!("verify-write cannot decompress block: {}", e), context.clone().with_header(info))
    })?;
    if n != len || scratch[..len] != original[..len] {
        return Err(Error::corruption(
            format!("verify-write decompressed {} bytes that differ from the {} bytes written", n, len),
            context.clone().with_header(info),
        ));
    }
    Ok(())
}
