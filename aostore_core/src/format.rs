//! Append-only storage block layout.
//!
//! Every block starts with one or two 64-bit header words, each stored as two
//! little-endian `u32` halves (high half first). Word 0 is shared by all
//! kinds:
//!
//! ```text
//!  63   reserved, must be zero
//!  60-62 header kind (1 = SmallContent, 2 = LargeContent,
//!        3 = NonBulkDenseContent, 4 = BulkDenseContent)
//!  59   has first row number
//!  56-58 executor block kind
//!  0-55 kind-specific fields (see `HeaderKind`)
//! ```
//!
//! followed by the optional checksum pair (header CRC, content CRC), the
//! optional first row number (`i64`), the content, and zero padding to the
//! format version's alignment.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checksum::{build_content_checksum, build_header_checksum};
use crate::error::{Error, Result};

// ── Sizes ──────────────────────────────────────────────────────────────────

pub const REGULAR_HEADER_SIZE: usize = 8;
pub const LONG_HEADER_SIZE: usize = 16;
/// Header checksum word plus content checksum word.
pub const CHECKSUM_SIZE: usize = 8;
pub const FIRST_ROW_NUM_SIZE: usize = 8;

pub const MIN_BLOCK_SIZE: usize = 8 * 1024;
pub const MAX_BLOCK_SIZE: usize = 2 * 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

// ── Field widths ───────────────────────────────────────────────────────────

pub const MAX_SMALL_CONTENT_ROW_COUNT: u32 = (1 << 14) - 1;
pub const MAX_DENSE_ROW_COUNT: u32 = (1 << 30) - 1;
pub const MAX_LARGE_CONTENT_ROW_COUNT: u32 = (1 << 26) - 1;
/// Widest data or compressed length a single block can describe.
pub const MAX_DATA_LEN: u32 = (1 << 21) - 1;
pub const MAX_LARGE_CONTENT_LEN: u32 = (1 << 30) - 1;
pub const MAX_EXECUTOR_BLOCK_KIND: u8 = 7;

const DATA_LEN_MASK: u64 = (1 << 21) - 1;

// ── Executor block kinds ───────────────────────────────────────────────────

pub const EXECUTOR_KIND_NONE: u8 = 0;
pub const EXECUTOR_KIND_VAR_BLOCK: u8 = 1;
pub const EXECUTOR_KIND_SINGLE_ROW: u8 = 2;
pub const EXECUTOR_KIND_DATUM_BLOCK: u8 = 3;

// ── Header kind ────────────────────────────────────────────────────────────

/// Kind-specific bits of word 0:
///
/// | kind         | row count   | data length | compressed length       |
/// |--------------|-------------|-------------|-------------------------|
/// | SmallContent | 42-55 (14)  | 21-41       | 0-20                    |
/// | LargeContent | 30-55 (26)  | 0-29 (total object length)  | -       |
/// | NonBulkDense | 26-55 (30)  | 0-20        | -  (21-25 reserved)     |
/// | BulkDense    | 26-55 (30)  | 0-20        | word 1, bits 0-20       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HeaderKind {
    SmallContent = 1,
    LargeContent = 2,
    NonBulkDenseContent = 3,
    BulkDenseContent = 4,
}

impl HeaderKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(HeaderKind::SmallContent),
            2 => Some(HeaderKind::LargeContent),
            3 => Some(HeaderKind::NonBulkDenseContent),
            4 => Some(HeaderKind::BulkDenseContent),
            _ => None,
        }
    }

    /// Only BulkDenseContent carries the second header word.
    pub fn is_long(self) -> bool {
        self == HeaderKind::BulkDenseContent
    }

    pub fn fixed_len(self) -> usize {
        if self.is_long() {
            LONG_HEADER_SIZE
        } else {
            REGULAR_HEADER_SIZE
        }
    }

    pub fn max_row_count(self) -> u32 {
        match self {
            HeaderKind::SmallContent => MAX_SMALL_CONTENT_ROW_COUNT,
            HeaderKind::LargeContent => MAX_LARGE_CONTENT_ROW_COUNT,
            HeaderKind::NonBulkDenseContent | HeaderKind::BulkDenseContent => MAX_DENSE_ROW_COUNT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HeaderKind::SmallContent => "SmallContent",
            HeaderKind::LargeContent => "LargeContent",
            HeaderKind::NonBulkDenseContent => "NonBulkDenseContent",
            HeaderKind::BulkDenseContent => "BulkDenseContent",
        }
    }
}

impl fmt::Display for HeaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Format version ─────────────────────────────────────────────────────────

/// Selects the content alignment. Readers accept both; writers only produce
/// [`FormatVersion::LATEST`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatVersion {
    /// Content padded to 4 bytes.
    Original = 1,
    /// Content padded to 8 bytes.
    Aligned64 = 2,
}

impl FormatVersion {
    pub const LATEST: FormatVersion = FormatVersion::Aligned64;

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(FormatVersion::Original),
            2 => Some(FormatVersion::Aligned64),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn alignment(self) -> usize {
        match self {
            FormatVersion::Original => 4,
            FormatVersion::Aligned64 => 8,
        }
    }

    pub fn round_up(self, len: usize) -> usize {
        let a = self.alignment();
        (len + a - 1) / a * a
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        FormatVersion::LATEST
    }
}

/// Total header length for a block of `kind`.
pub fn header_length(kind: HeaderKind, has_checksum: bool, has_first_row_num: bool) -> usize {
    let mut len = kind.fixed_len();
    if has_checksum {
        len += CHECKSUM_SIZE;
    }
    if has_first_row_num {
        len += FIRST_ROW_NUM_SIZE;
    }
    len
}

// ── Header check errors ────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCheckError {
    #[error("header needs {needed} bytes but only {available} are available")]
    TooShort { needed: usize, available: usize },
    #[error("first header word is zero")]
    ZeroFirstWord,
    #[error("reserved bit 63 of the first header word is set")]
    ReservedBitSet,
    #[error("invalid header kind {0}")]
    InvalidKind(u8),
    #[error("header checksum does not match: stored {stored:#010x}, computed {computed:#010x}")]
    HeaderChecksum { stored: u32, computed: u32 },
    #[error("content checksum does not match: stored {stored:#010x}, computed {computed:#010x}")]
    ContentChecksum { stored: u32, computed: u32 },
    #[error("overall block length {overall_len} exceeds the maximum of {max_len}")]
    BlockTooLong { overall_len: usize, max_len: usize },
    #[error("compressed length {compressed_len} is not smaller than data length {uncompressed_len}")]
    CompressedNotSmaller {
        compressed_len: u32,
        uncompressed_len: u32,
    },
    #[error("large content length is zero")]
    ZeroLargeContentLength,
    #[error("reserved header field is not zero")]
    ReservedFieldNotZero,
    #[error("first row number {0} is negative")]
    InvalidFirstRowNum(i64),
}

pub type HeaderCheckResult<T> = std::result::Result<T, HeaderCheckError>;

// ── Little-endian word access ──────────────────────────────────────────────

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

fn write_u32(bytes: &mut [u8], at: usize, v: u32) {
    bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn read_word(bytes: &[u8], at: usize) -> u64 {
    ((read_u32(bytes, at) as u64) << 32) | read_u32(bytes, at + 4) as u64
}

fn write_word(bytes: &mut [u8], at: usize, w: u64) {
    write_u32(bytes, at, (w >> 32) as u32);
    write_u32(bytes, at + 4, w as u32);
}

fn ensure_len(bytes: &[u8], needed: usize) -> HeaderCheckResult<()> {
    if bytes.len() < needed {
        return Err(HeaderCheckError::TooShort {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

// ── Encoding ───────────────────────────────────────────────────────────────

/// Everything needed to write one block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub kind: HeaderKind,
    pub executor_block_kind: u8,
    pub row_count: u32,
    pub first_row_num: Option<i64>,
    /// Data length; for LargeContent the length of the whole object.
    pub uncompressed_len: u32,
    /// Stored length when compressed, `0` when the content is stored as is.
    pub compressed_len: u32,
}

impl BlockHeader {
    pub fn header_len(&self, has_checksum: bool) -> usize {
        header_length(self.kind, has_checksum, self.first_row_num.is_some())
    }

    /// Payload bytes following the header, before padding.
    pub fn stored_len(&self) -> usize {
        if self.kind == HeaderKind::LargeContent {
            0
        } else if self.compressed_len > 0 {
            self.compressed_len as usize
        } else {
            self.uncompressed_len as usize
        }
    }

    pub fn overall_block_len(&self, has_checksum: bool, version: FormatVersion) -> usize {
        self.header_len(has_checksum) + version.round_up(self.stored_len())
    }

    fn validate(&self) -> Result<()> {
        if self.executor_block_kind > MAX_EXECUTOR_BLOCK_KIND {
            return Err(Error::contract(format!(
                "executor block kind {} does not fit in 3 bits",
                self.executor_block_kind
            )));
        }
        if self.row_count > self.kind.max_row_count() {
            return Err(Error::contract(format!(
                "row count {} exceeds the {} maximum of {}",
                self.row_count,
                self.kind,
                self.kind.max_row_count()
            )));
        }
        if let Some(n) = self.first_row_num {
            if n < 0 {
                return Err(Error::contract(format!("first row number {} is negative", n)));
            }
        }
        match self.kind {
            HeaderKind::LargeContent => {
                if self.uncompressed_len == 0 || self.uncompressed_len > MAX_LARGE_CONTENT_LEN {
                    return Err(Error::contract(format!(
                        "large content length {} outside 1..={}",
                        self.uncompressed_len, MAX_LARGE_CONTENT_LEN
                    )));
                }
                if self.compressed_len != 0 {
                    return Err(Error::contract("large content headers carry no compressed length"));
                }
            }
            HeaderKind::NonBulkDenseContent if self.compressed_len != 0 => {
                return Err(Error::contract("NonBulkDenseContent blocks cannot be compressed"));
            }
            _ => {
                if self.uncompressed_len > MAX_DATA_LEN || self.compressed_len > MAX_DATA_LEN {
                    return Err(Error::contract(format!(
                        "data length {} / compressed length {} exceed {}",
                        self.uncompressed_len, self.compressed_len, MAX_DATA_LEN
                    )));
                }
                if self.compressed_len != 0 && self.compressed_len >= self.uncompressed_len {
                    return Err(Error::contract(format!(
                        "compressed length {} must be smaller than data length {}",
                        self.compressed_len, self.uncompressed_len
                    )));
                }
            }
        }
        Ok(())
    }

    fn pack(&self) -> (u64, Option<u64>) {
        let mut w = (self.kind as u64) << 60;
        if self.first_row_num.is_some() {
            w |= 1 << 59;
        }
        w |= (self.executor_block_kind as u64) << 56;
        let row = self.row_count as u64;
        let len = self.uncompressed_len as u64;
        match self.kind {
            HeaderKind::SmallContent => {
                w |= (row << 42) | (len << 21) | self.compressed_len as u64;
                (w, None)
            }
            HeaderKind::LargeContent => (w | (row << 30) | len, None),
            HeaderKind::NonBulkDenseContent => (w | (row << 26) | len, None),
            HeaderKind::BulkDenseContent => {
                (w | (row << 26) | len, Some(self.compressed_len as u64))
            }
        }
    }

    /// Writes the header into `buf[..header_len]`, zeroes the padding after
    /// the payload and fills in both checksums.
    ///
    /// The payload must already sit at `buf[header_len..header_len + stored_len]`.
    /// Returns the overall block length.
    pub fn write_into(
        &self,
        buf: &mut [u8],
        has_checksum: bool,
        version: FormatVersion,
    ) -> Result<usize> {
        self.validate()?;
        let header_len = self.header_len(has_checksum);
        let stored_len = self.stored_len();
        let overall = header_len + version.round_up(stored_len);
        if buf.len() < overall {
            return Err(Error::contract(format!(
                "block of {} bytes does not fit in a {}-byte buffer",
                overall,
                buf.len()
            )));
        }
        buf[header_len + stored_len..overall].fill(0);

        let (word0, word1) = self.pack();
        write_word(buf, 0, word0);
        if let Some(word1) = word1 {
            write_word(buf, REGULAR_HEADER_SIZE, word1);
        }
        let fixed_len = self.kind.fixed_len();
        let mut pos = fixed_len;
        if has_checksum {
            pos += CHECKSUM_SIZE;
        }
        if let Some(n) = self.first_row_num {
            buf[pos..pos + FIRST_ROW_NUM_SIZE].copy_from_slice(&n.to_le_bytes());
            pos += FIRST_ROW_NUM_SIZE;
        }
        debug_assert_eq!(pos, header_len);

        if has_checksum {
            let content_sum = build_content_checksum(&buf[header_len..header_len + stored_len]);
            write_u32(buf, fixed_len + 4, content_sum);
            let header_sum =
                build_header_checksum(&buf[..fixed_len], &buf[fixed_len + CHECKSUM_SIZE..header_len]);
            write_u32(buf, fixed_len, header_sum);
        }
        Ok(overall)
    }
}

// ── Decoding ───────────────────────────────────────────────────────────────

/// A validated block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub kind: HeaderKind,
    pub header_len: usize,
    /// Header plus padded payload. For LargeContent, just the header.
    pub overall_block_len: usize,
    pub executor_block_kind: u8,
    pub row_count: u32,
    pub uncompressed_len: u32,
    pub compressed_len: u32,
    pub first_row_num: Option<i64>,
    pub content_checksum: Option<u32>,
}

impl BlockInfo {
    pub fn is_compressed(&self) -> bool {
        self.compressed_len > 0
    }

    pub fn stored_len(&self) -> usize {
        if self.kind == HeaderKind::LargeContent {
            0
        } else if self.is_compressed() {
            self.compressed_len as usize
        } else {
            self.uncompressed_len as usize
        }
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} header: header length {}, overall block length {}, data length {}, compressed length {}, row count {}, executor block kind {}",
            self.kind,
            self.header_len,
            self.overall_block_len,
            self.uncompressed_len,
            self.compressed_len,
            self.row_count,
            self.executor_block_kind
        )?;
        match self.first_row_num {
            Some(n) => write!(f, ", first row number {}", n),
            None => write!(f, ", no first row number"),
        }
    }
}

/// Classifies a header from its first word: returns the kind and the full
/// header length. Needs only the first 4 bytes.
pub fn get_header_info(bytes: &[u8], has_checksum: bool) -> HeaderCheckResult<(HeaderKind, usize)> {
    ensure_len(bytes, 4)?;
    let word0 = read_u32(bytes, 0);
    if word0 == 0 {
        return Err(HeaderCheckError::ZeroFirstWord);
    }
    if word0 & (1 << 31) != 0 {
        return Err(HeaderCheckError::ReservedBitSet);
    }
    let raw_kind = ((word0 >> 28) & 0x7) as u8;
    let kind = HeaderKind::from_u8(raw_kind).ok_or(HeaderCheckError::InvalidKind(raw_kind))?;
    let has_first_row_num = word0 & (1 << 27) != 0;
    Ok((kind, header_length(kind, has_checksum, has_first_row_num)))
}

pub fn verify_header_checksum(bytes: &[u8], kind: HeaderKind, header_len: usize) -> HeaderCheckResult<()> {
    ensure_len(bytes, header_len)?;
    let fixed_len = kind.fixed_len();
    let stored = read_u32(bytes, fixed_len);
    let computed = build_header_checksum(&bytes[..fixed_len], &bytes[fixed_len + CHECKSUM_SIZE..header_len]);
    if stored != computed {
        return Err(HeaderCheckError::HeaderChecksum { stored, computed });
    }
    Ok(())
}

/// Checks the stored payload against the content checksum recorded in `info`.
pub fn verify_content_checksum(info: &BlockInfo, payload: &[u8]) -> HeaderCheckResult<()> {
    if let Some(stored) = info.content_checksum {
        let computed = build_content_checksum(payload);
        if stored != computed {
            return Err(HeaderCheckError::ContentChecksum { stored, computed });
        }
    }
    Ok(())
}

/// Validates and decodes a complete header: classification, header checksum
/// and the kind-specific fields.
pub fn decode_header(
    bytes: &[u8],
    has_checksum: bool,
    max_block_len: usize,
    version: FormatVersion,
) -> HeaderCheckResult<BlockInfo> {
    let (kind, header_len) = get_header_info(bytes, has_checksum)?;
    ensure_len(bytes, header_len)?;
    if has_checksum {
        verify_header_checksum(bytes, kind, header_len)?;
    }
    match kind {
        HeaderKind::SmallContent => {
            decode_small_content(bytes, header_len, has_checksum, max_block_len, version)
        }
        HeaderKind::LargeContent => decode_large_content(bytes, header_len, has_checksum),
        HeaderKind::NonBulkDenseContent => {
            decode_non_bulk_dense_content(bytes, header_len, has_checksum, max_block_len, version)
        }
        HeaderKind::BulkDenseContent => {
            decode_bulk_dense_content(bytes, header_len, has_checksum, max_block_len, version)
        }
    }
}

struct Common {
    word0: u64,
    executor_block_kind: u8,
    first_row_num: Option<i64>,
    content_checksum: Option<u32>,
}

fn decode_common(
    bytes: &[u8],
    kind: HeaderKind,
    header_len: usize,
    has_checksum: bool,
) -> HeaderCheckResult<Common> {
    ensure_len(bytes, header_len)?;
    let word0 = read_word(bytes, 0);
    let fixed_len = kind.fixed_len();
    let content_checksum = has_checksum.then(|| read_u32(bytes, fixed_len + 4));
    let first_row_num = if word0 & (1 << 59) != 0 {
        let at = fixed_len + if has_checksum { CHECKSUM_SIZE } else { 0 };
        let mut b = [0u8; 8];
        b.copy_from_slice(&bytes[at..at + FIRST_ROW_NUM_SIZE]);
        let n = i64::from_le_bytes(b);
        if n < 0 {
            return Err(HeaderCheckError::InvalidFirstRowNum(n));
        }
        Some(n)
    } else {
        None
    };
    Ok(Common {
        word0,
        executor_block_kind: ((word0 >> 56) & 0x7) as u8,
        first_row_num,
        content_checksum,
    })
}

fn check_lengths(
    header_len: usize,
    uncompressed_len: u32,
    compressed_len: u32,
    max_block_len: usize,
    version: FormatVersion,
) -> HeaderCheckResult<usize> {
    if compressed_len != 0 && compressed_len >= uncompressed_len {
        return Err(HeaderCheckError::CompressedNotSmaller {
            compressed_len,
            uncompressed_len,
        });
    }
    let stored = if compressed_len > 0 { compressed_len } else { uncompressed_len };
    let overall_len = header_len + version.round_up(stored as usize);
    if overall_len > max_block_len {
        return Err(HeaderCheckError::BlockTooLong {
            overall_len,
            max_len: max_block_len,
        });
    }
    Ok(overall_len)
}

pub fn decode_small_content(
    bytes: &[u8],
    header_len: usize,
    has_checksum: bool,
    max_block_len: usize,
    version: FormatVersion,
) -> HeaderCheckResult<BlockInfo> {
    let c = decode_common(bytes, HeaderKind::SmallContent, header_len, has_checksum)?;
    let row_count = ((c.word0 >> 42) & 0x3FFF) as u32;
    let uncompressed_len = ((c.word0 >> 21) & DATA_LEN_MASK) as u32;
    let compressed_len = (c.word0 & DATA_LEN_MASK) as u32;
    let overall_block_len =
        check_lengths(header_len, uncompressed_len, compressed_len, max_block_len, version)?;
    Ok(BlockInfo {
        kind: HeaderKind::SmallContent,
        header_len,
        overall_block_len,
        executor_block_kind: c.executor_block_kind,
        row_count,
        uncompressed_len,
        compressed_len,
        first_row_num: c.first_row_num,
        content_checksum: c.content_checksum,
    })
}

pub fn decode_large_content(
    bytes: &[u8],
    header_len: usize,
    has_checksum: bool,
) -> HeaderCheckResult<BlockInfo> {
    let c = decode_common(bytes, HeaderKind::LargeContent, header_len, has_checksum)?;
    let row_count = ((c.word0 >> 30) & 0x3FF_FFFF) as u32;
    let large_len = (c.word0 & 0x3FFF_FFFF) as u32;
    if large_len == 0 {
        return Err(HeaderCheckError::ZeroLargeContentLength);
    }
    Ok(BlockInfo {
        kind: HeaderKind::LargeContent,
        header_len,
        overall_block_len: header_len,
        executor_block_kind: c.executor_block_kind,
        row_count,
        uncompressed_len: large_len,
        compressed_len: 0,
        first_row_num: c.first_row_num,
        content_checksum: c.content_checksum,
    })
}

pub fn decode_non_bulk_dense_content(
    bytes: &[u8],
    header_len: usize,
    has_checksum: bool,
    max_block_len: usize,
    version: FormatVersion,
) -> HeaderCheckResult<BlockInfo> {
    let c = decode_common(bytes, HeaderKind::NonBulkDenseContent, header_len, has_checksum)?;
    if (c.word0 >> 21) & 0x1F != 0 {
        return Err(HeaderCheckError::ReservedFieldNotZero);
    }
    let row_count = ((c.word0 >> 26) & 0x3FFF_FFFF) as u32;
    let uncompressed_len = (c.word0 & DATA_LEN_MASK) as u32;
    let overall_block_len = check_lengths(header_len, uncompressed_len, 0, max_block_len, version)?;
    Ok(BlockInfo {
        kind: HeaderKind::NonBulkDenseContent,
        header_len,
        overall_block_len,
        executor_block_kind: c.executor_block_kind,
        row_count,
        uncompressed_len,
        compressed_len: 0,
        first_row_num: c.first_row_num,
        content_checksum: c.content_checksum,
    })
}

pub fn decode_bulk_dense_content(
    bytes: &[u8],
    header_len: usize,
    has_checksum: bool,
    max_block_len: usize,
    version: FormatVersion,
) -> HeaderCheckResult<BlockInfo> {
    let c = decode_common(bytes, HeaderKind::BulkDenseContent, header_len, has_checksum)?;
    let word1 = read_word(bytes, REGULAR_HEADER_SIZE);
    if (c.word0 >> 21) & 0x1F != 0 || word1 >> 21 != 0 {
        return Err(HeaderCheckError::ReservedFieldNotZero);
    }
    let row_count = ((c.word0 >> 26) & 0x3FFF_FFFF) as u32;
    let uncompressed_len = (c.word0 & DATA_LEN_MASK) as u32;
    let compressed_len = (word1 & DATA_LEN_MASK) as u32;
    let overall_block_len =
        check_lengths(header_len, uncompressed_len, compressed_len, max_block_len, version)?;
    Ok(BlockInfo {
        kind: HeaderKind::BulkDenseContent,
        header_len,
        overall_block_len,
        executor_block_kind: c.executor_block_kind,
        row_count,
        uncompressed_len,
        compressed_len,
        first_row_num: c.first_row_num,
        content_checksum: c.content_checksum,
    })
}
