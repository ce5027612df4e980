//! CRC-32C checksums stored in block headers.
//!
//! The header checksum covers every header byte except the two checksum
//! words themselves: the fixed 8- or 16-byte part and, when present, the
//! trailing first-row-number. The content checksum covers the stored
//! (possibly compressed) payload without padding.

use crc32c::{crc32c, crc32c_append};

/// Checksum of a header laid out as `fixed ++ [checksum words] ++ trailer`.
pub fn build_header_checksum(fixed: &[u8], trailer: &[u8]) -> u32 {
    crc32c_append(crc32c(fixed), trailer)
}

pub fn build_content_checksum(content: &[u8]) -> u32 {
    crc32c(content)
}
