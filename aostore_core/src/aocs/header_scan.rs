use std::path::Path;

use crate::codec::CodecProvider;
use crate::config::StorageAttributes;
use crate::error::Result;
use crate::format::FormatVersion;
use crate::reader::{ReadBlock, StorageRead};

use super::segment::{segment_file_num, segment_file_path, SegmentFileInfo};
use super::TableDesc;

/// Walks the block headers of one column file. Content is stepped over,
/// never decompressed.
pub struct AocsHeaderScan {
    read: StorageRead,
}

impl AocsHeaderScan {
    /// Headers of `column` in segment `seg`.
    pub fn open(table: &TableDesc, dir: &Path, seg: &SegmentFileInfo, column: usize) -> Result<Self> {
        let attrs = table.column_attributes(column)?;
        let path = segment_file_path(dir, table.relfilenode, segment_file_num(column, seg.segno));
        let eof = seg.column_eof(column)?.eof;
        Self::open_file(attrs, &table.name, &path, seg.format_version, eof, None)
    }

    /// Headers of an arbitrary segment file up to `eof`.
    pub fn open_file(
        attrs: StorageAttributes,
        relation: &str,
        path: &Path,
        version: FormatVersion,
        eof: u64,
        codecs: Option<&dyn CodecProvider>,
    ) -> Result<Self> {
        // headers carry everything needed; no codec unless the caller wants one
        let attrs = if codecs.is_none() {
            StorageAttributes { compress: None, ..attrs }
        } else {
            attrs
        };
        let mut read = StorageRead::new(attrs, relation, "header scan", codecs)?;
        read.open_file(path, version, eof)?;
        Ok(Self { read })
    }

    pub fn next_header(&mut self) -> Result<Option<ReadBlock>> {
        if !self.read.read_next_block()? {
            return Ok(None);
        }
        Ok(self.read.current().copied())
    }

    /// Content of the header last returned, decompressed. Needs a codec
    /// for compressed blocks.
    pub fn content(&mut self) -> Result<&[u8]> {
        self.read.content()
    }

    pub fn finish(self) {
        self.read.finish_session();
    }
}

impl Iterator for AocsHeaderScan {
    type Item = Result<ReadBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_header().transpose()
    }
}
