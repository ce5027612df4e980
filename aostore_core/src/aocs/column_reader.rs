use std::path::Path;

use crate::error::{BlockContext, Error, Result};
use crate::format::FormatVersion;
use crate::reader::{ReadBlock, ReadSessionStats, StorageRead};

use super::datum::{ColumnType, DatumBlock, Value};

/// One column's read session plus the block it is positioned on.
///
/// Headers are read as the row position moves forward; a block's content
/// is only decompressed and parsed when a value from it is asked for.
pub(crate) struct ColumnReader {
    pub column: usize,
    column_type: ColumnType,
    relation: String,
    read: StorageRead,
    block: Option<ReadBlock>,
    decoded: Option<DatumBlock>,
}

impl ColumnReader {
    pub fn new(column: usize, column_type: ColumnType, relation: &str, read: StorageRead) -> Self {
        Self {
            column,
            column_type,
            relation: relation.to_string(),
            read,
            block: None,
            decoded: None,
        }
    }

    pub fn open(&mut self, path: &Path, version: FormatVersion, eof: u64) -> Result<()> {
        self.close();
        self.read.open_file(path, version, eof)
    }

    pub fn close(&mut self) {
        self.read.close_file();
        self.block = None;
        self.decoded = None;
    }

    pub fn file_name(&self) -> &str {
        self.read.file_name()
    }

    pub fn stats(&self) -> ReadSessionStats {
        self.read.stats()
    }

    /// Rows of the block currently held, if any.
    pub fn cached_contains(&self, row_num: i64) -> bool {
        self.block.map_or(false, |b| b.contains_row(row_num))
    }

    /// Forget the current block and read headers from `offset` on.
    pub fn seek_to(&mut self, offset: u64, first_row_num: i64) -> Result<()> {
        self.block = None;
        self.decoded = None;
        self.read.seek_to(offset, first_row_num)
    }

    fn next_block(&mut self) -> Result<bool> {
        self.decoded = None;
        if !self.read.read_next_block()? {
            self.block = None;
            return Ok(false);
        }
        self.block = self.read.current().copied();
        Ok(true)
    }

    /// The smallest row number at or after `target` present in this column,
    /// or `None` once the file is exhausted. Blocks passed over are skipped
    /// without reading their content.
    pub fn next_row_at_or_after(&mut self, target: i64) -> Result<Option<i64>> {
        loop {
            if let Some(b) = self.block {
                if target < b.next_row_num() {
                    return Ok(Some(target.max(b.first_row_num)));
                }
            }
            if !self.next_block()? {
                return Ok(None);
            }
        }
    }

    /// Value of `row_num`, reading forward from the current position.
    /// `None` when this column has no such row.
    pub fn value_at(&mut self, row_num: i64) -> Result<Option<Option<Value>>> {
        loop {
            match self.block {
                Some(b) if b.contains_row(row_num) => break,
                Some(b) if b.first_row_num > row_num => return Ok(None),
                _ => {}
            }
            if !self.next_block()? {
                return Ok(None);
            }
        }
        let block = match self.block {
            Some(b) => b,
            None => return Ok(None),
        };
        if self.decoded.is_none() {
            let context = BlockContext::new(&self.relation, self.read.file_name(), block.header_offset)
                .with_header(block.info);
            let bytes = self.read.content()?.to_vec();
            let decoded = DatumBlock::parse(bytes, self.column_type)
                .map_err(|e| Error::corruption(e, context.clone()))?;
            if decoded.len() != block.row_count() as usize {
                return Err(Error::corruption(
                    format!(
                        "datum block holds {} items, header row count is {}",
                        decoded.len(),
                        block.row_count()
                    ),
                    context,
                ));
            }
            self.decoded = Some(decoded);
        }
        let decoded = match &self.decoded {
            Some(d) => d,
            None => return Ok(None),
        };
        let index = (row_num - block.first_row_num) as usize;
        let value = decoded.get(index).map_err(|e| {
            Error::corruption(
                e,
                BlockContext::new(&self.relation, self.read.file_name(), block.header_offset),
            )
        })?;
        Ok(Some(value))
    }

    pub fn finish(self) {
        self.read.finish_session();
    }
}
