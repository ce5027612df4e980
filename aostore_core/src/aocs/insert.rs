use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::format::{
    header_length, HeaderKind, EXECUTOR_KIND_DATUM_BLOCK, EXECUTOR_KIND_SINGLE_ROW, MAX_SMALL_CONTENT_ROW_COUNT,
};
use crate::writer::{StorageWrite, WriteStats};

use super::datum::{ColumnEncoding, DatumBlockBuilder, Value};
use super::directory::{BlockDirectory, DirectoryEntry};
use super::segment::{segment_file_num, segment_file_path, ColumnEof, SegmentFileInfo, SegmentState};
use super::sequence::NUM_FAST_SEQUENCES;
use super::{AocsServices, TableDesc, TupleId, MAX_ROW_NUM};

/// What a finished insert leaves behind.
#[derive(Debug, Clone)]
pub struct InsertOutcome {
    /// Catalog row to persist for the segment.
    pub segment: SegmentFileInfo,
    pub rows_inserted: i64,
    pub column_stats: Vec<WriteStats>,
}

struct ColumnWriter {
    column: usize,
    write: StorageWrite,
    builder: DatumBlockBuilder,
    block_first_row_num: i64,
}

impl ColumnWriter {
    fn block_kind(&self, rows: usize, has_codec: bool) -> HeaderKind {
        let small = self.builder.encoding() == ColumnEncoding::Plain && rows <= MAX_SMALL_CONTENT_ROW_COUNT as usize;
        match (small, has_codec) {
            (true, _) => HeaderKind::SmallContent,
            (false, true) => HeaderKind::BulkDenseContent,
            (false, false) => HeaderKind::NonBulkDenseContent,
        }
    }

    /// Write the pending datum block and register it in the directory.
    fn flush_block(&mut self, segno: u32, directory: &dyn BlockDirectory) -> Result<()> {
        if self.builder.is_empty() {
            return Ok(());
        }
        let rows = self.builder.row_count();
        let kind = self.block_kind(rows, self.write.attributes().compress.is_some());
        let offset = self.write.current_position();
        self.write.set_first_row_num(self.block_first_row_num)?;
        let len = {
            let buf = self.write.get_buffer(kind)?;
            self.builder.encode_into(buf)
        };
        let len = match len {
            Ok(len) => len,
            Err(e) => {
                self.write.cancel_last_buffer();
                return Err(e);
            }
        };
        if let Err(e) = self.write.finish_buffer(len, EXECUTOR_KIND_DATUM_BLOCK, rows as u32) {
            self.write.cancel_last_buffer();
            return Err(e);
        }
        directory.insert_entry(
            segno,
            self.column,
            DirectoryEntry {
                first_row_num: self.block_first_row_num,
                file_offset: offset,
                row_count: rows as i64,
            },
        )?;
        self.builder.reset();
        Ok(())
    }

    /// A value too large for an empty block goes out as its own
    /// LargeContent object.
    fn write_large(
        &mut self,
        value: Option<&Value>,
        row_num: i64,
        segno: u32,
        directory: &dyn BlockDirectory,
    ) -> Result<()> {
        let bytes = DatumBlockBuilder::single(self.builder.column_type(), value)?;
        let offset = self.write.current_position();
        self.write.set_first_row_num(row_num)?;
        self.write.content(&bytes, EXECUTOR_KIND_SINGLE_ROW, 1)?;
        directory.insert_entry(
            segno,
            self.column,
            DirectoryEntry {
                first_row_num: row_num,
                file_offset: offset,
                row_count: 1,
            },
        )?;
        debug!(column = self.column, row_num, len = bytes.len(), "wrote large value");
        Ok(())
    }

    fn append(&mut self, value: Option<&Value>, row_num: i64, segno: u32, directory: &dyn BlockDirectory) -> Result<()> {
        if self.builder.is_empty() {
            self.block_first_row_num = row_num;
        }
        if self.builder.try_push(value)? {
            return Ok(());
        }
        if !self.builder.is_empty() {
            self.flush_block(segno, directory)?;
            self.block_first_row_num = row_num;
            if self.builder.try_push(value)? {
                return Ok(());
            }
        }
        self.write_large(value, row_num, segno, directory)
    }
}

/// Appends rows to one segment of a column-oriented table.
///
/// All columns advance in lockstep: row `n` of every column file belongs to
/// the same tuple. Block boundaries differ per column; every block carries
/// its explicit first row number and gets a block directory entry.
///
/// Nothing becomes visible until [`AocsInsert::finish`] returns the updated
/// [`SegmentFileInfo`]. Dropping the insert abandons it; the bytes it wrote
/// past the committed EOFs are truncated by the next writer.
pub struct AocsInsert {
    table: TableDesc,
    segment: SegmentFileInfo,
    services: AocsServices,
    columns: Vec<ColumnWriter>,
    /// Next row number to hand out, and how many are reserved from it on.
    next_row_num: i64,
    reserved: i64,
    inserted: i64,
}

impl AocsInsert {
    /// Open every column file of `segment` for append.
    pub fn open(table: &TableDesc, dir: &Path, segment: SegmentFileInfo, services: AocsServices) -> Result<Self> {
        table.validate()?;
        if segment.columns.len() != table.columns.len() {
            return Err(Error::contract(format!(
                "segment {} describes {} columns, table '{}' has {}",
                segment.segno,
                segment.columns.len(),
                table.name,
                table.columns.len()
            )));
        }
        if segment.state != SegmentState::Available {
            return Err(Error::contract(format!("segment {} is awaiting drop", segment.segno)));
        }

        let node = table.rel_file_node();
        let mut columns = Vec::with_capacity(table.columns.len());
        for (i, desc) in table.columns.iter().enumerate() {
            let attrs = table.column_attributes(i)?;
            let mut write = StorageWrite::new(
                attrs.clone(),
                &table.name,
                &format!("column {}", desc.name),
                services.codecs.as_deref(),
            )?;
            if let Some(wal) = &services.wal {
                write = write.with_wal(Arc::clone(wal));
            }
            let file_num = segment_file_num(i, segment.segno);
            let path: PathBuf = segment_file_path(dir, table.relfilenode, file_num);
            let ColumnEof { eof, eof_uncompressed } = segment.column_eof(i)?;
            if !path.exists() {
                write.create_file(&path, node, file_num)?;
            }
            write.open_file(&path, segment.format_version, eof, eof_uncompressed, node, file_num)?;
            // every block carries a first row number; size for the longest header
            let capacity = attrs.max_buffer_len() - header_length(HeaderKind::BulkDenseContent, attrs.checksum, true);
            let builder = DatumBlockBuilder::new(desc.column_type, desc.encoding, capacity)?;
            columns.push(ColumnWriter {
                column: i,
                write,
                builder,
                block_first_row_num: 0,
            });
        }
        services.block_directory.init_for_insert(segment.segno, table.columns.len())?;

        info!(
            relation = %table.name,
            segno = segment.segno,
            tupcount = segment.total_tupcount,
            "opened segment for insert"
        );
        Ok(Self {
            table: table.clone(),
            segment,
            services,
            columns,
            next_row_num: 0,
            reserved: 0,
            inserted: 0,
        })
    }

    pub fn segno(&self) -> u32 {
        self.segment.segno
    }

    fn reserve_row_num(&mut self) -> Result<i64> {
        if self.reserved == 0 {
            let start = if self.next_row_num == 0 {
                self.segment.total_tupcount + 1
            } else {
                self.next_row_num
            };
            self.next_row_num = self.services.fast_sequence.get_next_n(
                self.table.relfilenode,
                self.segment.segno,
                start,
                NUM_FAST_SEQUENCES,
            )?;
            self.reserved = NUM_FAST_SEQUENCES;
            debug!(segno = self.segment.segno, first = self.next_row_num, "reserved row numbers");
        }
        let row_num = self.next_row_num;
        if row_num > MAX_ROW_NUM {
            return Err(Error::contract(format!(
                "segment {} ran out of row numbers",
                self.segment.segno
            )));
        }
        self.next_row_num += 1;
        self.reserved -= 1;
        Ok(row_num)
    }

    /// Append one row; `row[i]` is the value of column `i`.
    pub fn insert(&mut self, row: &[Option<Value>]) -> Result<TupleId> {
        if row.len() != self.columns.len() {
            return Err(Error::contract(format!(
                "row has {} values, table '{}' has {} columns",
                row.len(),
                self.table.name,
                self.columns.len()
            )));
        }
        for (value, desc) in row.iter().zip(&self.table.columns) {
            if let Some(v) = value {
                if v.column_type() != desc.column_type {
                    return Err(Error::contract(format!(
                        "column '{}' is {:?}, got a {:?} value",
                        desc.name,
                        desc.column_type,
                        v.column_type()
                    )));
                }
            }
        }

        let row_num = self.reserve_row_num()?;
        let segno = self.segment.segno;
        let directory = Arc::clone(&self.services.block_directory);
        for (writer, value) in self.columns.iter_mut().zip(row) {
            writer.append(value.as_ref(), row_num, segno, directory.as_ref())?;
        }
        self.inserted += 1;
        TupleId::new(segno, row_num)
    }

    /// Flush every column, close the files and publish the directory
    /// entries.
    pub fn finish(mut self) -> Result<InsertOutcome> {
        let segno = self.segment.segno;
        let directory = Arc::clone(&self.services.block_directory);
        let mut column_stats = Vec::with_capacity(self.columns.len());
        for writer in &mut self.columns {
            writer.flush_block(segno, directory.as_ref())?;
            let (eof, eof_uncompressed) = writer.write.flush_and_close_file()?;
            self.segment.columns[writer.column] = ColumnEof { eof, eof_uncompressed };
            column_stats.push(writer.write.stats());
        }
        directory.end_for_insert(segno)?;
        self.segment.total_tupcount += self.inserted;

        info!(
            relation = %self.table.name,
            segno,
            rows = self.inserted,
            tupcount = self.segment.total_tupcount,
            "finished insert"
        );
        for writer in self.columns.drain(..) {
            writer.write.finish_session();
        }
        Ok(InsertOutcome {
            segment: self.segment.clone(),
            rows_inserted: self.inserted,
            column_stats,
        })
    }
}
