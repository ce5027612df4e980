use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::reader::StorageRead;

use super::column_reader::ColumnReader;
use super::datum::Row;
use super::directory::BlockDirectory;
use super::segment::{segment_file_num, segment_file_path, SegmentFileInfo, SegmentState};
use super::visimap::VisibilityMap;
use super::{AocsServices, TableDesc, TupleId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub fetches: u64,
    pub found: u64,
    /// Column values served from the block already held.
    pub cached_values: u64,
    pub segment_switches: u64,
    pub physical_reads: u64,
}

/// Random access to rows by tuple id.
///
/// Each column keeps the last block it read; a fetch inside that block's row
/// range reads nothing from disk. Otherwise the block directory gives the
/// block's offset and the column file is read from there.
pub struct AocsFetch {
    table: TableDesc,
    dir: PathBuf,
    segments: BTreeMap<u32, SegmentFileInfo>,
    readers: Vec<ColumnReader>,
    /// Reader index of each projected column.
    projection: Vec<usize>,
    current_segno: Option<u32>,
    block_directory: Arc<dyn BlockDirectory>,
    visibility_map: Arc<dyn VisibilityMap>,
    stats: FetchStats,
}

impl AocsFetch {
    pub fn new(
        table: &TableDesc,
        dir: &Path,
        segments: &[SegmentFileInfo],
        projection: &[usize],
        services: &AocsServices,
    ) -> Result<Self> {
        table.validate()?;
        if projection.is_empty() {
            return Err(Error::contract("fetch needs at least one projected column"));
        }
        let mut columns: Vec<usize> = Vec::new();
        let mut proj = Vec::with_capacity(projection.len());
        for &c in projection {
            table.column(c)?;
            let r = match columns.iter().position(|&x| x == c) {
                Some(r) => r,
                None => {
                    columns.push(c);
                    columns.len() - 1
                }
            };
            proj.push(r);
        }
        let mut readers = Vec::with_capacity(columns.len());
        for &c in &columns {
            let read = StorageRead::new(
                table.column_attributes(c)?,
                &table.name,
                &format!("column {}", table.columns[c].name),
                services.codecs.as_deref(),
            )?;
            readers.push(ColumnReader::new(c, table.columns[c].column_type, &table.name, read));
        }
        Ok(Self {
            table: table.clone(),
            dir: dir.to_path_buf(),
            segments: segments.iter().map(|s| (s.segno, s.clone())).collect(),
            readers,
            projection: proj,
            current_segno: None,
            block_directory: Arc::clone(&services.block_directory),
            visibility_map: Arc::clone(&services.visibility_map),
            stats: FetchStats::default(),
        })
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            physical_reads: self.readers.iter().map(|r| r.stats().physical_reads).sum(),
            ..self.stats
        }
    }

    fn switch_segment(&mut self, seg: &SegmentFileInfo) -> Result<()> {
        for reader in &mut self.readers {
            let eof = seg.column_eof(reader.column)?;
            let path = segment_file_path(
                &self.dir,
                self.table.relfilenode,
                segment_file_num(reader.column, seg.segno),
            );
            reader.open(&path, seg.format_version, eof.eof)?;
        }
        self.current_segno = Some(seg.segno);
        self.stats.segment_switches += 1;
        debug!(relation = %self.table.name, segno = seg.segno, "fetch switched segment");
        Ok(())
    }

    /// The projected values of `tid`, or `None` if the row does not exist or
    /// is not visible.
    pub fn fetch(&mut self, tid: TupleId) -> Result<Option<Row>> {
        self.stats.fetches += 1;
        let seg = match self.segments.get(&tid.segno()) {
            Some(seg) if seg.state == SegmentState::Available => seg.clone(),
            _ => return Ok(None),
        };
        if !self.visibility_map.is_visible(tid) {
            return Ok(None);
        }
        if self.current_segno != Some(seg.segno) {
            self.switch_segment(&seg)?;
        }

        let row_num = tid.row_num();
        let mut values = Vec::with_capacity(self.readers.len());
        for reader in &mut self.readers {
            if reader.cached_contains(row_num) {
                self.stats.cached_values += 1;
            } else {
                let entry = match self.block_directory.get_entry(tid, reader.column)? {
                    Some(entry) => entry,
                    None => return Ok(None),
                };
                if entry.file_offset >= seg.column_eof(reader.column)?.eof {
                    return Ok(None);
                }
                reader.seek_to(entry.file_offset, entry.first_row_num)?;
            }
            match reader.value_at(row_num)? {
                Some(value) => values.push(value),
                None => return Ok(None),
            }
        }
        self.stats.found += 1;
        trace!(%tid, "fetched row");
        Ok(Some(self.projection.iter().map(|&r| values[r].clone()).collect()))
    }

    pub fn finish(mut self) {
        for reader in self.readers.drain(..) {
            reader.finish();
        }
    }
}
