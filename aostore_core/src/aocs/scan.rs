use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{BlockContext, Error, Result};
use crate::reader::StorageRead;

use super::column_reader::ColumnReader;
use super::datum::{Row, Value};
use super::segment::{segment_file_num, segment_file_path, SegmentFileInfo};
use super::visimap::VisibilityMap;
use super::{AocsServices, TableDesc, TupleId};

type Predicate = Box<dyn Fn(Option<&Value>) -> bool + Send>;

/// A predicate evaluated against one column while scanning.
pub struct ScanFilter {
    pub column: usize,
    predicate: Predicate,
}

impl ScanFilter {
    pub fn new(column: usize, predicate: impl Fn(Option<&Value>) -> bool + Send + 'static) -> Self {
        Self {
            column,
            predicate: Box::new(predicate),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    /// Rows evaluated before filter columns are reordered by selectivity.
    /// `0` keeps the given order.
    pub sample_rows: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self { sample_rows: 1000 }
    }
}

/// A visible row that passed every filter.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRow {
    pub tid: TupleId,
    /// Values of the projected columns, in projection order.
    pub values: Row,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub segments_scanned: u64,
    pub rows_returned: u64,
    pub rows_filtered: u64,
    pub rows_invisible: u64,
    pub blocks_read: u64,
    pub blocks_decompressed: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Selectivity {
    evaluated: u64,
    passed: u64,
}

impl Selectivity {
    fn pass_rate(&self) -> f64 {
        if self.evaluated == 0 {
            1.0
        } else {
            self.passed as f64 / self.evaluated as f64
        }
    }
}

/// Sequential scan over the segments of a column-oriented table.
///
/// The first column in read order drives the scan: its block first row
/// number plus the position inside the block gives the row number, and every
/// other column is asked for that row. Filter columns are read first so a
/// rejected row never touches the remaining columns; blocks those columns
/// pass over while rows are rejected are skipped without decompression.
///
/// After `sample_rows` rows the filter columns are reordered once, most
/// selective first.
pub struct AocsScan {
    table: TableDesc,
    dir: PathBuf,
    segments: Vec<SegmentFileInfo>,
    next_segment: usize,
    current_segno: Option<u32>,

    readers: Vec<ColumnReader>,
    /// Reader index of each projected column.
    projection: Vec<usize>,
    /// Reader indexes; filter columns first.
    read_order: Vec<usize>,
    filters: Vec<ScanFilter>,
    /// Filter index per reader.
    filter_of: Vec<Option<usize>>,
    selectivity: Vec<Selectivity>,

    options: ScanOptions,
    sampled: u64,
    reordered: bool,
    next_row_num: i64,

    visibility_map: Arc<dyn VisibilityMap>,
    stats: ScanStats,
}

impl AocsScan {
    /// Scan `segments` in order, returning the `projection` columns of rows
    /// that pass all `filters`.
    pub fn new(
        table: &TableDesc,
        dir: &Path,
        segments: Vec<SegmentFileInfo>,
        projection: &[usize],
        filters: Vec<ScanFilter>,
        options: ScanOptions,
        services: &AocsServices,
    ) -> Result<Self> {
        table.validate()?;
        for seg in &segments {
            if seg.columns.len() != table.columns.len() {
                return Err(Error::contract(format!(
                    "segment {} describes {} columns, table '{}' has {}",
                    seg.segno,
                    seg.columns.len(),
                    table.name,
                    table.columns.len()
                )));
            }
        }

        let mut columns: Vec<usize> = Vec::new();
        let reader_of = |columns: &mut Vec<usize>, column: usize| -> Result<usize> {
            table.column(column)?;
            Ok(match columns.iter().position(|&c| c == column) {
                Some(i) => i,
                None => {
                    columns.push(column);
                    columns.len() - 1
                }
            })
        };

        let mut read_order = Vec::new();
        let mut filter_readers = Vec::with_capacity(filters.len());
        for f in &filters {
            let r = reader_of(&mut columns, f.column)?;
            if filter_readers.contains(&r) {
                return Err(Error::contract(format!(
                    "more than one filter on column {}; combine them into one predicate",
                    f.column
                )));
            }
            filter_readers.push(r);
            read_order.push(r);
        }
        let mut proj = Vec::with_capacity(projection.len());
        for &c in projection {
            proj.push(reader_of(&mut columns, c)?);
        }
        if columns.is_empty() {
            // row numbers still come from somewhere
            reader_of(&mut columns, 0)?;
        }
        for r in 0..columns.len() {
            if !read_order.contains(&r) {
                read_order.push(r);
            }
        }

        let mut filter_of = vec![None; columns.len()];
        for (f, &r) in filter_readers.iter().enumerate() {
            filter_of[r] = Some(f);
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

        debug!(
            relation = %table.name,
            segments = segments.len(),
            columns = ?columns,
            filters = filters.len(),
            "begin scan"
        );
        let selectivity = vec![Selectivity::default(); filters.len()];
        Ok(Self {
            table: table.clone(),
            dir: dir.to_path_buf(),
            segments,
            next_segment: 0,
            current_segno: None,
            readers,
            projection: proj,
            read_order,
            filters,
            filter_of,
            selectivity,
            options,
            sampled: 0,
            reordered: false,
            next_row_num: 1,
            visibility_map: Arc::clone(&services.visibility_map),
            stats: ScanStats::default(),
        })
    }

    /// Column numbers in the order they are currently read.
    pub fn read_order(&self) -> Vec<usize> {
        self.read_order.iter().map(|&r| self.readers[r].column).collect()
    }

    pub fn stats(&self) -> ScanStats {
        let mut stats = self.stats;
        for r in &self.readers {
            let s = r.stats();
            stats.blocks_read += s.blocks;
            stats.blocks_decompressed += s.blocks_decompressed;
        }
        stats
    }

    fn needed_columns(&self) -> Vec<usize> {
        self.readers.iter().map(|r| r.column).collect()
    }

    fn open_next_segment(&mut self) -> Result<bool> {
        let needed = self.needed_columns();
        while self.next_segment < self.segments.len() {
            let seg = &self.segments[self.next_segment];
            self.next_segment += 1;
            if !seg.is_scannable(&needed) {
                debug!(segno = seg.segno, state = ?seg.state, tupcount = seg.total_tupcount, "skipping segment");
                continue;
            }
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
            self.next_row_num = 1;
            self.stats.segments_scanned += 1;
            debug!(segno = seg.segno, tupcount = seg.total_tupcount, "scanning segment");
            return Ok(true);
        }
        Ok(false)
    }

    fn close_segment(&mut self) {
        for reader in &mut self.readers {
            reader.close();
        }
        self.current_segno = None;
    }

    /// Put the filter columns with the lowest observed pass rate first.
    fn reorder_filters(&mut self) {
        let filters = self.filters.len();
        let mut order: Vec<usize> = self.read_order[..filters].to_vec();
        order.sort_by(|&a, &b| {
            let ra = self.filter_of[a].map_or(1.0, |f| self.selectivity[f].pass_rate());
            let rb = self.filter_of[b].map_or(1.0, |f| self.selectivity[f].pass_rate());
            ra.partial_cmp(&rb).unwrap_or(std::cmp::Ordering::Equal)
        });
        self.read_order[..filters].copy_from_slice(&order);
        self.reordered = true;
        debug!(
            sampled = self.sampled,
            order = ?self.read_order(),
            "reordered filter columns by selectivity"
        );
    }

    /// The next qualifying row, or `None` when every segment is done.
    pub fn next_row(&mut self) -> Result<Option<ScanRow>> {
        loop {
            let segno = match self.current_segno {
                Some(segno) => segno,
                None => {
                    if !self.open_next_segment()? {
                        return Ok(None);
                    }
                    continue;
                }
            };

            let driver = self.read_order[0];
            let row_num = match self.readers[driver].next_row_at_or_after(self.next_row_num)? {
                Some(row_num) => row_num,
                None => {
                    self.close_segment();
                    continue;
                }
            };
            self.next_row_num = row_num + 1;
            let tid = TupleId::new(segno, row_num)?;
            if !self.visibility_map.is_visible(tid) {
                self.stats.rows_invisible += 1;
                continue;
            }

            let mut values: Vec<Option<Value>> = vec![None; self.readers.len()];
            let mut rejected = false;
            for k in 0..self.read_order.len() {
                let r = self.read_order[k];
                let value = match self.readers[r].value_at(row_num)? {
                    Some(v) => v,
                    None => {
                        return Err(Error::corruption(
                            format!(
                                "column {} has no value for row {} present in column {}",
                                self.readers[r].column, row_num, self.readers[driver].column
                            ),
                            BlockContext::new(&self.table.name, self.readers[r].file_name(), 0),
                        ))
                    }
                };
                if let Some(f) = self.filter_of[r] {
                    let pass = (self.filters[f].predicate)(value.as_ref());
                    let sel = &mut self.selectivity[f];
                    sel.evaluated += 1;
                    if pass {
                        sel.passed += 1;
                    } else {
                        rejected = true;
                        break;
                    }
                }
                values[r] = value;
            }

            if !self.reordered && !self.filters.is_empty() && self.options.sample_rows > 0 {
                self.sampled += 1;
                if self.sampled >= self.options.sample_rows {
                    self.reorder_filters();
                }
            }
            if rejected {
                self.stats.rows_filtered += 1;
                continue;
            }

            let row = self.projection.iter().map(|&r| values[r].clone()).collect();
            self.stats.rows_returned += 1;
            trace!(%tid, "scan row");
            return Ok(Some(ScanRow { tid, values: row }));
        }
    }

    pub fn finish(mut self) {
        self.close_segment();
        let stats = self.stats();
        debug!(relation = %self.table.name, ?stats, "end scan");
        for reader in self.readers.drain(..) {
            reader.finish();
        }
    }
}

impl Iterator for AocsScan {
    type Item = Result<ScanRow>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}
