//! Column-oriented append-only tables.
//!
//! Every column of every segment lives in its own segment file, written and
//! read through a [`StorageWrite`](crate::writer::StorageWrite) /
//! [`StorageRead`](crate::reader::StorageRead) session. The types here keep
//! those sessions in lockstep so that callers see whole rows.

mod column_reader;
pub mod datum;
pub mod directory;
pub mod fetch;
pub mod header_scan;
pub mod insert;
pub mod scan;
pub mod segment;
pub mod sequence;
pub mod visimap;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::{CodecProvider, CompressionKind};
use crate::config::StorageAttributes;
use crate::error::{Error, Result};
use crate::format::DEFAULT_BLOCK_SIZE;
use crate::wal::{AoWal, RelFileNode};

pub use datum::{ColumnEncoding, ColumnType, Row, Value};
pub use directory::{BlockDirectory, DirectoryEntry, InMemoryBlockDirectory};
pub use fetch::{AocsFetch, FetchStats};
pub use header_scan::AocsHeaderScan;
pub use insert::{AocsInsert, InsertOutcome};
pub use scan::{AocsScan, ScanFilter, ScanOptions, ScanRow, ScanStats};
pub use segment::{segment_file_num, segment_file_path, ColumnEof, SegmentFileInfo, SegmentState};
pub use sequence::{FastSequence, InMemoryFastSequence, NUM_FAST_SEQUENCES};
pub use visimap::{InMemoryVisibilityMap, VisibilityMap};

/// Segment numbers fit in 7 bits.
pub const MAX_SEGMENTS: u32 = 128;
/// Row numbers fit in 40 bits.
pub const MAX_ROW_NUM: i64 = (1 << 40) - 1;

const ROW_NUM_BITS: u32 = 40;

// ── Tuple id ───────────────────────────────────────────────────────────────

/// Row identifier: segment number and row number within the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleId {
    segno: u32,
    row_num: i64,
}

impl TupleId {
    pub fn new(segno: u32, row_num: i64) -> Result<Self> {
        if segno >= MAX_SEGMENTS {
            return Err(Error::contract(format!("segment number {} is not below {}", segno, MAX_SEGMENTS)));
        }
        if !(1..=MAX_ROW_NUM).contains(&row_num) {
            return Err(Error::contract(format!("row number {} outside 1..={}", row_num, MAX_ROW_NUM)));
        }
        Ok(Self { segno, row_num })
    }

    pub fn segno(&self) -> u32 {
        self.segno
    }

    pub fn row_num(&self) -> i64 {
        self.row_num
    }

    pub fn to_u64(self) -> u64 {
        ((self.segno as u64) << ROW_NUM_BITS) | self.row_num as u64
    }

    pub fn from_u64(packed: u64) -> Result<Self> {
        Self::new((packed >> ROW_NUM_BITS) as u32, (packed & MAX_ROW_NUM as u64) as i64)
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.segno, self.row_num)
    }
}

// ── Table description ──────────────────────────────────────────────────────

fn default_block_size() -> usize {
    DEFAULT_BLOCK_SIZE
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDesc {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub encoding: ColumnEncoding,
    #[serde(default)]
    pub compress: Option<CompressionKind>,
    #[serde(default)]
    pub compress_level: i32,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

impl ColumnDesc {
    pub fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            column_type,
            encoding: ColumnEncoding::Plain,
            compress: None,
            compress_level: 0,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn run_length(mut self) -> Self {
        self.encoding = ColumnEncoding::RunLength;
        self
    }

    pub fn compressed(mut self, kind: CompressionKind, level: i32) -> Self {
        self.compress = Some(kind);
        self.compress_level = level;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDesc {
    pub name: String,
    pub relfilenode: u32,
    #[serde(default)]
    pub tablespace: u32,
    #[serde(default)]
    pub database: u32,
    #[serde(default = "default_true")]
    pub checksum: bool,
    pub columns: Vec<ColumnDesc>,
}

impl TableDesc {
    pub fn new(name: &str, relfilenode: u32, columns: Vec<ColumnDesc>) -> Self {
        Self {
            name: name.to_string(),
            relfilenode,
            tablespace: 0,
            database: 0,
            checksum: true,
            columns,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(Error::config(format!("table '{}' has no columns", self.name)));
        }
        for (i, _) in self.columns.iter().enumerate() {
            self.column_attributes(i)?.validate()?;
        }
        for col in &self.columns {
            if col.encoding == ColumnEncoding::RunLength && col.column_type.fixed_width().is_none() {
                return Err(Error::config(format!(
                    "column '{}': run-length encoding needs a fixed-width type",
                    col.name
                )));
            }
        }
        Ok(())
    }

    pub fn column(&self, column: usize) -> Result<&ColumnDesc> {
        self.columns.get(column).ok_or_else(|| {
            Error::contract(format!("table '{}' has no column {}", self.name, column))
        })
    }

    /// Storage settings of one column's segment files.
    pub fn column_attributes(&self, column: usize) -> Result<StorageAttributes> {
        let col = self.column(column)?;
        Ok(StorageAttributes {
            checksum: self.checksum,
            compress: col.compress,
            compress_level: col.compress_level,
            block_size: col.block_size,
            ..StorageAttributes::default()
        })
    }

    pub fn rel_file_node(&self) -> RelFileNode {
        RelFileNode {
            tablespace: self.tablespace,
            database: self.database,
            relation: self.relfilenode,
        }
    }
}

// ── Services ───────────────────────────────────────────────────────────────

/// The external services an AOCS table talks to.
#[derive(Clone)]
pub struct AocsServices {
    pub block_directory: Arc<dyn BlockDirectory>,
    pub visibility_map: Arc<dyn VisibilityMap>,
    pub fast_sequence: Arc<dyn FastSequence>,
    pub wal: Option<Arc<dyn AoWal>>,
    pub codecs: Option<Arc<dyn CodecProvider>>,
}

impl AocsServices {
    /// In-memory directory, visibility map and sequence; no WAL.
    pub fn in_memory(codecs: Option<Arc<dyn CodecProvider>>) -> Self {
        Self {
            block_directory: Arc::new(InMemoryBlockDirectory::new()),
            visibility_map: Arc::new(InMemoryVisibilityMap::new()),
            fast_sequence: Arc::new(InMemoryFastSequence::new()),
            wal: None,
            codecs,
        }
    }

    pub fn with_wal(mut self, wal: Arc<dyn AoWal>) -> Self {
        self.wal = Some(wal);
        self
    }
}
