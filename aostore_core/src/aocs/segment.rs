use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::format::FormatVersion;

use super::MAX_SEGMENTS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    #[default]
    Available,
    /// Compacted away; readers skip it.
    AwaitingDrop,
}

/// Committed length of one column's segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColumnEof {
    pub eof: u64,
    pub eof_uncompressed: u64,
}

/// Catalog row for one segment number of a column-oriented table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentFileInfo {
    pub segno: u32,
    pub total_tupcount: i64,
    pub format_version: FormatVersion,
    #[serde(default)]
    pub state: SegmentState,
    pub columns: Vec<ColumnEof>,
}

impl SegmentFileInfo {
    /// A fresh, empty segment.
    pub fn new(segno: u32, num_columns: usize) -> Result<Self> {
        if segno >= MAX_SEGMENTS {
            return Err(Error::contract(format!("segment number {} is not below {}", segno, MAX_SEGMENTS)));
        }
        Ok(Self {
            segno,
            total_tupcount: 0,
            format_version: FormatVersion::LATEST,
            state: SegmentState::Available,
            columns: vec![ColumnEof::default(); num_columns],
        })
    }

    pub fn column_eof(&self, column: usize) -> Result<ColumnEof> {
        self.columns.get(column).copied().ok_or_else(|| {
            Error::contract(format!("segment {} has no entry for column {}", self.segno, column))
        })
    }

    /// Scans skip segments with nothing committed in the given columns, and
    /// segments awaiting drop.
    pub fn is_scannable(&self, columns: &[usize]) -> bool {
        self.state == SegmentState::Available
            && self.total_tupcount > 0
            && columns
                .iter()
                .any(|&c| self.columns.get(c).map_or(false, |e| e.eof > 0))
    }
}

/// File number of `column` in segment `segno`.
pub fn segment_file_num(column: usize, segno: u32) -> u32 {
    column as u32 * MAX_SEGMENTS + segno
}

/// `<dir>/<relfilenode>` for file number 0, `<dir>/<relfilenode>.<n>` otherwise.
pub fn segment_file_path(dir: &Path, relfilenode: u32, file_num: u32) -> PathBuf {
    if file_num == 0 {
        dir.join(relfilenode.to_string())
    } else {
        dir.join(format!("{}.{}", relfilenode, file_num))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_numbers_and_paths() {
        assert_eq!(segment_file_num(0, 0), 0);
        assert_eq!(segment_file_num(0, 5), 5);
        assert_eq!(segment_file_num(2, 5), 261);
        let dir = Path::new("/data");
        assert_eq!(segment_file_path(dir, 16384, 0), PathBuf::from("/data/16384"));
        assert_eq!(segment_file_path(dir, 16384, 261), PathBuf::from("/data/16384.261"));
    }

    #[test]
    fn scannable_segments() {
        let mut seg = SegmentFileInfo::new(1, 2).unwrap();
        assert!(!seg.is_scannable(&[0, 1]));
        seg.total_tupcount = 10;
        seg.columns[1].eof = 100;
        assert!(seg.is_scannable(&[0, 1]));
        assert!(!seg.is_scannable(&[0]));
        seg.state = SegmentState::AwaitingDrop;
        assert!(!seg.is_scannable(&[0, 1]));
        assert!(SegmentFileInfo::new(128, 1).is_err());
    }
}
