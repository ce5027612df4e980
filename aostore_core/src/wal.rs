//! Write-ahead log hook for append-only writes.
//!
//! The buffered appender writes bytes to the segment file first and only
//! then emits a record describing them. Replay is out of scope here.

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Identifies the relation a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RelFileNode {
    pub tablespace: u32,
    pub database: u32,
    pub relation: u32,
}

/// One append record: `data` was written at `offset` in segment file
/// `segment_file_num`. An empty `data` announces file creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AoRecord {
    pub node: RelFileNode,
    pub segment_file_num: u32,
    pub offset: u64,
    pub data: Vec<u8>,
}

pub trait AoWal: Send + Sync {
    fn append_ao_record(
        &self,
        node: RelFileNode,
        segment_file_num: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<()>;
}

/// Keeps every record in memory. Optionally fails once a given number of
/// records has been accepted.
#[derive(Debug, Default)]
pub struct RecordingWal {
    records: Mutex<Vec<AoRecord>>,
    fail_after: Option<usize>,
}

impl RecordingWal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `n` records, then fail every further append.
    pub fn failing_after(n: usize) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail_after: Some(n),
        }
    }

    pub fn records(&self) -> Vec<AoRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AoWal for RecordingWal {
    fn append_ao_record(
        &self,
        node: RelFileNode,
        segment_file_num: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let mut records = self.records.lock();
        if let Some(limit) = self.fail_after {
            if records.len() >= limit {
                return Err(Error::Wal(format!(
                    "log refused record for segment file {} at offset {}",
                    segment_file_num, offset
                )));
            }
        }
        records.push(AoRecord {
            node,
            segment_file_num,
            offset,
            data: data.to_vec(),
        });
        Ok(())
    }
}
