//! Block directory: maps a row number to the block holding it, per column.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};

use crate::error::{Error, Result};

use super::TupleId;

/// One block: rows `first_row_num..first_row_num + row_count` start at
/// `file_offset` of the column's segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub first_row_num: i64,
    pub file_offset: u64,
    pub row_count: i64,
}

impl DirectoryEntry {
    pub fn contains(&self, row_num: i64) -> bool {
        row_num >= self.first_row_num && row_num < self.first_row_num + self.row_count
    }
}

pub trait BlockDirectory: Send + Sync {
    /// Start registering blocks for `segno`. Entries become visible at
    /// `end_for_insert`.
    fn init_for_insert(&self, segno: u32, num_columns: usize) -> Result<()>;

    fn insert_entry(&self, segno: u32, column: usize, entry: DirectoryEntry) -> Result<()>;

    fn end_for_insert(&self, segno: u32) -> Result<()>;

    /// The entry covering `tid` in `column`, if any.
    fn get_entry(&self, tid: TupleId, column: usize) -> Result<Option<DirectoryEntry>>;
}

#[derive(Debug, Default)]
struct PendingInsert {
    num_columns: usize,
    entries: Vec<(usize, DirectoryEntry)>,
}

/// Entries kept sorted by first row number per (segment, column).
#[derive(Debug, Default)]
pub struct InMemoryBlockDirectory {
    entries: RwLock<HashMap<(u32, usize), Vec<DirectoryEntry>>>,
    pending: Mutex<HashMap<u32, PendingInsert>>,
}

impl InMemoryBlockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Published entries of one column, for tests and tooling.
    pub fn entries(&self, segno: u32, column: usize) -> Vec<DirectoryEntry> {
        self.entries
            .read()
            .get(&(segno, column))
            .cloned()
            .unwrap_or_default()
    }
}

impl BlockDirectory for InMemoryBlockDirectory {
    fn init_for_insert(&self, segno: u32, num_columns: usize) -> Result<()> {
        // entries of an insert that never ended are dropped here
        self.pending.lock().insert(
            segno,
            PendingInsert {
                num_columns,
                entries: Vec::new(),
            },
        );
        Ok(())
    }

    fn insert_entry(&self, segno: u32, column: usize, entry: DirectoryEntry) -> Result<()> {
        let mut pending = self.pending.lock();
        let insert = pending
            .get_mut(&segno)
            .ok_or_else(|| Error::contract(format!("block directory insert for segment {} not started", segno)))?;
        if column >= insert.num_columns {
            return Err(Error::contract(format!(
                "column {} out of range for a {}-column insert",
                column, insert.num_columns
            )));
        }
        insert.entries.push((column, entry));
        Ok(())
    }

    fn end_for_insert(&self, segno: u32) -> Result<()> {
        let insert = self
            .pending
            .lock()
            .remove(&segno)
            .ok_or_else(|| Error::contract(format!("block directory insert for segment {} not started", segno)))?;
        let mut entries = self.entries.write();
        for (column, entry) in insert.entries {
            let list = entries.entry((segno, column)).or_default();
            let at = list.partition_point(|e| e.first_row_num < entry.first_row_num);
            list.insert(at, entry);
        }
        Ok(())
    }

    fn get_entry(&self, tid: TupleId, column: usize) -> Result<Option<DirectoryEntry>> {
        let entries = self.entries.read();
        let list = match entries.get(&(tid.segno(), column)) {
            Some(list) => list,
            None => return Ok(None),
        };
        let after = list.partition_point(|e| e.first_row_num <= tid.row_num());
        Ok(after
            .checked_sub(1)
            .map(|i| list[i])
            .filter(|e| e.contains(tid.row_num())))
    }
}
