//! Buffered appends to one segment file.
//!
//! Blocks are formed in place inside a single memory area that holds up to
//! `max_large_write_len` bytes of finished blocks plus one block being built
//! (`max_buffer_len`). Once the finished bytes reach `max_large_write_len`
//! exactly that many are written in one physical write, the overflow is moved
//! to the front and, if requested, a WAL record for the written range is
//! emitted after the write.

use std::fs::File;
use std::io;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::wal::{AoWal, RelFileNode};

/// The physical file behind a [`BufferedAppend`].
pub trait AppendFile: Send {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn sync_all(&mut self) -> io::Result<()>;
}

impl AppendFile for File {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        io::Write::write_all(self, buf)
    }

    fn sync_all(&mut self) -> io::Result<()> {
        File::sync_all(self)
    }
}

/// Where WAL records for this file go.
#[derive(Clone)]
pub struct WalTarget {
    pub wal: Arc<dyn AoWal>,
    pub node: RelFileNode,
    pub segment_file_num: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendStats {
    pub physical_writes: u64,
    pub bytes_written: u64,
}

pub struct BufferedAppend {
    memory: Vec<u8>,
    max_buffer_len: usize,
    max_large_write_len: usize,

    /// File offset of `memory[0]`.
    large_write_pos: u64,
    /// Finished bytes at the front of `memory` not yet written.
    large_write_len: usize,
    /// Length of the outstanding buffer, if one was handed out.
    buffer_len: Option<usize>,

    file: Option<Box<dyn AppendFile>>,
    file_name: String,
    file_len: u64,
    file_len_uncompressed: u64,
    wal: Option<WalTarget>,
    stats: AppendStats,
}

impl BufferedAppend {
    pub fn new(max_buffer_len: usize, max_large_write_len: usize) -> Result<Self> {
        if max_buffer_len == 0 || max_large_write_len < max_buffer_len {
            return Err(Error::contract(format!(
                "large write length {} must be at least the buffer length {}",
                max_large_write_len, max_buffer_len
            )));
        }
        Ok(Self {
            memory: vec![0u8; max_buffer_len + max_large_write_len],
            max_buffer_len,
            max_large_write_len,
            large_write_pos: 0,
            large_write_len: 0,
            buffer_len: None,
            file: None,
            file_name: String::new(),
            file_len: 0,
            file_len_uncompressed: 0,
            wal: None,
            stats: AppendStats::default(),
        })
    }

    /// Start appending to `file` at `eof`. The file must already be positioned
    /// (or truncated) there.
    pub fn set_file(
        &mut self,
        file: Box<dyn AppendFile>,
        file_name: &str,
        eof: u64,
        eof_uncompressed: u64,
        wal: Option<WalTarget>,
    ) -> Result<()> {
        if self.file.is_some() {
            return Err(Error::contract(format!(
                "buffered append already has file '{}' open",
                self.file_name
            )));
        }
        self.file = Some(file);
        self.file_name = file_name.to_string();
        self.large_write_pos = eof;
        self.large_write_len = 0;
        self.buffer_len = None;
        self.file_len = eof;
        self.file_len_uncompressed = eof_uncompressed;
        self.wal = wal;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn max_buffer_len(&self) -> usize {
        self.max_buffer_len
    }

    /// File offset the next acquired buffer will be written at.
    pub fn next_buffer_position(&self) -> u64 {
        self.large_write_pos + self.large_write_len as u64
    }

    /// Logical length including finished but unwritten bytes.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn stats(&self) -> AppendStats {
        self.stats
    }

    fn ensure_open(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(Error::contract("buffered append has no open file"));
        }
        Ok(())
    }

    /// Hand out a buffer of `len` bytes for the next block.
    pub fn get_buffer(&mut self, len: usize) -> Result<&mut [u8]> {
        self.ensure_open()?;
        if self.buffer_len.is_some() {
            return Err(Error::contract("a buffer is already outstanding"));
        }
        if len == 0 || len > self.max_buffer_len {
            return Err(Error::contract(format!(
                "requested buffer length {} outside 1..={}",
                len, self.max_buffer_len
            )));
        }
        self.buffer_len = Some(len);
        let start = self.large_write_len;
        Ok(&mut self.memory[start..start + len])
    }

    /// Hand out the largest buffer, or `None` when a buffer is outstanding.
    pub fn get_max_buffer(&mut self) -> Option<&mut [u8]> {
        if self.file.is_none() || self.buffer_len.is_some() {
            return None;
        }
        self.buffer_len = Some(self.max_buffer_len);
        let start = self.large_write_len;
        Some(&mut self.memory[start..start + self.max_buffer_len])
    }

    /// The outstanding buffer again, as handed out.
    pub fn outstanding_buffer(&mut self) -> Result<&mut [u8]> {
        let len = self
            .buffer_len
            .ok_or_else(|| Error::contract("no buffer is outstanding"))?;
        let start = self.large_write_len;
        Ok(&mut self.memory[start..start + len])
    }

    /// Forget the outstanding buffer. Nothing is written.
    pub fn cancel_last_buffer(&mut self) {
        self.buffer_len = None;
    }

    pub fn is_buffer_outstanding(&self) -> bool {
        self.buffer_len.is_some()
    }

    /// Commit the first `used_len` bytes of the outstanding buffer.
    pub fn finish_buffer(
        &mut self,
        used_len: usize,
        used_uncompressed_len: usize,
        needs_wal: bool,
    ) -> Result<()> {
        let acquired = self
            .buffer_len
            .take()
            .ok_or_else(|| Error::contract("finish_buffer without an outstanding buffer"))?;
        if used_len > acquired {
            return Err(Error::contract(format!(
                "used length {} exceeds the acquired buffer of {} bytes",
                used_len, acquired
            )));
        }
        self.large_write_len += used_len;
        self.file_len += used_len as u64;
        self.file_len_uncompressed += used_uncompressed_len as u64;

        if self.large_write_len >= self.max_large_write_len {
            self.write(self.max_large_write_len, needs_wal)?;
            let carry = self.large_write_len - self.max_large_write_len;
            self.memory
                .copy_within(self.max_large_write_len..self.max_large_write_len + carry, 0);
            self.large_write_pos += self.max_large_write_len as u64;
            self.large_write_len = carry;
        }
        Ok(())
    }

    /// Write `memory[..len]` at `large_write_pos`, then log it.
    fn write(&mut self, len: usize, needs_wal: bool) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::contract("buffered append has no open file"))?;
        file.write_all(&self.memory[..len]).map_err(|e| {
            Error::io(
                format!("could not write {} bytes at offset {} of '{}'", len, self.large_write_pos, self.file_name),
                e,
            )
        })?;
        self.stats.physical_writes += 1;
        self.stats.bytes_written += len as u64;
        trace!(file = %self.file_name, offset = self.large_write_pos, len, "physical write");

        if needs_wal {
            if let Some(target) = &self.wal {
                target.wal.append_ao_record(
                    target.node,
                    target.segment_file_num,
                    self.large_write_pos,
                    &self.memory[..len],
                )?;
            }
        }
        Ok(())
    }

    /// Write whatever is pending and give the file back.
    ///
    /// Returns `(eof, eof_uncompressed, file)`.
    pub fn complete_file(&mut self, needs_wal: bool) -> Result<(u64, u64, Box<dyn AppendFile>)> {
        self.ensure_open()?;
        if self.buffer_len.is_some() {
            return Err(Error::contract("cannot complete file with an outstanding buffer"));
        }
        if self.large_write_len > 0 {
            self.write(self.large_write_len, needs_wal)?;
            self.large_write_pos += self.large_write_len as u64;
            self.large_write_len = 0;
        }
        debug_assert_eq!(self.large_write_pos, self.file_len);
        let file = self
            .file
            .take()
            .ok_or_else(|| Error::contract("buffered append has no open file"))?;
        debug!(
            file = %self.file_name,
            eof = self.file_len,
            eof_uncompressed = self.file_len_uncompressed,
            writes = self.stats.physical_writes,
            "completed segment file"
        );
        self.wal = None;
        Ok((self.file_len, self.file_len_uncompressed, file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every physical write.
    #[derive(Clone, Default)]
    struct MemFile(Arc<Mutex<Vec<Vec<u8>>>>);

    impl AppendFile for MemFile {
        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.0.lock().push(buf.to_vec());
            Ok(())
        }

        fn sync_all(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn append_block(ba: &mut BufferedAppend, len: usize, fill: u8) {
        let buf = ba.get_buffer(len).unwrap();
        buf.fill(fill);
        ba.finish_buffer(len, len, false).unwrap();
    }

    #[test]
    fn writes_exactly_large_write_len_and_carries_rest() {
        let file = MemFile::default();
        let mut ba = BufferedAppend::new(100, 200).unwrap();
        ba.set_file(Box::new(file.clone()), "t", 0, 0, None).unwrap();

        append_block(&mut ba, 90, 1);
        append_block(&mut ba, 90, 2);
        assert!(file.0.lock().is_empty());
        append_block(&mut ba, 90, 3);
        {
            let writes = file.0.lock();
            assert_eq!(writes.len(), 1);
            assert_eq!(writes[0].len(), 200);
            assert_eq!(writes[0][179], 2);
            assert_eq!(writes[0][199], 3);
        }
        assert_eq!(ba.next_buffer_position(), 270);

        let (eof, eof_uncompressed, _) = ba.complete_file(false).unwrap();
        assert_eq!((eof, eof_uncompressed), (270, 270));
        let writes = file.0.lock();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1], vec![3u8; 70]);
        let total: usize = writes.iter().map(|w| w.len()).sum();
        assert_eq!(total as u64, eof);
    }

    #[test]
    fn cancel_discards_buffer() {
        let file = MemFile::default();
        let mut ba = BufferedAppend::new(64, 128).unwrap();
        ba.set_file(Box::new(file.clone()), "t", 1000, 4000, None).unwrap();
        ba.get_buffer(10).unwrap().fill(9);
        ba.cancel_last_buffer();
        assert!(ba.get_max_buffer().is_some());
        ba.cancel_last_buffer();
        let (eof, eof_uncompressed, _) = ba.complete_file(false).unwrap();
        assert_eq!((eof, eof_uncompressed), (1000, 4000));
        assert!(file.0.lock().is_empty());
    }

    #[test]
    fn buffer_protocol_violations() {
        let mut ba = BufferedAppend::new(64, 128).unwrap();
        assert!(ba.get_buffer(8).is_err());
        ba.set_file(Box::new(MemFile::default()), "t", 0, 0, None).unwrap();
        assert!(ba.finish_buffer(1, 1, false).is_err());
        assert!(ba.get_buffer(65).is_err());
        ba.get_buffer(8).unwrap();
        assert!(ba.get_max_buffer().is_none());
        assert!(ba.finish_buffer(9, 9, false).is_err());
        assert!(BufferedAppend::new(64, 32).is_err());
    }
}
