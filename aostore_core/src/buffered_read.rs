//! Large sequential reads of one segment file, bounded by its logical EOF.
//!
//! Callers peek at up to `max_buffer_len` bytes at the current position and
//! then advance past what they consumed. Bytes past the logical EOF are never
//! read, even when the physical file is longer.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use tracing::trace;

use crate::error::{BlockContext, Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub physical_reads: u64,
    pub bytes_read: u64,
}

pub struct BufferedRead {
    memory: Vec<u8>,
    max_buffer_len: usize,

    file: Option<File>,
    file_name: String,
    file_len: u64,

    /// File offset of `memory[0]`.
    large_read_pos: u64,
    /// Valid bytes in `memory`.
    large_read_len: usize,
    /// Current position within `memory`.
    buffer_offset: usize,
    stats: ReadStats,
}

impl BufferedRead {
    pub fn new(max_buffer_len: usize, max_large_read_len: usize) -> Result<Self> {
        if max_buffer_len == 0 || max_large_read_len < max_buffer_len {
            return Err(Error::contract(format!(
                "large read length {} must be at least the buffer length {}",
                max_large_read_len, max_buffer_len
            )));
        }
        Ok(Self {
            memory: vec![0u8; max_large_read_len],
            max_buffer_len,
            file: None,
            file_name: String::new(),
            file_len: 0,
            large_read_pos: 0,
            large_read_len: 0,
            buffer_offset: 0,
            stats: ReadStats::default(),
        })
    }

    pub fn set_file(&mut self, file: File, file_name: &str, logical_eof: u64) {
        self.file = Some(file);
        self.file_name = file_name.to_string();
        self.file_len = logical_eof;
        self.large_read_pos = 0;
        self.large_read_len = 0;
        self.buffer_offset = 0;
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn position(&self) -> u64 {
        self.large_read_pos + self.buffer_offset as u64
    }

    pub fn remaining(&self) -> u64 {
        self.file_len.saturating_sub(self.position())
    }

    pub fn stats(&self) -> ReadStats {
        self.stats
    }

    /// Reposition at `pos`; the next peek reads from there.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.file_len {
            return Err(Error::contract(format!(
                "seek to {} past logical EOF {} of '{}'",
                pos, self.file_len, self.file_name
            )));
        }
        let end = self.large_read_pos + self.large_read_len as u64;
        if pos >= self.large_read_pos && pos <= end {
            self.buffer_offset = (pos - self.large_read_pos) as usize;
        } else {
            self.large_read_pos = pos;
            self.large_read_len = 0;
            self.buffer_offset = 0;
        }
        Ok(())
    }

    /// Up to `len` bytes at the current position. Shorter only at EOF.
    pub fn peek(&mut self, len: usize) -> Result<&[u8]> {
        if len > self.max_buffer_len {
            return Err(Error::contract(format!(
                "peek of {} bytes exceeds the buffer length {}",
                len, self.max_buffer_len
            )));
        }
        if self.buffer_offset + len > self.large_read_len {
            self.refill()?;
        }
        let avail = (self.large_read_len - self.buffer_offset).min(len);
        Ok(&self.memory[self.buffer_offset..self.buffer_offset + avail])
    }

    pub fn advance(&mut self, len: usize) -> Result<()> {
        if self.buffer_offset + len > self.large_read_len {
            return Err(Error::contract(format!(
                "advance of {} bytes past the {} buffered bytes",
                len,
                self.large_read_len - self.buffer_offset
            )));
        }
        self.buffer_offset += len;
        Ok(())
    }

    fn refill(&mut self) -> Result<()> {
        // keep unconsumed bytes, move them to the front
        let keep = self.large_read_len - self.buffer_offset;
        self.memory.copy_within(self.buffer_offset..self.large_read_len, 0);
        self.large_read_pos += self.buffer_offset as u64;
        self.large_read_len = keep;
        self.buffer_offset = 0;

        let to_eof = self.file_len.saturating_sub(self.large_read_pos);
        let want = (self.memory.len() as u64).min(to_eof) as usize;
        if want <= self.large_read_len {
            return Ok(());
        }
        let offset = self.large_read_pos + self.large_read_len as u64;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::contract("buffered read has no open file"))?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut self.memory[self.large_read_len..want]))
            .map_err(|e| {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    Error::unexpected_eof(
                        format!("file is shorter than its logical EOF {}", self.file_len),
                        BlockContext::new("", &self.file_name, offset),
                    )
                } else {
                    Error::io(format!("could not read '{}' at offset {}", self.file_name, offset), e)
                }
            })?;
        let n = want - self.large_read_len;
        self.stats.physical_reads += 1;
        self.stats.bytes_read += n as u64;
        trace!(file = %self.file_name, offset, len = n, "physical read");
        self.large_read_len = want;
        Ok(())
    }
}
