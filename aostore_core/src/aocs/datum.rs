//! Datum blocks: the content of one column block.
//!
//! ```text
//! [type tag: u8][encoding: u8][flags: u8][reserved: u8][item count: u32]
//! plain, fixed width:  [null bitmap?][value × count]
//! plain, varlen:       [null bitmap?][end offset: u32 × (count + 1)][data]
//! run-length:          [run count: u32][run length: u32 × runs][null bitmap?][value × runs]
//! ```
//!
//! Null bitmaps have one bit per item (per run when run-length encoded), set
//! for null, and are present only when the flags say so. Null slots still
//! occupy a zeroed fixed-width value or an empty varlen range, so item `i`
//! is found without decoding the items before it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::format::MAX_DENSE_ROW_COUNT;

pub const DATUM_BLOCK_HEADER_SIZE: usize = 8;
const FLAG_HAS_NULLS: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Bool,
    Int32,
    Int64,
    Float64,
    Text,
    Bytes,
}

impl ColumnType {
    pub fn tag(self) -> u8 {
        match self {
            ColumnType::Bool => 1,
            ColumnType::Int32 => 2,
            ColumnType::Int64 => 3,
            ColumnType::Float64 => 4,
            ColumnType::Text => 5,
            ColumnType::Bytes => 6,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ColumnType::Bool),
            2 => Some(ColumnType::Int32),
            3 => Some(ColumnType::Int64),
            4 => Some(ColumnType::Float64),
            5 => Some(ColumnType::Text),
            6 => Some(ColumnType::Bytes),
            _ => None,
        }
    }

    /// `None` for variable-length types.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            ColumnType::Bool => Some(1),
            ColumnType::Int32 => Some(4),
            ColumnType::Int64 | ColumnType::Float64 => Some(8),
            ColumnType::Text | ColumnType::Bytes => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnEncoding {
    #[default]
    Plain,
    RunLength,
}

impl ColumnEncoding {
    fn tag(self) -> u8 {
        match self {
            ColumnEncoding::Plain => 0,
            ColumnEncoding::RunLength => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Bool(_) => ColumnType::Bool,
            Value::Int32(_) => ColumnType::Int32,
            Value::Int64(_) => ColumnType::Int64,
            Value::Float64(_) => ColumnType::Float64,
            Value::Text(_) => ColumnType::Text,
            Value::Bytes(_) => ColumnType::Bytes,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Fixed-width little-endian form; empty for varlen values.
    fn fixed_bytes(&self) -> ([u8; 8], usize) {
        let mut b = [0u8; 8];
        let n = match self {
            Value::Bool(v) => {
                b[0] = *v as u8;
                1
            }
            Value::Int32(v) => {
                b[..4].copy_from_slice(&v.to_le_bytes());
                4
            }
            Value::Int64(v) => {
                b.copy_from_slice(&v.to_le_bytes());
                8
            }
            Value::Float64(v) => {
                b.copy_from_slice(&v.to_le_bytes());
                8
            }
            Value::Text(_) | Value::Bytes(_) => 0,
        };
        (b, n)
    }

    fn varlen_bytes(&self) -> &[u8] {
        match self {
            Value::Text(s) => s.as_bytes(),
            Value::Bytes(b) => b,
            _ => &[],
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Float64(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{:?}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// One row: a nullable value per column.
pub type Row = Vec<Option<Value>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed datum block: {0}")]
pub struct DatumBlockError(pub String);

fn bitmap_len(units: usize, any_null: bool) -> usize {
    if any_null {
        (units + 7) / 8
    } else {
        0
    }
}

fn bit_is_set(bitmap: &[u8], i: usize) -> bool {
    bitmap[i / 8] & (1 << (i % 8)) != 0
}

// ── Builder ────────────────────────────────────────────────────────────────

/// Accumulates values of one column until the block is full.
pub struct DatumBlockBuilder {
    column_type: ColumnType,
    encoding: ColumnEncoding,
    capacity: usize,
    count: usize,
    any_null: bool,
    /// Per item (plain) or per run (run-length).
    nulls: Vec<bool>,
    /// Fixed-width values, or varlen data.
    values: Vec<u8>,
    /// Varlen end offsets, one per item.
    offsets: Vec<u32>,
    run_lengths: Vec<u32>,
}

impl DatumBlockBuilder {
    pub fn new(column_type: ColumnType, encoding: ColumnEncoding, capacity: usize) -> Result<Self> {
        if encoding == ColumnEncoding::RunLength && column_type.fixed_width().is_none() {
            return Err(Error::config(format!(
                "run-length encoding needs a fixed-width type, not {:?}",
                column_type
            )));
        }
        Ok(Self {
            column_type,
            encoding,
            capacity,
            count: 0,
            any_null: false,
            nulls: Vec::new(),
            values: Vec::new(),
            offsets: Vec::new(),
            run_lengths: Vec::new(),
        })
    }

    pub fn row_count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn encoding(&self) -> ColumnEncoding {
        self.encoding
    }

    pub fn column_type(&self) -> ColumnType {
        self.column_type
    }

    pub fn reset(&mut self) {
        self.count = 0;
        self.any_null = false;
        self.nulls.clear();
        self.values.clear();
        self.offsets.clear();
        self.run_lengths.clear();
    }

    fn layout_len(&self, count: usize, units: usize, data_len: usize, any_null: bool) -> usize {
        let bitmap = bitmap_len(units, any_null);
        match (self.encoding, self.column_type.fixed_width()) {
            (ColumnEncoding::RunLength, Some(w)) => DATUM_BLOCK_HEADER_SIZE + 4 + units * 4 + bitmap + units * w,
            (_, Some(w)) => DATUM_BLOCK_HEADER_SIZE + bitmap + count * w,
            (_, None) => DATUM_BLOCK_HEADER_SIZE + bitmap + (count + 1) * 4 + data_len,
        }
    }

    pub fn encoded_len(&self) -> usize {
        let units = match self.encoding {
            ColumnEncoding::RunLength => self.run_lengths.len(),
            ColumnEncoding::Plain => self.count,
        };
        self.layout_len(self.count, units, self.values.len(), self.any_null)
    }

    /// Add one value. Returns `false`, leaving the block unchanged, when the
    /// value does not fit in the remaining capacity.
    pub fn try_push(&mut self, value: Option<&Value>) -> Result<bool> {
        if let Some(v) = value {
            if v.column_type() != self.column_type {
                return Err(Error::contract(format!(
                    "{:?} value pushed into a {:?} column",
                    v.column_type(),
                    self.column_type
                )));
            }
        }
        if self.count >= MAX_DENSE_ROW_COUNT as usize {
            return Ok(false);
        }
        let is_null = value.is_none();
        let any_null = self.any_null || is_null;
        let (fixed, width) = value.map(Value::fixed_bytes).unwrap_or(([0u8; 8], 0));
        let width = self.column_type.fixed_width().unwrap_or(width);

        match self.encoding {
            ColumnEncoding::RunLength => {
                let extends = match (self.nulls.last(), self.run_lengths.last()) {
                    (Some(&last_null), Some(&len)) => {
                        let last = &self.values[self.values.len() - width..];
                        last_null == is_null && last == &fixed[..width] && len < u32::MAX
                    }
                    _ => false,
                };
                if extends {
                    if let Some(len) = self.run_lengths.last_mut() {
                        *len += 1;
                    }
                } else {
                    let runs = self.run_lengths.len() + 1;
                    if self.layout_len(self.count + 1, runs, 0, any_null) > self.capacity {
                        return Ok(false);
                    }
                    self.run_lengths.push(1);
                    self.nulls.push(is_null);
                    self.values.extend_from_slice(&fixed[..width]);
                }
            }
            ColumnEncoding::Plain => {
                let data = value.map(Value::varlen_bytes).unwrap_or(&[]);
                let data_len = self.values.len() + data.len();
                if self.layout_len(self.count + 1, self.count + 1, data_len, any_null) > self.capacity {
                    return Ok(false);
                }
                self.nulls.push(is_null);
                if self.column_type.fixed_width().is_some() {
                    self.values.extend_from_slice(&fixed[..width]);
                } else {
                    if data_len > u32::MAX as usize {
                        return Ok(false);
                    }
                    self.values.extend_from_slice(data);
                    self.offsets.push(self.values.len() as u32);
                }
            }
        }
        self.count += 1;
        self.any_null = any_null;
        Ok(true)
    }

    /// Serialize into `out`, returning the number of bytes written.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        if out.len() < len {
            return Err(Error::contract(format!(
                "datum block of {} bytes does not fit in {} bytes",
                len,
                out.len()
            )));
        }
        out[0] = self.column_type.tag();
        out[1] = self.encoding.tag();
        out[2] = if self.any_null { FLAG_HAS_NULLS } else { 0 };
        out[3] = 0;
        out[4..8].copy_from_slice(&(self.count as u32).to_le_bytes());
        let mut pos = DATUM_BLOCK_HEADER_SIZE;

        if self.encoding == ColumnEncoding::RunLength {
            out[pos..pos + 4].copy_from_slice(&(self.run_lengths.len() as u32).to_le_bytes());
            pos += 4;
            for run in &self.run_lengths {
                out[pos..pos + 4].copy_from_slice(&run.to_le_bytes());
                pos += 4;
            }
        }
        if self.any_null {
            let bitmap = &mut out[pos..pos + bitmap_len(self.nulls.len(), true)];
            bitmap.fill(0);
            for (i, _) in self.nulls.iter().enumerate().filter(|(_, &n)| n) {
                bitmap[i / 8] |= 1 << (i % 8);
            }
            pos += bitmap.len();
        }
        if self.encoding == ColumnEncoding::Plain && self.column_type.fixed_width().is_none() {
            out[pos..pos + 4].copy_from_slice(&0u32.to_le_bytes());
            pos += 4;
            for end in &self.offsets {
                out[pos..pos + 4].copy_from_slice(&end.to_le_bytes());
                pos += 4;
            }
        }
        out[pos..pos + self.values.len()].copy_from_slice(&self.values);
        pos += self.values.len();
        debug_assert_eq!(pos, len);
        Ok(pos)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.encoded_len()];
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// A one-item plain block of any size, used for values too large for a
    /// regular block.
    pub fn single(column_type: ColumnType, value: Option<&Value>) -> Result<Vec<u8>> {
        let mut builder = Self::new(column_type, ColumnEncoding::Plain, usize::MAX)?;
        builder.try_push(value)?;
        builder.to_vec()
    }
}

// ── Reader ─────────────────────────────────────────────────────────────────

/// A parsed datum block with positional access.
#[derive(Debug, Clone)]
pub struct DatumBlock {
    column_type: ColumnType,
    count: usize,
    bytes: Vec<u8>,
    bitmap_at: Option<usize>,
    values_at: usize,
    /// Varlen offset array position.
    offsets_at: usize,
    /// Cumulative run ends, run-length blocks only.
    run_ends: Vec<u64>,
}

fn malformed(msg: impl Into<String>) -> DatumBlockError {
    DatumBlockError(msg.into())
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

impl DatumBlock {
    pub fn parse(bytes: Vec<u8>, expected: ColumnType) -> std::result::Result<Self, DatumBlockError> {
        if bytes.len() < DATUM_BLOCK_HEADER_SIZE {
            return Err(malformed(format!("{} bytes is shorter than the header", bytes.len())));
        }
        let column_type = ColumnType::from_tag(bytes[0])
            .ok_or_else(|| malformed(format!("unknown type tag {}", bytes[0])))?;
        if column_type != expected {
            return Err(malformed(format!(
                "block holds {:?} values, column is {:?}",
                column_type, expected
            )));
        }
        let has_nulls = bytes[2] & FLAG_HAS_NULLS != 0;
        let count = le_u32(&bytes, 4) as usize;
        let mut pos = DATUM_BLOCK_HEADER_SIZE;
        let mut run_ends = Vec::new();

        let need = |pos: usize, n: usize| -> std::result::Result<(), DatumBlockError> {
            if pos.checked_add(n).map_or(true, |end| end > bytes.len()) {
                return Err(malformed(format!(
                    "needs {} bytes at offset {} of a {}-byte block",
                    n,
                    pos,
                    bytes.len()
                )));
            }
            Ok(())
        };

        let (bitmap_at, values_at, offsets_at) = match bytes[1] {
            1 => {
                let width = column_type
                    .fixed_width()
                    .ok_or_else(|| malformed("run-length encoded varlen column"))?;
                need(pos, 4)?;
                let runs = le_u32(&bytes, pos) as usize;
                pos += 4;
                need(pos, runs.saturating_mul(4))?;
                let mut end = 0u64;
                for r in 0..runs {
                    end += le_u32(&bytes, pos + r * 4) as u64;
                    run_ends.push(end);
                }
                if end != count as u64 {
                    return Err(malformed(format!("runs cover {} items, header says {}", end, count)));
                }
                pos += runs * 4;
                let bitmap_at = has_nulls.then_some(pos);
                pos += bitmap_len(runs, has_nulls);
                need(pos, runs.saturating_mul(width))?;
                (bitmap_at, pos, 0)
            }
            0 => {
                let bitmap_at = has_nulls.then_some(pos);
                pos += bitmap_len(count, has_nulls);
                match column_type.fixed_width() {
                    Some(width) => {
                        need(pos, count.saturating_mul(width))?;
                        (bitmap_at, pos, 0)
                    }
                    None => {
                        let offsets_at = pos;
                        need(pos, (count + 1).saturating_mul(4))?;
                        let values_at = pos + (count + 1) * 4;
                        let mut prev = 0u32;
                        for i in 0..=count {
                            let off = le_u32(&bytes, offsets_at + i * 4);
                            if off < prev {
                                return Err(malformed("varlen offsets go backwards"));
                            }
                            prev = off;
                        }
                        need(values_at, prev as usize)?;
                        (bitmap_at, values_at, offsets_at)
                    }
                }
            }
            other => return Err(malformed(format!("unknown encoding {}", other))),
        };

        Ok(Self {
            column_type,
            count,
            bytes,
            bitmap_at,
            values_at,
            offsets_at,
            run_ends,
        })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_run_length(&self) -> bool {
        !self.run_ends.is_empty()
    }

    /// Value of item `i`; `None` for null.
    pub fn get(&self, i: usize) -> std::result::Result<Option<Value>, DatumBlockError> {
        if i >= self.count {
            return Err(malformed(format!("item {} of a {}-item block", i, self.count)));
        }
        // run-length blocks address values and nulls by run
        let slot = if self.is_run_length() {
            self.run_ends.partition_point(|&end| end <= i as u64)
        } else {
            i
        };
        if let Some(at) = self.bitmap_at {
            if bit_is_set(&self.bytes[at..], slot) {
                return Ok(None);
            }
        }
        let value = match self.column_type.fixed_width() {
            Some(w) => {
                let at = self.values_at + slot * w;
                let raw = &self.bytes[at..at + w];
                let mut b = [0u8; 8];
                b[..w].copy_from_slice(raw);
                match self.column_type {
                    ColumnType::Bool => Value::Bool(raw[0] != 0),
                    ColumnType::Int32 => Value::Int32(i32::from_le_bytes([b[0], b[1], b[2], b[3]])),
                    ColumnType::Int64 => Value::Int64(i64::from_le_bytes(b)),
                    _ => Value::Float64(f64::from_le_bytes(b)),
                }
            }
            None => {
                let start = le_u32(&self.bytes, self.offsets_at + i * 4) as usize;
                let end = le_u32(&self.bytes, self.offsets_at + (i + 1) * 4) as usize;
                let data = self.bytes[self.values_at + start..self.values_at + end].to_vec();
                match self.column_type {
                    ColumnType::Text => Value::Text(
                        String::from_utf8(data).map_err(|_| malformed(format!("item {} is not UTF-8", i)))?,
                    ),
                    _ => Value::Bytes(data),
                }
            }
        };
        Ok(Some(value))
    }
}
