//! Append-only storage: the block format, buffered appends and reads, the
//! per-file storage write/read sessions, and the column-oriented multiplexer
//! built on top of them.

pub mod aocs;
pub mod buffered_append;
pub mod buffered_read;
pub mod checksum;
pub mod codec;
pub mod config;
pub mod error;
pub mod format;
pub mod reader;
pub mod wal;
pub mod writer;

pub use codec::{Codec, CodecProvider, CompressionKind};
pub use config::StorageAttributes;
pub use error::{BlockContext, Error, ErrorClass, Result};
pub use format::{BlockHeader, BlockInfo, FormatVersion, HeaderKind};
pub use reader::{ReadBlock, StorageRead};
pub use wal::{AoWal, RecordingWal, RelFileNode};
pub use writer::{StorageWrite, WriteStats};
