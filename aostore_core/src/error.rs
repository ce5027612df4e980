use std::fmt;
use std::io;

use thiserror::Error;

use crate::format::HeaderCheckError;

/// Broad failure classes. Every [`Error`] belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Programming error by the caller; never retried.
    Contract,
    /// Bytes on disk do not describe a valid block.
    Corruption,
    /// A compression backend could not get the resources it needed.
    ResourceExhaustion,
    /// Physical read/write/fsync or WAL failure.
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Header,
    Content,
}

impl fmt::Display for ChecksumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumKind::Header => write!(f, "header"),
            ChecksumKind::Content => write!(f, "content"),
        }
    }
}

/// Where a block-level failure happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockContext {
    pub relation: String,
    pub segment_file: String,
    pub header_offset: u64,
    /// Rendered block header, when it could be decoded.
    pub header: Option<String>,
}

impl BlockContext {
    pub fn new(relation: &str, segment_file: &str, header_offset: u64) -> Self {
        Self {
            relation: relation.to_string(),
            segment_file: segment_file.to_string(),
            header_offset,
            header: None,
        }
    }

    pub fn with_header(mut self, header: impl fmt::Display) -> Self {
        self.header = Some(header.to_string());
        self
    }
}

impl fmt::Display for BlockContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "relation '{}', segment file '{}', header offset in file {}",
            self.relation, self.segment_file, self.header_offset
        )?;
        if let Some(header) = &self.header {
            write!(f, "; {}", header)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("contract violation: {0}")]
    Contract(String),

    #[error("bad append-only storage block header: {source} ({context})")]
    BadHeader {
        #[source]
        source: HeaderCheckError,
        context: BlockContext,
    },

    #[error("{kind} checksum mismatch: stored {stored:#010x}, computed {computed:#010x} ({context})")]
    Checksum {
        kind: ChecksumKind,
        stored: u32,
        computed: u32,
        context: BlockContext,
    },

    #[error("data corruption: {message} ({context})")]
    Corruption {
        message: String,
        context: BlockContext,
    },

    #[error("unexpected end of file: {message} ({context})")]
    UnexpectedEof {
        message: String,
        context: BlockContext,
    },

    #[error("{codec} compression backend failed: {message}")]
    Compression { codec: &'static str, message: String },

    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("write-ahead log append failed: {0}")]
    Wal(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Contract(_) | Error::Config(_) => ErrorClass::Contract,
            Error::BadHeader { .. }
            | Error::Checksum { .. }
            | Error::Corruption { .. }
            | Error::UnexpectedEof { .. } => ErrorClass::Corruption,
            Error::Compression { .. } => ErrorClass::ResourceExhaustion,
            Error::Io { .. } | Error::Wal(_) => ErrorClass::Io,
        }
    }

    pub fn contract(message: impl ToString) -> Self {
        Error::Contract(message.to_string())
    }

    pub fn config(message: impl ToString) -> Self {
        Error::Config(message.to_string())
    }

    pub fn corruption(message: impl ToString, context: BlockContext) -> Self {
        Error::Corruption {
            message: message.to_string(),
            context,
        }
    }

    pub fn unexpected_eof(message: impl ToString, context: BlockContext) -> Self {
        Error::UnexpectedEof {
            message: message.to_string(),
            context,
        }
    }

    pub fn compression(codec: &'static str, message: impl ToString) -> Self {
        Error::Compression {
            codec,
            message: message.to_string(),
        }
    }

    pub fn io(context: impl ToString, source: io::Error) -> Self {
        Error::Io {
            context: context.to_string(),
            source,
        }
    }

    /// Checksum mismatches get their own variant; every other header check
    /// failure is reported as a malformed header.
    pub fn from_header_check(source: HeaderCheckError, context: BlockContext) -> Self {
        match source {
            HeaderCheckError::HeaderChecksum { stored, computed } => Error::Checksum {
                kind: ChecksumKind::Header,
                stored,
                computed,
                context,
            },
            HeaderCheckError::ContentChecksum { stored, computed } => Error::Checksum {
                kind: ChecksumKind::Content,
                stored,
                computed,
                context,
            },
            source => Error::BadHeader { source, context },
        }
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io {
            context: "segment file".to_string(),
            source,
        }
    }
}
