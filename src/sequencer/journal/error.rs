//! Error types for the durable log subsystem.
//!
//! [`JournalError`] covers every failure mode of the append-only logs and
//! their reader checkpoints: I/O, corruption, codec failures and capacity.

use std::fmt;
use std::path::PathBuf;

/// Errors that can occur while appending to, reading from or checkpointing
/// a durable log.
#[derive(Debug)]
#[non_exhaustive]
pub enum JournalError {
    /// An I/O error occurred while reading or writing log files.
    Io {
        /// The underlying I/O error message.
        message: String,
        /// The file path involved, if known.
        path: Option<PathBuf>,
    },

    /// A log record failed CRC32 integrity verification.
    CorruptEntry {
        /// The log position stored in the corrupt record.
        position: u64,
        /// The CRC32 stored alongside the record.
        expected_crc: u32,
        /// The CRC32 recomputed from the record bytes.
        actual_crc: u32,
    },

    /// A record payload could not be decoded with the log's codec.
    Decode {
        /// The position of the record that failed to decode.
        position: u64,
        /// The underlying codec error message.
        message: String,
    },

    /// A payload could not be encoded with the log's codec.
    Encode {
        /// The underlying codec error message.
        message: String,
    },

    /// A single record does not fit into an empty segment.
    EntryTooLarge {
        /// The size of the encoded record in bytes.
        entry_bytes: usize,
        /// The segment size in bytes.
        segment_size: usize,
    },

    /// An internal lock was poisoned by a panicking thread.
    MutexPoisoned,

    /// The requested position has not been appended yet.
    PositionNotFound {
        /// The position that was requested.
        position: u64,
    },

    /// A record header is truncated or malformed.
    InvalidEntryHeader {
        /// Byte offset within the segment.
        offset: usize,
        /// Description of the problem.
        message: String,
    },

    /// Positions found on disk are not dense and increasing.
    OutOfOrder {
        /// The position the log expected next.
        expected: u64,
        /// The position actually stored.
        found: u64,
    },

    /// A named reader checkpoint could not be read or written.
    Checkpoint {
        /// Checkpoint name.
        name: String,
        /// Description of the problem.
        message: String,
    },
}

impl JournalError {
    /// Wraps an I/O error together with the path it concerns.
    #[cold]
    pub(crate) fn io_at(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        JournalError::Io {
            message: err.to_string(),
            path: Some(path.into()),
        }
    }
}

impl fmt::Display for JournalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JournalError::Io { message, path } => {
                if let Some(p) = path {
                    write!(f, "log I/O error at {}: {message}", p.display())
                } else {
                    write!(f, "log I/O error: {message}")
                }
            }
            JournalError::CorruptEntry {
                position,
                expected_crc,
                actual_crc,
            } => {
                write!(
                    f,
                    "corrupt log record at position {position}: \
                     expected CRC {expected_crc:#010x}, got {actual_crc:#010x}"
                )
            }
            JournalError::Decode { position, message } => {
                write!(f, "failed to decode log record {position}: {message}")
            }
            JournalError::Encode { message } => {
                write!(f, "failed to encode log record: {message}")
            }
            JournalError::EntryTooLarge {
                entry_bytes,
                segment_size,
            } => {
                write!(
                    f,
                    "log record too large: {entry_bytes} bytes exceeds \
                     segment size {segment_size} bytes"
                )
            }
            JournalError::MutexPoisoned => write!(f, "log internal mutex poisoned"),
            JournalError::PositionNotFound { position } => {
                write!(f, "position {position} not found in log")
            }
            JournalError::InvalidEntryHeader { offset, message } => {
                write!(f, "invalid log record header at offset {offset}: {message}")
            }
            JournalError::OutOfOrder { expected, found } => {
                write!(
                    f,
                    "log positions out of order: expected {expected}, found {found}"
                )
            }
            JournalError::Checkpoint { name, message } => {
                write!(f, "checkpoint '{name}' error: {message}")
            }
        }
    }
}

impl std::error::Error for JournalError {}

impl From<std::io::Error> for JournalError {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        JournalError::Io {
            message: err.to_string(),
            path: None,
        }
    }
}
