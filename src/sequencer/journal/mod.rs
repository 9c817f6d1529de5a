//! Durable logs: append-only, memory-mapped, CRC-framed record streams.
//!
//! # Types
//!
//! - [`DurableLog`] — trait shared by the input, correlation and output logs
//! - [`FileLog`] — memory-mapped segment implementation
//! - [`LogTailer`] — reader-owned cursor with optional named checkpoint
//! - [`LogRecord`] — a record read back with its on-disk metadata
//! - [`LogCodec`] — payload encoding (JSON, or bincode behind a feature)
//! - [`JournalError`] — error type for every log operation

pub mod checkpoint;
pub mod codec;
pub mod error;
pub mod file_log;
pub mod log;
pub mod tailer;

pub use checkpoint::CheckpointStore;
pub use codec::LogCodec;
pub use error::JournalError;
pub use file_log::{DEFAULT_SEGMENT_SIZE, FileLog};
pub use log::{
    DurableLog, ENTRY_CRC_SIZE, ENTRY_HEADER_SIZE, ENTRY_OVERHEAD, LogPayload, LogReadIter,
    LogRecord,
};
pub use tailer::LogTailer;
