//! Append-only durable log trait.
//!
//! The [`DurableLog`] trait is the contract shared by the input,
//! correlation and output logs. A log assigns every appended payload its
//! position: positions start at 0, are dense and strictly increasing, and
//! never change once assigned. A record is considered committed only after
//! [`append`](DurableLog::append) returns `Ok`.
//!
//! See [`FileLog`](super::FileLog) for the memory-mapped implementation.

use super::error::JournalError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Size of the fixed-size record header in bytes.
///
/// Layout: `[4 bytes entry_length][8 bytes position][8 bytes timestamp_ns]`
pub const ENTRY_HEADER_SIZE: usize = 4 + 8 + 8;

/// Size of the CRC32 trailer appended to each record in bytes.
pub const ENTRY_CRC_SIZE: usize = 4;

/// Total overhead per record (header + CRC trailer) in bytes.
pub const ENTRY_OVERHEAD: usize = ENTRY_HEADER_SIZE + ENTRY_CRC_SIZE;

/// Bound satisfied by every type that can be stored in a durable log.
pub trait LogPayload: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> LogPayload for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// A single record as read back from a log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord<R> {
    /// The position assigned at append time.
    pub position: u64,
    /// Wall-clock append time in nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    /// The decoded payload.
    pub payload: R,
    /// The CRC32 checksum stored alongside the record.
    pub stored_crc: u32,
}

/// Iterator returned by [`DurableLog::read_from`].
///
/// Each item is either a decoded [`LogRecord`] or a [`JournalError`]
/// (corrupt CRC, codec failure).
pub type LogReadIter<'a, R> = Box<dyn Iterator<Item = Result<LogRecord<R>, JournalError>> + 'a>;

/// An append-only, crash-durable sequence of records with independent
/// reader checkpoints.
///
/// # Thread Safety
///
/// Appends are serialised internally, so a log may be shared behind an
/// `Arc` by any number of writers and tailing readers. Each reader owns its
/// own cursor (see [`LogTailer`](super::LogTailer)).
pub trait DurableLog<R: LogPayload>: Send + Sync {
    /// Appends `payload` and returns the position assigned to it.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if encoding, I/O or flushing fails.
    fn append(&self, payload: &R) -> Result<u64, JournalError>;

    /// Reads the record at `position`, or `None` if it has not been
    /// appended yet.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the record is corrupt or cannot be
    /// decoded.
    fn read(&self, position: u64) -> Result<Option<LogRecord<R>>, JournalError>;

    /// Iterates over committed records starting at `position` (inclusive).
    ///
    /// The iterator stops at the committed end observed when it reaches it.
    fn read_from(&self, position: u64) -> LogReadIter<'_, R>;

    /// The position the next append will receive; equals the record count.
    #[must_use]
    fn next_position(&self) -> u64;

    /// Position of the last committed record, or `None` if the log is empty.
    #[must_use]
    fn last_position(&self) -> Option<u64> {
        self.next_position().checked_sub(1)
    }

    /// Verifies the CRC32 of every stored record.
    ///
    /// # Errors
    ///
    /// Returns the first [`JournalError::CorruptEntry`] encountered.
    fn verify_integrity(&self) -> Result<(), JournalError>;

    /// Blocks until a record exists at `position` or `timeout` elapses.
    ///
    /// Returns `true` if the position is readable.
    fn wait_for(&self, position: u64, timeout: Duration) -> bool;

    /// Loads the position stored under the named reader checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Checkpoint`] if the checkpoint is unreadable.
    fn load_checkpoint(&self, name: &str) -> Result<Option<u64>, JournalError>;

    /// Atomically stores `position` under the named reader checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the checkpoint file cannot be written.
    fn store_checkpoint(&self, name: &str, position: u64) -> Result<(), JournalError>;
}
