//! Error types for the sequencer, gateway, response processor and stores.

use super::journal::JournalError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Business disposition of a refused command, carried inside a
/// [`SequencerResponse`](super::types::SequencerResponse).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum SequencerError {
    /// The command referenced a market that does not exist.
    #[error("unknown market")]
    UnknownMarket,
    /// A market with the same id but different parameters exists.
    #[error("market already exists")]
    MarketExists,
    /// A fee rate outside `0..=1_000_000`.
    #[error("invalid fee rate")]
    InvalidFeeRate,
    /// Empty or malformed withdrawal fee list.
    #[error("invalid withdrawal fee")]
    InvalidWithdrawalFee,
    /// Empty or malformed market minimum fee list.
    #[error("invalid market min fee")]
    InvalidMarketMinFee,
    /// The command is not accepted in the current mode.
    #[error("unknown request")]
    UnknownRequest,
    /// The wallet's balance does not cover the batch.
    #[error("exceeds limit")]
    ExceedsLimit,
    /// The command could not be applied.
    #[error("processing failed: {message}")]
    ProcessingFailed {
        /// What went wrong.
        message: String,
    },
}

/// Errors raised by the sequencer loop itself.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A log operation failed.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    /// Snapshot read or write failed.
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    /// A replayed command produced a different result than the logged one.
    #[error("replay mismatch at position {position}")]
    ReplayMismatch {
        /// Input-log position of the diverging command.
        position: u64,
    },
    /// The loop is already running.
    #[error("sequencer already running")]
    AlreadyRunning,
    /// The loop thread could not be spawned.
    #[error("failed to spawn sequencer thread: {0}")]
    Spawn(String),
    /// The loop did not stop within the requested time.
    #[error("sequencer did not stop within {millis} ms")]
    StopTimeout {
        /// The wait that elapsed.
        millis: u64,
    },
}

/// Errors returned by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// No result appeared within the configured timeout.
    #[error("timed out waiting for result of {guid} at position {position}")]
    Timeout {
        /// Command guid.
        guid: String,
        /// Input-log position of the command.
        position: u64,
    },
    /// A log operation failed.
    #[error("journal error: {0}")]
    Journal(String),
    /// The async blocking task failed.
    #[error("gateway task failed: {0}")]
    Task(String),
}

impl From<JournalError> for GatewayError {
    fn from(err: JournalError) -> Self {
        GatewayError::Journal(err.to_string())
    }
}

/// Errors raised by the response processor.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessorError {
    /// A log operation failed.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    /// The store rejected an operation.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// The result references an input position with no command.
    #[error("no command at input position {position}")]
    MissingCommand {
        /// Input-log position.
        position: u64,
    },
    /// Every retry for one result failed; the processor halted.
    #[error("retries exhausted at output index {read_index} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Output-log index of the failing result.
        read_index: u64,
        /// Attempts made.
        attempts: u32,
        /// Error message of the final attempt.
        last_error: String,
    },
    /// The processor is already running.
    #[error("response processor already running")]
    AlreadyRunning,
    /// The processor thread could not be spawned.
    #[error("failed to spawn response processor thread: {0}")]
    Spawn(String),
    /// The processor did not stop within the requested time.
    #[error("response processor did not stop within {millis} ms")]
    StopTimeout {
        /// The wait that elapsed.
        millis: u64,
    },
}

/// Errors raised by result stores.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Filesystem failure.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The persisted ledger could not be encoded or decoded.
    #[error("store serialization error: {0}")]
    Serialization(String),
    /// The persisted ledger checksum does not match its contents.
    #[error("ledger checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: String,
        /// Recomputed checksum.
        actual: String,
    },
    /// A shared lock was poisoned.
    #[error("store lock poisoned")]
    LockPoisoned,
    /// The effects could not be applied.
    #[error("apply failed: {0}")]
    Apply(String),
}

/// Errors raised while reading or writing state snapshots.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SnapshotError {
    /// Filesystem failure.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Encoding or decoding failed.
    #[error("snapshot serialization error: {0}")]
    Serialization(String),
    /// Unsupported format version.
    #[error("unsupported snapshot version {found} (expected {expected})")]
    Version {
        /// Version in the file.
        found: u32,
        /// Version this build writes.
        expected: u32,
    },
    /// The checksum does not match the contents.
    #[error("snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: String,
        /// Recomputed checksum.
        actual: String,
    },
    /// The snapshot file name does not match its recorded position.
    #[error("snapshot position mismatch: file {file}, contents {contents}")]
    PositionMismatch {
        /// Position encoded in the file name.
        file: u64,
        /// Position recorded inside the snapshot.
        contents: u64,
    },
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration file is not valid JSON for [`SequencerConfig`](super::config::SequencerConfig).
    #[error("config parse error: {0}")]
    Parse(String),
}
