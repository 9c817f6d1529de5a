//! Single-writer exchange sequencer.
//!
//! Commands enter through the [`Gateway`], are appended to the input log,
//! applied in order by the [`Sequencer`] and answered on the output log,
//! one result per input position. The [`ResponseProcessor`] tails the
//! output log and commits each result exactly once into a [`ResultStore`].
//!
//! # Modules
//!
//! - [`journal`] — memory-mapped durable logs, tailers and checkpoints
//! - [`types`] — commands, results and state dumps
//! - [`market`] — per-market order book, matching and fees
//! - [`state`] — the deterministic state machine
//! - [`snapshot`] — checksummed state snapshots
//! - [`engine`] — the sequencer thread and crash recovery
//! - [`gateway`] — synchronous and Tokio request/response bridges
//! - [`processor`] — the response processor and its retry policy
//! - [`store`] — in-memory and file-backed result ledgers
//! - [`tree`] / [`pool`] — the level index and object pool

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod journal;
pub mod market;
pub mod pool;
pub mod processor;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod tree;
pub mod types;

pub use config::{RetryPolicy, SequencerConfig};
pub use engine::{SEQUENCER_CHECKPOINT, Sequencer, SequencerLogs, SequencerPhase};
pub use error::{
    ConfigError, EngineError, GatewayError, ProcessorError, SequencerError, SnapshotError,
    StoreError,
};
pub use gateway::{Gateway, GatewayResponse, GatewayTokio};
pub use journal::{
    CheckpointStore, DurableLog, FileLog, JournalError, LogCodec, LogRecord, LogTailer,
};
pub use market::{BatchOutcome, Level, LevelOrder, Market};
pub use pool::ObjectPool;
pub use processor::{AbnormalStopHandler, ResponseProcessor};
pub use snapshot::{DEFAULT_SNAPSHOTS_RETAINED, SnapshotStore, StateSnapshotPackage};
pub use state::SequencerState;
pub use store::{
    CURSOR_KEY, FileLedger, LedgerChange, LedgerLimits, LedgerListener, LedgerOrder, LedgerState,
    MemoryLedger, ResultStore,
};
pub use tree::{BalancedIndexTree, NodeId};
pub use types::*;
