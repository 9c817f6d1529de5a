//! # Exchange Sequencer
//!
//! A single-writer command sequencer for an exchange core. Every state change
//! (markets, order batches, balance batches, fee settings) is appended to a
//! durable input log, applied in log order by one thread, and answered with
//! exactly one result on a durable output log at the same position. Because
//! the state machine is deterministic, replaying the input log rebuilds the
//! state bit for bit.
//!
//! ## Key Features
//!
//! - **Durable Logs**: Append-only, memory-mapped, CRC-framed segment files
//!   with random access by position, tailers and named checkpoints.
//!
//! - **Deterministic State Machine**: Balances, per-market order books with
//!   price/time matching, maker/taker fees, withdrawal fees and per-market
//!   minimum fees.
//!
//! - **Crash Recovery**: Checksummed state snapshots plus replay of the input
//!   tail. Positions that already have a result are re-applied without being
//!   re-published, and can optionally be validated against the logged result.
//!
//! - **Synchronous Gateway**: Callers on any thread submit a command and block
//!   until the matching result appears, with a timeout. A Tokio façade runs
//!   the same call on the blocking pool.
//!
//! - **Response Processor**: Tails the output log, pairs each result with its
//!   command and commits it exactly once into a ledger together with the
//!   `LastProcessedOutputIndex` cursor. Failed attempts are retried with a
//!   fixed delay; exhausting the retries halts the processor.
//!
//! - **Level Index and Pooling**: Price levels live in an arena-backed AVL
//!   tree keyed by level index; level objects are recycled through an object
//!   pool.
//!
//! ## Architecture
//!
//! ```text
//!  callers ──► Gateway ──► input log ──► Sequencer ──► output log ──► ResponseProcessor ──► ledger
//!                 │        correlation log     │                              │
//!                 └───────── waits on output ◄─┘                   commit + cursor, exactly once
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use exchange_sequencer::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = SequencerConfig::new("/tmp/sequencer-data");
//! let logs = SequencerLogs::open(&config).expect("logs");
//!
//! let mut sequencer = Sequencer::new(config.clone(), &logs).expect("sequencer");
//! sequencer.start().expect("start");
//!
//! let gateway = Gateway::new(logs.clone(), config.gateway_timeout());
//! let response = gateway.add_market(MarketSpec {
//!     market_id: MarketId::new("BTC/USDC"),
//!     tick_size: 1_000_000,
//!     base_decimals: 8,
//!     quote_decimals: 6,
//!     max_orders_per_level: 1_000,
//!     min_fee: 0,
//! });
//! assert!(response.success);
//!
//! let ledger = Arc::new(MemoryLedger::new());
//! let mut processor =
//!     ResponseProcessor::new(&logs, Arc::clone(&ledger), config.retry, config.idle_wait())
//!         .expect("processor");
//! processor.start().expect("start");
//!
//! processor.stop(Duration::from_secs(5)).expect("stop");
//! sequencer.stop(Duration::from_secs(5)).expect("stop");
//! ```
//!
//! ## Configuration
//!
//! [`SequencerConfig`](sequencer::SequencerConfig) is read from defaults, an
//! optional JSON file and `SEQUENCER_*` environment variables. Logs are JSON
//! encoded by default; enable the `bincode` feature for a compact binary
//! payload encoding, and the `metrics` feature for counters.

pub mod prelude;
pub mod sequencer;
mod utils;

pub use sequencer::journal::{DurableLog, FileLog, JournalError, LogCodec, LogRecord, LogTailer};
pub use sequencer::{
    FileLedger, Gateway, GatewayTokio, MemoryLedger, ResponseProcessor, ResultStore, Sequencer,
    SequencerConfig, SequencerLogs,
};
pub use utils::{current_time_millis, current_time_nanos, new_guid};
