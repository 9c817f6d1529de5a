/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/

//! Prelude module that re-exports commonly used types and traits.
//!
//! ```rust
//! use exchange_sequencer::prelude::*;
//! ```
//!
//! This imports everything needed to run a sequencer, submit commands
//! through a gateway and consume results with a response processor.

// Engine, gateway and processor
pub use crate::sequencer::engine::{Sequencer, SequencerLogs, SequencerPhase};
pub use crate::sequencer::gateway::{Gateway, GatewayResponse, GatewayTokio};
pub use crate::sequencer::processor::{AbnormalStopHandler, ResponseProcessor};

// Configuration
pub use crate::sequencer::config::{RetryPolicy, SequencerConfig};

// Result stores
pub use crate::sequencer::store::{
    FileLedger, LedgerChange, LedgerLimits, LedgerListener, LedgerState, MemoryLedger,
    ResultStore,
};

// Durable logs
pub use crate::sequencer::journal::{DurableLog, FileLog, LogCodec, LogTailer};

// Errors
pub use crate::sequencer::error::{
    EngineError, GatewayError, ProcessorError, SequencerError, StoreError,
};
pub use crate::sequencer::journal::JournalError;

// Commands and results
pub use crate::sequencer::types::{
    Asset, BalanceBatch, Command, CommandKind, Deposit, Effects, FailedSettlement,
    FailedWithdrawal, FeeRates, LimitsUpdate, MarketId, MarketMinFee, MarketSpec, Order,
    OrderBatch, OrderDisposition, OrderType, SequencerResponse, WalletAddress, Withdrawal,
    WithdrawalFee,
};

// Utility functions
pub use crate::utils::{current_time_millis, new_guid};
