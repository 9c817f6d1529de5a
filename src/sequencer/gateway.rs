//! Synchronous request/response bridge over the durable logs.
//!
//! A call appends the command to the input log, appends its correlation,
//! then reads the output log from the calling thread's own cursor until the
//! result with the same guid appears. Results for other commands are
//! skipped; matching relies on guid equality only.

use super::engine::SequencerLogs;
use super::error::GatewayError;
use super::journal::{JournalError, LogTailer};
use super::types::{
    BalanceBatch, Command, CommandKind, Correlation, FeeRates, MarketMinFee, MarketSpec,
    OrderBatch, SequencerResponse, WithdrawalFee,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

static NEXT_GATEWAY_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// Next output position to read, per gateway, for the current thread.
    static OUTPUT_CURSORS: RefCell<HashMap<u64, u64>> = RefCell::new(HashMap::new());
}

/// Outcome of a gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayResponse {
    /// A result arrived and reports no business error.
    pub success: bool,
    /// Wall time of the whole call.
    pub processing_time_ns: u64,
    /// The sequencer's result, if one arrived.
    pub response: Option<SequencerResponse>,
    /// Transport failure, if any.
    pub error: Option<GatewayError>,
}

impl GatewayResponse {
    fn received(response: SequencerResponse, started: Instant) -> Self {
        Self {
            success: response.is_success(),
            processing_time_ns: elapsed_ns(started),
            response: Some(response),
            error: None,
        }
    }

    fn failure(error: GatewayError, started: Instant) -> Self {
        Self {
            success: false,
            processing_time_ns: elapsed_ns(started),
            response: None,
            error: Some(error),
        }
    }
}

fn elapsed_ns(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

/// Guid to input position, fed from the correlation log.
struct CorrelationIndex {
    tailer: LogTailer<Correlation>,
    positions: HashMap<String, u64>,
}

impl CorrelationIndex {
    /// Reads every correlation appended since the last call.
    fn catch_up(&mut self) -> Result<(), JournalError> {
        while let Some(record) = self.tailer.try_next()? {
            self.positions
                .insert(record.payload.guid, record.payload.position);
        }
        Ok(())
    }
}

/// Blocking gateway shared by any number of caller threads.
pub struct Gateway {
    id: u64,
    logs: SequencerLogs,
    timeout: Duration,
    index: Mutex<CorrelationIndex>,
}

impl Gateway {
    /// Creates a gateway over `logs` that waits up to `timeout` per call.
    #[must_use]
    pub fn new(logs: SequencerLogs, timeout: Duration) -> Self {
        let index = CorrelationIndex {
            tailer: LogTailer::new(Arc::clone(&logs.correlation)),
            positions: HashMap::new(),
        };
        Self {
            id: NEXT_GATEWAY_ID.fetch_add(1, Ordering::Relaxed),
            logs,
            timeout,
            index: Mutex::new(index),
        }
    }

    /// The configured wait for a result.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn thread_cursor(&self) -> u64 {
        OUTPUT_CURSORS.with(|cursors| {
            *cursors
                .borrow_mut()
                .entry(self.id)
                .or_insert_with(|| self.logs.output.next_position())
        })
    }

    fn store_thread_cursor(&self, cursor: u64) {
        OUTPUT_CURSORS.with(|cursors| {
            cursors.borrow_mut().insert(self.id, cursor);
        });
    }

    /// Submits `command` and waits for its result.
    pub fn submit(&self, command: Command) -> GatewayResponse {
        let started = Instant::now();
        let mut cursor = self.thread_cursor();

        let position = match self.logs.input.append(&command) {
            Ok(position) => position,
            Err(e) => return GatewayResponse::failure(e.into(), started),
        };
        let correlation = Correlation {
            guid: command.guid.clone(),
            position,
        };
        if let Err(e) = self.logs.correlation.append(&correlation) {
            return GatewayResponse::failure(e.into(), started);
        }
        trace!(guid = %command.guid, position, cursor, "command submitted");

        let deadline = started + self.timeout;
        loop {
            match self.logs.output.read(cursor) {
                Ok(Some(record)) => {
                    cursor += 1;
                    if record.payload.guid == command.guid {
                        self.store_thread_cursor(cursor);
                        debug!(
                            guid = %command.guid,
                            position,
                            success = record.payload.is_success(),
                            "result received"
                        );
                        return GatewayResponse::received(record.payload, started);
                    }
                }
                Ok(None) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.store_thread_cursor(cursor);
                        warn!(guid = %command.guid, position, "timed out waiting for result");
                        #[cfg(feature = "metrics")]
                        metrics::counter!("gateway_timeouts_total").increment(1);
                        return GatewayResponse::failure(
                            GatewayError::Timeout {
                                guid: command.guid,
                                position,
                            },
                            started,
                        );
                    }
                    self.logs.output.wait_for(cursor, deadline - now);
                }
                Err(e) => {
                    warn!(output_position = cursor, error = %e, "skipping unreadable result");
                    cursor += 1;
                }
            }
        }
    }

    /// Creates a market.
    pub fn add_market(&self, spec: MarketSpec) -> GatewayResponse {
        self.submit(Command::new(CommandKind::AddMarket(spec)))
    }

    /// Applies an order batch.
    pub fn apply_order_batch(&self, batch: OrderBatch) -> GatewayResponse {
        self.submit(Command::new(CommandKind::ApplyOrderBatch(batch)))
    }

    /// Applies a balance batch.
    pub fn apply_balance_batch(&self, batch: BalanceBatch) -> GatewayResponse {
        self.submit(Command::new(CommandKind::ApplyBalanceBatch(batch)))
    }

    /// Clears all state (sandbox only).
    pub fn reset(&self) -> GatewayResponse {
        self.submit(Command::new(CommandKind::Reset))
    }

    /// Dumps all state (sandbox only).
    pub fn get_state(&self) -> GatewayResponse {
        self.submit(Command::new(CommandKind::GetState))
    }

    /// Replaces the fee rates.
    pub fn set_fee_rates(&self, rates: FeeRates) -> GatewayResponse {
        self.submit(Command::new(CommandKind::SetFeeRates(rates)))
    }

    /// Sets withdrawal fees.
    pub fn set_withdrawal_fees(&self, fees: Vec<WithdrawalFee>) -> GatewayResponse {
        self.submit(Command::new(CommandKind::SetWithdrawalFees(fees)))
    }

    /// Sets market minimum fees.
    pub fn set_market_min_fees(&self, fees: Vec<MarketMinFee>) -> GatewayResponse {
        self.submit(Command::new(CommandKind::SetMarketMinFees(fees)))
    }

    /// Input-log position of the command with `guid`; the newest
    /// submission wins when a guid was reused.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if a correlation record cannot be read.
    pub fn position_of(&self, guid: &str) -> Result<Option<u64>, JournalError> {
        let mut index = self
            .index
            .lock()
            .map_err(|_| JournalError::MutexPoisoned)?;
        index.catch_up()?;
        Ok(index.positions.get(guid).copied())
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .field("logs", &self.logs)
            .finish()
    }
}

/// Async façade running [`Gateway::submit`] on Tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct GatewayTokio {
    inner: Arc<Gateway>,
}

impl GatewayTokio {
    /// Wraps a shared gateway.
    #[must_use]
    pub fn new(inner: Arc<Gateway>) -> Self {
        Self { inner }
    }

    /// The wrapped gateway.
    #[must_use]
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.inner
    }

    /// Submits `command` without blocking the async runtime.
    pub async fn submit(&self, command: Command) -> GatewayResponse {
        let started = Instant::now();
        let gateway = Arc::clone(&self.inner);
        match tokio::task::spawn_blocking(move || gateway.submit(command)).await {
            Ok(response) => response,
            Err(e) => GatewayResponse::failure(GatewayError::Task(e.to_string()), started),
        }
    }

    /// Async [`Gateway::add_market`].
    pub async fn add_market(&self, spec: MarketSpec) -> GatewayResponse {
        self.submit(Command::new(CommandKind::AddMarket(spec))).await
    }

    /// Async [`Gateway::apply_order_batch`].
    pub async fn apply_order_batch(&self, batch: OrderBatch) -> GatewayResponse {
        self.submit(Command::new(CommandKind::ApplyOrderBatch(batch)))
            .await
    }

    /// Async [`Gateway::apply_balance_batch`].
    pub async fn apply_balance_batch(&self, batch: BalanceBatch) -> GatewayResponse {
        self.submit(Command::new(CommandKind::ApplyBalanceBatch(batch)))
            .await
    }

    /// Async [`Gateway::set_fee_rates`].
    pub async fn set_fee_rates(&self, rates: FeeRates) -> GatewayResponse {
        self.submit(Command::new(CommandKind::SetFeeRates(rates))).await
    }
}
