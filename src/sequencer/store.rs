//! Result stores: the transactional view the response processor maintains.
//!
//! A store commits a result's effects together with the processing cursor
//! (`LastProcessedOutputIndex`), so a crash either keeps both or neither.

use super::error::StoreError;
use super::types::{
    Asset, Command, CommandKind, CommandType, FeeRates, MarketId, MarketSpec, OrderDisposition,
    OrderGuid, OrderType, SequencerResponse, TradeCreated, WalletAddress, WithdrawalCreated,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Key of the processing cursor.
pub const CURSOR_KEY: &str = "LastProcessedOutputIndex";

/// Format version of the ledger file.
pub const LEDGER_FORMAT_VERSION: u32 = 2;

/// Destination of the response processor.
pub trait ResultStore: Send + Sync {
    /// The last output-log index fully applied, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the cursor cannot be read.
    fn last_processed_index(&self) -> Result<Option<u64>, StoreError>;

    /// Applies the effects of `response` and advances the cursor to
    /// `read_index`, atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if nothing was committed.
    fn apply(
        &self,
        command: &Command,
        response: &SequencerResponse,
        read_index: u64,
    ) -> Result<(), StoreError>;
}

/// An order as recorded by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerOrder {
    /// Market.
    pub market_id: MarketId,
    /// Owner.
    pub wallet: WalletAddress,
    /// Side and style.
    pub order_type: OrderType,
    /// Original quantity.
    pub amount: u128,
    /// Level.
    pub level_ix: i64,
    /// Latest disposition.
    pub status: OrderDisposition,
    /// Resting quantity after the latest change.
    pub remaining: u128,
}

/// What a wallet can still commit to new orders in one market.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerLimits {
    /// Unreserved base balance.
    pub base: u128,
    /// Unreserved quote balance.
    pub quote: u128,
}

/// What a commit changed, handed to the [`LedgerListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerChange {
    /// Output-log index of the applied result.
    pub read_index: u64,
    /// Kind of command applied.
    pub command_type: CommandType,
    /// The applied result.
    pub response: SequencerResponse,
}

/// Callback invoked after every commit.
pub type LedgerListener = Arc<dyn Fn(&LedgerChange) + Send + Sync>;

/// Materialised view of every applied result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    /// Balances per wallet and asset.
    pub balances: BTreeMap<WalletAddress, BTreeMap<Asset, u128>>,
    /// Every order ever seen.
    pub orders: BTreeMap<OrderGuid, LedgerOrder>,
    /// Every trade. [`FileLedger`] keeps these in an append-only side
    /// file rather than in the checksummed state.
    #[serde(skip)]
    pub trades: Vec<TradeCreated>,
    /// Markets.
    pub markets: BTreeMap<MarketId, MarketSpec>,
    /// Withdrawals by external guid.
    pub withdrawals: BTreeMap<String, WithdrawalCreated>,
    /// Current fee rates.
    pub fee_rates: FeeRates,
    /// Withdrawal fees.
    pub withdrawal_fees: BTreeMap<Asset, u128>,
    /// Latest available amounts per wallet and market.
    #[serde(default)]
    pub limits: BTreeMap<WalletAddress, BTreeMap<MarketId, LedgerLimits>>,
    /// Market minimum fees.
    pub market_min_fees: BTreeMap<MarketId, u128>,
    /// Key/value settings, including the processing cursor.
    pub kv: BTreeMap<String, String>,
    /// Results applied.
    pub applied_results: u64,
}

impl LedgerState {
    /// The processing cursor.
    #[must_use]
    pub fn cursor(&self) -> Option<u64> {
        self.kv.get(CURSOR_KEY).and_then(|v| v.parse().ok())
    }

    /// Balance of `wallet` in `asset`.
    #[must_use]
    pub fn balance(&self, wallet: &WalletAddress, asset: &Asset) -> u128 {
        self.balances
            .get(wallet)
            .and_then(|assets| assets.get(asset))
            .copied()
            .unwrap_or(0)
    }

    /// Latest available amounts of `wallet` in `market_id`.
    #[must_use]
    pub fn limits(&self, wallet: &WalletAddress, market_id: &MarketId) -> Option<LedgerLimits> {
        self.limits.get(wallet)?.get(market_id).copied()
    }

    /// Applies one result; a result at or below the cursor is ignored.
    ///
    /// Returns `false` for an ignored duplicate.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Apply`] without changing anything if a balance
    /// change would take a balance out of range.
    pub fn apply_result(
        &mut self,
        command: &Command,
        response: &SequencerResponse,
        read_index: u64,
    ) -> Result<bool, StoreError> {
        if self.cursor().is_some_and(|cursor| read_index <= cursor) {
            debug!(read_index, "result already applied");
            return Ok(false);
        }

        if response.is_success() {
            self.apply_effects(command, response)?;
        } else if let CommandKind::ApplyOrderBatch(batch) = &command.kind {
            for order in &batch.orders_to_add {
                self.orders.insert(
                    order.guid,
                    LedgerOrder {
                        market_id: batch.market_id.clone(),
                        wallet: batch.wallet.clone(),
                        order_type: order.order_type,
                        amount: order.amount,
                        level_ix: order.level_ix,
                        status: OrderDisposition::Rejected,
                        remaining: 0,
                    },
                );
            }
        }

        self.kv.insert(CURSOR_KEY.to_string(), read_index.to_string());
        self.applied_results += 1;
        Ok(true)
    }

    fn apply_effects(&mut self, command: &Command, response: &SequencerResponse) -> Result<(), StoreError> {
        if matches!(command.kind, CommandKind::Reset) {
            let kv = std::mem::take(&mut self.kv);
            let applied = self.applied_results;
            *self = Self {
                kv,
                applied_results: applied,
                ..Self::default()
            };
            return Ok(());
        }

        let effects = &response.effects;
        let mut balances = Vec::with_capacity(effects.balances_changed.len());
        for change in &effects.balances_changed {
            let balance = self.balance(&change.wallet, &change.asset);
            let next = if change.delta >= 0 {
                balance.checked_add(change.delta.unsigned_abs())
            } else {
                balance.checked_sub(change.delta.unsigned_abs())
            };
            let next = next.ok_or_else(|| {
                StoreError::Apply(format!(
                    "balance of {} in {} cannot change by {}",
                    change.wallet, change.asset, change.delta
                ))
            })?;
            balances.push((change, next));
        }

        for created in &effects.markets_created {
            self.markets
                .insert(created.spec.market_id.clone(), created.spec.clone());
        }
        if let Some(rates) = effects.fee_rates_set {
            self.fee_rates = rates;
        }
        for fee in &effects.withdrawal_fees_set {
            self.withdrawal_fees.insert(fee.asset.clone(), fee.fee);
        }
        for fee in &effects.market_min_fees_set {
            self.market_min_fees.insert(fee.market_id.clone(), fee.min_fee);
        }

        let batch = match &command.kind {
            CommandKind::ApplyOrderBatch(batch) => Some(batch),
            _ => None,
        };
        for change in &effects.orders_changed {
            let remaining = change.new_quantity.unwrap_or(0);
            if let Some(order) = self.orders.get_mut(&change.guid) {
                order.status = change.disposition;
                order.remaining = remaining;
                continue;
            }
            let Some((batch, order)) = batch.and_then(|batch| {
                batch
                    .orders_to_add
                    .iter()
                    .find(|o| o.guid == change.guid)
                    .map(|order| (batch, order))
            }) else {
                continue;
            };
            let remaining = match change.disposition {
                OrderDisposition::Accepted => order.amount,
                _ => remaining,
            };
            self.orders.insert(
                order.guid,
                LedgerOrder {
                    market_id: batch.market_id.clone(),
                    wallet: batch.wallet.clone(),
                    order_type: order.order_type,
                    amount: order.amount,
                    level_ix: order.level_ix,
                    status: change.disposition,
                    remaining,
                },
            );
        }
        self.trades.extend(effects.trades_created.iter().cloned());

        for (change, next) in balances {
            self.balances
                .entry(change.wallet.clone())
                .or_default()
                .insert(change.asset.clone(), next);
        }
        for update in &effects.limits_updated {
            self.limits.entry(update.wallet.clone()).or_default().insert(
                update.market_id.clone(),
                LedgerLimits {
                    base: update.base,
                    quote: update.quote,
                },
            );
        }
        for withdrawal in &effects.withdrawals_created {
            self.withdrawals
                .insert(withdrawal.external_guid.clone(), withdrawal.clone());
        }
        Ok(())
    }
}

fn change_for(command: &Command, response: &SequencerResponse, read_index: u64) -> LedgerChange {
    LedgerChange {
        read_index,
        command_type: command.command_type(),
        response: response.clone(),
    }
}

/// Shared in-memory ledger; clones see the same data.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    state: Arc<RwLock<LedgerState>>,
    listener: Option<LedgerListener>,
}

impl MemoryLedger {
    /// Empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the commit callback.
    #[must_use]
    pub fn with_listener(mut self, listener: LedgerListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// A copy of the current state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockPoisoned`].
    pub fn snapshot(&self) -> Result<LedgerState, StoreError> {
        self.state
            .read()
            .map(|state| state.clone())
            .map_err(|_| StoreError::LockPoisoned)
    }
}

impl ResultStore for MemoryLedger {
    fn last_processed_index(&self) -> Result<Option<u64>, StoreError> {
        self.state
            .read()
            .map(|state| state.cursor())
            .map_err(|_| StoreError::LockPoisoned)
    }

    fn apply(
        &self,
        command: &Command,
        response: &SequencerResponse,
        read_index: u64,
    ) -> Result<(), StoreError> {
        let mut guard = self.state.write().map_err(|_| StoreError::LockPoisoned)?;
        if !guard.apply_result(command, response, read_index)? {
            return Ok(());
        }
        drop(guard);
        if let Some(listener) = &self.listener {
            listener(&change_for(command, response, read_index));
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLedger")
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}

#[derive(Serialize)]
struct LedgerFileRef<'a> {
    version: u32,
    checksum: String,
    trades: u64,
    state: &'a LedgerState,
}

#[derive(Deserialize)]
struct LedgerFile {
    version: u32,
    checksum: String,
    trades: u64,
    state: LedgerState,
}

fn ledger_checksum(state: &LedgerState, trades: u64) -> Result<String, StoreError> {
    let payload =
        serde_json::to_vec(state).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(trades.to_le_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Reads the first `count` trades of the side file, dropping anything
/// written after the last commit.
fn load_trades(path: &Path, count: u64) -> Result<Vec<TradeCreated>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let mut trades = Vec::new();
    let mut offset = 0usize;
    while (trades.len() as u64) < count {
        let Some(end) = bytes[offset..].iter().position(|b| *b == b'\n') else {
            return Err(StoreError::Serialization(format!(
                "trade file holds {} of {count} committed trades",
                trades.len()
            )));
        };
        let trade = serde_json::from_slice(&bytes[offset..offset + end])
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        trades.push(trade);
        offset += end + 1;
    }
    if offset < bytes.len() {
        warn!(
            path = %path.display(),
            dropped_bytes = bytes.len() - offset,
            "discarding uncommitted trades"
        );
        OpenOptions::new()
            .write(true)
            .open(path)?
            .set_len(offset as u64)?;
    }
    Ok(trades)
}

/// Durable JSON ledger.
///
/// Every commit appends the new trades to `<path>.trades` and then replaces
/// the state file atomically; the state file records how many trades are
/// committed, so a crash between the two steps is repaired on open.
pub struct FileLedger {
    path: PathBuf,
    trades_path: PathBuf,
    state: Mutex<LedgerState>,
    listener: Option<LedgerListener>,
}

impl FileLedger {
    /// Opens the ledger at `path`, or starts empty if the file is absent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file is unreadable or fails its
    /// checksum.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let trades_path = path.with_extension("trades");
        let state = Self::load(&path, &trades_path)?;
        Ok(Self {
            path,
            trades_path,
            state: Mutex::new(state),
            listener: None,
        })
    }

    fn load(path: &Path, trades_path: &Path) -> Result<LedgerState, StoreError> {
        let (mut state, trades) = match fs::read(path) {
            Ok(bytes) => {
                let file: LedgerFile = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                if file.version != LEDGER_FORMAT_VERSION {
                    return Err(StoreError::Serialization(format!(
                        "unsupported ledger version {}",
                        file.version
                    )));
                }
                let actual = ledger_checksum(&file.state, file.trades)?;
                if actual != file.checksum {
                    return Err(StoreError::ChecksumMismatch {
                        expected: file.checksum,
                        actual,
                    });
                }
                info!(path = %path.display(), cursor = ?file.state.cursor(), "ledger loaded");
                (file.state, file.trades)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (LedgerState::default(), 0),
            Err(e) => return Err(e.into()),
        };
        state.trades = load_trades(trades_path, trades)?;
        Ok(state)
    }

    /// Registers the commit callback.
    #[must_use]
    pub fn with_listener(mut self, listener: LedgerListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Path of the ledger file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A copy of the current state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::LockPoisoned`].
    pub fn snapshot(&self) -> Result<LedgerState, StoreError> {
        self.state
            .lock()
            .map(|state| state.clone())
            .map_err(|_| StoreError::LockPoisoned)
    }

    fn append_trades(&self, trades: &[TradeCreated]) -> Result<(), StoreError> {
        if trades.is_empty() {
            return Ok(());
        }
        let mut bytes = Vec::new();
        for trade in trades {
            serde_json::to_writer(&mut bytes, trade)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            bytes.push(b'\n');
        }
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.trades_path)?;
        out.write_all(&bytes)?;
        out.sync_all()?;
        Ok(())
    }

    fn persist(&self, state: &LedgerState) -> Result<(), StoreError> {
        let trades = state.trades.len() as u64;
        let file = LedgerFileRef {
            version: LEDGER_FORMAT_VERSION,
            checksum: ledger_checksum(state, trades)?,
            trades,
            state,
        };
        let bytes =
            serde_json::to_vec(&file).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut out = File::create(&tmp)?;
            out.write_all(&bytes)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn commit(&self, state: &LedgerState, committed_trades: usize) -> Result<(), StoreError> {
        self.append_trades(&state.trades[committed_trades..])?;
        self.persist(state)
    }
}

impl ResultStore for FileLedger {
    fn last_processed_index(&self) -> Result<Option<u64>, StoreError> {
        self.state
            .lock()
            .map(|state| state.cursor())
            .map_err(|_| StoreError::LockPoisoned)
    }

    fn apply(
        &self,
        command: &Command,
        response: &SequencerResponse,
        read_index: u64,
    ) -> Result<(), StoreError> {
        let mut guard = self.state.lock().map_err(|_| StoreError::LockPoisoned)?;
        let committed_trades = guard.trades.len();
        if !guard.apply_result(command, response, read_index)? {
            return Ok(());
        }
        if let Err(e) = self.commit(&guard, committed_trades) {
            warn!(read_index, error = %e, "ledger commit failed, reloading last commit");
            *guard = Self::load(&self.path, &self.trades_path)?;
            return Err(e);
        }
        drop(guard);
        if let Some(listener) = &self.listener {
            listener(&change_for(command, response, read_index));
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLedger")
            .field("path", &self.path)
            .field("has_listener", &self.listener.is_some())
            .finish()
    }
}
