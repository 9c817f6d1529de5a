//! Core types for the sequencer: commands, correlations and results.
//!
//! - [`Command`] — a guid-tagged request appended once to the input log
//! - [`Correlation`] — `{guid, position}` appended to the correlation log
//! - [`SequencerResponse`] — the single result appended to the output log
//! - [`Effects`] — everything a command changed

use super::error::SequencerError;
use crate::utils::new_guid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange-assigned order identifier.
pub type OrderGuid = u64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wraps a string identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// The identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Market symbol of the form `BASE/QUOTE`.
    MarketId
);
string_id!(
    /// Wallet address owning balances and orders.
    WalletAddress
);
string_id!(
    /// Asset symbol.
    Asset
);

impl MarketId {
    /// The base asset (left of `/`).
    #[must_use]
    pub fn base_asset(&self) -> Asset {
        Asset::new(self.0.split_once('/').map_or(self.0.as_str(), |(b, _)| b))
    }

    /// The quote asset (right of `/`).
    #[must_use]
    pub fn quote_asset(&self) -> Asset {
        Asset::new(self.0.split_once('/').map_or("", |(_, q)| q))
    }
}

// ─── Commands ───────────────────────────────────────────────────────────────

/// Discriminant of a [`CommandKind`], used for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandType {
    /// See [`CommandKind::AddMarket`].
    AddMarket,
    /// See [`CommandKind::ApplyOrderBatch`].
    ApplyOrderBatch,
    /// See [`CommandKind::ApplyBalanceBatch`].
    ApplyBalanceBatch,
    /// See [`CommandKind::Reset`].
    Reset,
    /// See [`CommandKind::GetState`].
    GetState,
    /// See [`CommandKind::SetFeeRates`].
    SetFeeRates,
    /// See [`CommandKind::SetWithdrawalFees`].
    SetWithdrawalFees,
    /// See [`CommandKind::SetMarketMinFees`].
    SetMarketMinFees,
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A request submitted for sequenced execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Client-generated correlation id.
    pub guid: String,
    /// The request payload.
    pub kind: CommandKind,
}

impl Command {
    /// Wraps `kind` with a freshly generated guid.
    #[must_use]
    pub fn new(kind: CommandKind) -> Self {
        Self {
            guid: new_guid(),
            kind,
        }
    }

    /// Wraps `kind` with an explicit guid.
    pub fn with_guid(guid: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            guid: guid.into(),
            kind,
        }
    }

    /// The command's discriminant.
    #[must_use]
    pub fn command_type(&self) -> CommandType {
        match &self.kind {
            CommandKind::AddMarket(_) => CommandType::AddMarket,
            CommandKind::ApplyOrderBatch(_) => CommandType::ApplyOrderBatch,
            CommandKind::ApplyBalanceBatch(_) => CommandType::ApplyBalanceBatch,
            CommandKind::Reset => CommandType::Reset,
            CommandKind::GetState => CommandType::GetState,
            CommandKind::SetFeeRates(_) => CommandType::SetFeeRates,
            CommandKind::SetWithdrawalFees(_) => CommandType::SetWithdrawalFees,
            CommandKind::SetMarketMinFees(_) => CommandType::SetMarketMinFees,
        }
    }
}

/// The fixed set of command payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// Create a market (idempotent for identical parameters).
    AddMarket(MarketSpec),
    /// Cancel and add orders for one wallet in one market.
    ApplyOrderBatch(OrderBatch),
    /// Deposits, withdrawals and failed withdrawals.
    ApplyBalanceBatch(BalanceBatch),
    /// Clear all state (sandbox mode only).
    Reset,
    /// Dump all state (sandbox mode only).
    GetState,
    /// Replace the maker/taker fee rates.
    SetFeeRates(FeeRates),
    /// Set per-asset withdrawal fees.
    SetWithdrawalFees(Vec<WithdrawalFee>),
    /// Set per-market minimum fees.
    SetMarketMinFees(Vec<MarketMinFee>),
}

/// Parameters of a market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketSpec {
    /// Market symbol, `BASE/QUOTE`.
    pub market_id: MarketId,
    /// Quote atomic units per whole base unit for one level step.
    pub tick_size: u128,
    /// Decimals of the base asset.
    pub base_decimals: u8,
    /// Decimals of the quote asset.
    pub quote_decimals: u8,
    /// Capacity of a single price level.
    pub max_orders_per_level: u32,
    /// Minimum fee an order must generate, in quote atomic units.
    #[serde(default)]
    pub min_fee: u128,
}

/// Order side and execution style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    /// Rests at `level_ix` after crossing up to it.
    LimitBuy,
    /// Rests at `level_ix` after crossing down to it.
    LimitSell,
    /// Takes offers until filled or the book is empty.
    MarketBuy,
    /// Takes bids until filled or the book is empty.
    MarketSell,
}

impl OrderType {
    /// `true` for buy orders.
    #[must_use]
    pub fn is_buy(self) -> bool {
        matches!(self, OrderType::LimitBuy | OrderType::MarketBuy)
    }

    /// `true` for market orders.
    #[must_use]
    pub fn is_market(self) -> bool {
        matches!(self, OrderType::MarketBuy | OrderType::MarketSell)
    }
}

/// An order to add.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier.
    pub guid: OrderGuid,
    /// Side and execution style.
    pub order_type: OrderType,
    /// Quantity in base atomic units.
    pub amount: u128,
    /// Price level; ignored for market orders.
    #[serde(default)]
    pub level_ix: i64,
}

/// Orders to cancel and add for one wallet in one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBatch {
    /// Target market.
    pub market_id: MarketId,
    /// Owner of every order in the batch.
    pub wallet: WalletAddress,
    /// Orders to add, in order.
    #[serde(default)]
    pub orders_to_add: Vec<Order>,
    /// Orders to cancel, applied before adds.
    #[serde(default)]
    pub orders_to_cancel: Vec<OrderGuid>,
    /// Cancel every resting order of `wallet` before applying the batch.
    #[serde(default)]
    pub cancel_all: bool,
}

/// A credited deposit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    /// Receiving wallet.
    pub wallet: WalletAddress,
    /// Deposited asset.
    pub asset: Asset,
    /// Atomic units.
    pub amount: u128,
}

/// A withdrawal request; `amount == 0` withdraws the full balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    /// Debited wallet.
    pub wallet: WalletAddress,
    /// Withdrawn asset.
    pub asset: Asset,
    /// Atomic units, 0 for everything.
    pub amount: u128,
    /// Identifier assigned by the requesting service.
    pub external_guid: String,
}

/// A withdrawal that failed downstream and is credited back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedWithdrawal {
    /// Credited wallet.
    pub wallet: WalletAddress,
    /// Asset returned.
    pub asset: Asset,
    /// Atomic units returned.
    pub amount: u128,
}

/// A trade whose on-chain settlement failed; both sides are unwound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedSettlement {
    /// Market the trade executed in.
    pub market_id: MarketId,
    /// Wallet that bought.
    pub buy_wallet: WalletAddress,
    /// Wallet that sold.
    pub sell_wallet: WalletAddress,
    /// Base atomic units traded.
    pub amount: u128,
    /// Level the trade executed at.
    pub level_ix: i64,
    /// Fee the buyer paid, returned to them.
    pub buyer_fee: u128,
    /// Fee the seller paid, returned to them.
    pub seller_fee: u128,
}

/// Balance movements applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceBatch {
    /// Credits.
    #[serde(default)]
    pub deposits: Vec<Deposit>,
    /// Debits, subject to balance and fee checks.
    #[serde(default)]
    pub withdrawals: Vec<Withdrawal>,
    /// Credits for withdrawals that did not settle.
    #[serde(default)]
    pub failed_withdrawals: Vec<FailedWithdrawal>,
    /// Trades to unwind.
    #[serde(default)]
    pub failed_settlements: Vec<FailedSettlement>,
}

/// Maker and taker fee rates in millionths (1_000_000 = 100%).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRates {
    /// Rate charged to resting orders.
    pub maker: u64,
    /// Rate charged to crossing orders.
    pub taker: u64,
}

impl FeeRates {
    /// Largest representable fee rate.
    pub const MAX_RATE: u64 = 1_000_000;

    /// Both rates within `0..=MAX_RATE`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.maker <= Self::MAX_RATE && self.taker <= Self::MAX_RATE
    }
}

/// Fee charged on withdrawals of one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalFee {
    /// Asset symbol.
    pub asset: Asset,
    /// Fee in atomic units.
    pub fee: u128,
}

/// Minimum fee per order for one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketMinFee {
    /// Market symbol.
    pub market_id: MarketId,
    /// Minimum fee in quote atomic units.
    pub min_fee: u128,
}

/// Maps a command guid to its input-log position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    /// Command guid.
    pub guid: String,
    /// Input-log position of the command.
    pub position: u64,
}

// ─── Results ────────────────────────────────────────────────────────────────

/// Outcome of an order add or cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDisposition {
    /// Rests on the book untouched.
    Accepted,
    /// Some quantity executed.
    PartiallyFilled,
    /// Fully executed.
    Filled,
    /// Removed by its owner.
    Canceled,
    /// Not placed (no liquidity, full level, below minimum fee).
    Rejected,
    /// Shrunk by the sequencer because the owner's balance no longer
    /// covers it; a new quantity of 0 removes it from the book.
    AutoReduced,
}

/// A change to one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderChanged {
    /// Order identifier.
    pub guid: OrderGuid,
    /// What happened to it.
    pub disposition: OrderDisposition,
    /// Remaining resting quantity after a partial fill or auto-reduce.
    #[serde(default)]
    pub new_quantity: Option<u128>,
}

/// Why a cancel was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// No resting order with that guid.
    DoesNotExist,
    /// The order belongs to another wallet.
    NotForWallet,
}

/// A refused order change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRejected {
    /// Order identifier.
    pub guid: OrderGuid,
    /// Reason for refusal.
    pub reason: RejectReason,
}

/// A fill between a buy and a sell order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeCreated {
    /// Market symbol.
    pub market_id: MarketId,
    /// Buying order.
    pub buy_order_guid: OrderGuid,
    /// Selling order.
    pub sell_order_guid: OrderGuid,
    /// Base atomic units exchanged.
    pub amount: u128,
    /// Level the trade executed at.
    pub level_ix: i64,
    /// Quote atomic units per whole base unit.
    pub price: u128,
    /// Fee charged to the buyer in quote units.
    pub buyer_fee: u128,
    /// Fee charged to the seller in quote units.
    pub seller_fee: u128,
}

/// Net signed balance change for one wallet and asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    /// Wallet.
    pub wallet: WalletAddress,
    /// Asset.
    pub asset: Asset,
    /// Signed atomic units.
    pub delta: i128,
}

/// What a wallet can still commit to new orders in one market.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsUpdate {
    /// Wallet.
    pub wallet: WalletAddress,
    /// Market.
    pub market_id: MarketId,
    /// Base balance not reserved by resting orders in any market.
    pub base: u128,
    /// Quote balance not reserved by resting orders in any market.
    pub quote: u128,
}

/// A market successfully created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketCreated {
    /// Market parameters.
    pub spec: MarketSpec,
}

/// An accepted withdrawal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalCreated {
    /// Identifier from the withdrawal request.
    pub external_guid: String,
    /// Wallet debited.
    pub wallet: WalletAddress,
    /// Asset withdrawn.
    pub asset: Asset,
    /// Amount debited.
    pub amount: u128,
    /// Withdrawal fee applicable to the asset.
    pub fee: u128,
}

/// Top-of-book summary of a market.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BidOfferState {
    /// Market symbol.
    pub market_id: MarketId,
    /// Highest bid level.
    pub best_bid_ix: Option<i64>,
    /// Lowest bid level.
    pub min_bid_ix: Option<i64>,
    /// Lowest offer level.
    pub best_offer_ix: Option<i64>,
    /// Highest offer level.
    pub max_offer_ix: Option<i64>,
}

impl Default for MarketId {
    fn default() -> Self {
        Self(String::new())
    }
}

/// A resting order as reported in a state dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDump {
    /// Order identifier.
    pub guid: OrderGuid,
    /// Owner.
    pub wallet: WalletAddress,
    /// Resting quantity.
    pub quantity: u128,
    /// Fee rate locked in at placement.
    pub fee_rate: u64,
}

/// A price level as reported in a state dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelDump {
    /// Level index.
    pub level_ix: i64,
    /// Orders in time priority.
    pub orders: Vec<OrderDump>,
}

/// A market as reported in a state dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDump {
    /// Market parameters.
    pub spec: MarketSpec,
    /// Bid levels, best first.
    pub bids: Vec<LevelDump>,
    /// Offer levels, best first.
    pub offers: Vec<LevelDump>,
}

/// Full sequencer state, returned by [`CommandKind::GetState`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateDump {
    /// Every non-zero balance.
    pub balances: Vec<BalanceDump>,
    /// Every market with its book.
    pub markets: Vec<MarketDump>,
    /// Current fee rates.
    pub fee_rates: FeeRates,
    /// Current withdrawal fees.
    pub withdrawal_fees: Vec<WithdrawalFee>,
}

/// One balance in a state dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDump {
    /// Wallet.
    pub wallet: WalletAddress,
    /// Asset.
    pub asset: Asset,
    /// Atomic units.
    pub amount: u128,
}

/// Everything a command changed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Effects {
    /// Added, filled and canceled orders.
    #[serde(default)]
    pub orders_changed: Vec<OrderChanged>,
    /// Refused cancels.
    #[serde(default)]
    pub orders_rejected: Vec<OrderRejected>,
    /// Executions.
    #[serde(default)]
    pub trades_created: Vec<TradeCreated>,
    /// Net balance deltas, zero deltas omitted.
    #[serde(default)]
    pub balances_changed: Vec<BalanceChange>,
    /// Available amounts of every wallet and market touched, sorted by
    /// wallet then market.
    #[serde(default)]
    pub limits_updated: Vec<LimitsUpdate>,
    /// Markets created.
    #[serde(default)]
    pub markets_created: Vec<MarketCreated>,
    /// Accepted withdrawals.
    #[serde(default)]
    pub withdrawals_created: Vec<WithdrawalCreated>,
    /// New fee rates.
    #[serde(default)]
    pub fee_rates_set: Option<FeeRates>,
    /// New withdrawal fees.
    #[serde(default)]
    pub withdrawal_fees_set: Vec<WithdrawalFee>,
    /// New market minimum fees.
    #[serde(default)]
    pub market_min_fees_set: Vec<MarketMinFee>,
    /// Top of book after an order batch.
    #[serde(default)]
    pub bid_offer_state: Option<BidOfferState>,
    /// Full state, for [`CommandKind::GetState`].
    #[serde(default)]
    pub state_dump: Option<StateDump>,
}

impl Effects {
    /// `true` if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Effects::default()
    }
}

/// The single result produced for a command and appended to the output log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencerResponse {
    /// Guid of the originating command.
    pub guid: String,
    /// Input-log position of the originating command.
    pub position: u64,
    /// Business error, if the command was refused.
    #[serde(default)]
    pub error: Option<SequencerError>,
    /// State changes.
    #[serde(default)]
    pub effects: Effects,
    /// Wall-clock creation time in milliseconds.
    pub created_at_ms: u64,
    /// Time spent applying the command.
    pub processing_time_ns: u64,
}

impl SequencerResponse {
    /// A successful response with no effects yet.
    pub fn new(guid: impl Into<String>, position: u64) -> Self {
        Self {
            guid: guid.into(),
            position,
            error: None,
            effects: Effects::default(),
            created_at_ms: 0,
            processing_time_ns: 0,
        }
    }

    /// A response carrying only `error`.
    pub fn failed(guid: impl Into<String>, position: u64, error: SequencerError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(guid, position)
        }
    }

    /// `true` if no business error was reported.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Equality ignoring the timing fields.
    #[must_use]
    pub fn same_outcome(&self, other: &SequencerResponse) -> bool {
        self.guid == other.guid
            && self.position == other.position
            && self.error == other.error
            && self.effects == other.effects
    }
}
