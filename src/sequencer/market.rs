//! In-memory order book of a single market.
//!
//! Bids and offers are [`BalancedIndexTree`]s keyed by level index; each
//! level holds its orders in time priority. Levels removed from the book are
//! returned to an [`ObjectPool`] and reused for the next new level.

use super::pool::ObjectPool;
use super::tree::{BalancedIndexTree, NodeId};
use super::types::{
    Asset, BidOfferState, FeeRates, LevelDump, MarketDump, MarketSpec, Order, OrderBatch,
    OrderChanged, OrderDisposition, OrderDump, OrderGuid, OrderRejected, OrderType,
    RejectReason, TradeCreated, WalletAddress,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::{debug, trace};

/// Net balance changes keyed by wallet and asset.
pub type BalanceDeltas = BTreeMap<(WalletAddress, Asset), i128>;

/// Levels kept warm in a fresh market's pool.
const LEVEL_POOL_SIZE: usize = 16;

/// Denominator of fee rates.
const FEE_RATE_SCALE: u128 = 1_000_000;

/// An order resting at a level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelOrder {
    /// Order identifier.
    pub guid: OrderGuid,
    /// Owner.
    pub wallet: WalletAddress,
    /// Unfilled quantity.
    pub quantity: u128,
    /// Maker fee rate in effect when the order was placed.
    pub fee_rate: u64,
}

/// One price level of one side of the book.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    /// Level index.
    pub level_ix: i64,
    /// Orders in time priority.
    pub orders: VecDeque<LevelOrder>,
    /// Sum of the orders' quantities.
    pub total_quantity: u128,
}

impl Level {
    fn reset(&mut self) {
        self.level_ix = 0;
        self.orders.clear();
        self.total_quantity = 0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RestingOrder {
    wallet: WalletAddress,
    is_buy: bool,
    level_ix: i64,
}

struct Fill {
    maker_guid: OrderGuid,
    maker_wallet: WalletAddress,
    maker_rate: u64,
    maker_remaining: u128,
    amount: u128,
    level_ix: i64,
    price: u128,
}

fn level_pool() -> ObjectPool<Level> {
    ObjectPool::new(Level::default, Level::reset, LEVEL_POOL_SIZE)
}

/// `a * b / d`, saturating instead of overflowing.
fn mul_div(a: u128, b: u128, d: u128) -> u128 {
    let d = d.max(1);
    match a.checked_mul(b) {
        Some(product) => product / d,
        None => (a / d).saturating_mul(b),
    }
}

fn signed(value: u128) -> i128 {
    i128::try_from(value).unwrap_or(i128::MAX)
}

/// Adds `delta` to the running balance change of `(wallet, asset)`.
pub fn add_delta(deltas: &mut BalanceDeltas, wallet: &WalletAddress, asset: &Asset, delta: i128) {
    if delta == 0 {
        return;
    }
    let entry = deltas.entry((wallet.clone(), asset.clone())).or_insert(0);
    *entry = entry.saturating_add(delta);
}

/// Effects of one order batch on one market.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Added, filled and canceled orders.
    pub orders_changed: Vec<OrderChanged>,
    /// Refused cancels.
    pub orders_rejected: Vec<OrderRejected>,
    /// Executions.
    pub trades_created: Vec<TradeCreated>,
    /// Net balance changes.
    pub balance_deltas: BalanceDeltas,
}

/// A market with its order book.
#[derive(Debug, Serialize, Deserialize)]
pub struct Market {
    spec: MarketSpec,
    bids: BalancedIndexTree<Level>,
    offers: BalancedIndexTree<Level>,
    orders: BTreeMap<OrderGuid, RestingOrder>,
    wallet_orders: BTreeMap<WalletAddress, BTreeSet<OrderGuid>>,
    #[serde(skip, default = "level_pool")]
    level_pool: ObjectPool<Level>,
}

impl Market {
    /// Creates an empty market.
    #[must_use]
    pub fn new(spec: MarketSpec) -> Self {
        Self {
            spec,
            bids: BalancedIndexTree::new(),
            offers: BalancedIndexTree::new(),
            orders: BTreeMap::new(),
            wallet_orders: BTreeMap::new(),
            level_pool: level_pool(),
        }
    }

    /// Market parameters.
    #[must_use]
    pub fn spec(&self) -> &MarketSpec {
        &self.spec
    }

    /// Replaces the per-order minimum fee.
    pub fn set_min_fee(&mut self, min_fee: u128) {
        self.spec.min_fee = min_fee;
    }

    /// `true` if the given spec describes this market.
    #[must_use]
    pub fn matches_spec(&self, other: &MarketSpec) -> bool {
        self.spec.tick_size == other.tick_size
            && self.spec.base_decimals == other.base_decimals
            && self.spec.quote_decimals == other.quote_decimals
    }

    /// Number of resting orders.
    #[must_use]
    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    /// `true` if an order with `guid` rests on the book.
    #[must_use]
    pub fn has_order(&self, guid: OrderGuid) -> bool {
        self.orders.contains_key(&guid)
    }

    /// Resting quantity of an order.
    #[must_use]
    pub fn order_quantity(&self, guid: OrderGuid) -> Option<u128> {
        self.level_order(guid).map(|(_, order)| order.quantity)
    }

    fn level_order(&self, guid: OrderGuid) -> Option<(&RestingOrder, &LevelOrder)> {
        let resting = self.orders.get(&guid)?;
        let tree = if resting.is_buy { &self.bids } else { &self.offers };
        let order = tree
            .get(resting.level_ix)?
            .orders
            .iter()
            .find(|o| o.guid == guid)?;
        Some((resting, order))
    }

    /// `true` if `wallet` has orders resting in this market.
    #[must_use]
    pub fn has_orders_of(&self, wallet: &WalletAddress) -> bool {
        self.wallet_orders.contains_key(wallet)
    }

    /// Quote needed to pay for `quantity` at `level_ix`, fee included.
    fn buy_cost(&self, quantity: u128, level_ix: i64, fee_rate: u64) -> u128 {
        let notional = self.notional(quantity, self.price(level_ix));
        notional.saturating_add(Self::fee(notional, fee_rate))
    }

    /// `(base, quote)` reserved by the resting orders of `wallet`, leaving
    /// out the orders in `excluded`.
    #[must_use]
    pub fn reserved(&self, wallet: &WalletAddress, excluded: &BTreeSet<OrderGuid>) -> (u128, u128) {
        let Some(guids) = self.wallet_orders.get(wallet) else {
            return (0, 0);
        };
        let mut base = 0u128;
        let mut quote = 0u128;
        for guid in guids.difference(excluded) {
            let Some((resting, order)) = self.level_order(*guid) else {
                continue;
            };
            if resting.is_buy {
                quote = quote.saturating_add(self.buy_cost(
                    order.quantity,
                    resting.level_ix,
                    order.fee_rate,
                ));
            } else {
                base = base.saturating_add(order.quantity);
            }
        }
        (base, quote)
    }

    /// Pool statistics: `(idle levels, levels handed out)`.
    #[must_use]
    pub fn level_pool_stats(&self) -> (usize, usize) {
        (self.level_pool.pool_size(), self.level_pool.borrowed_count())
    }

    /// Quote atomic units per whole base unit at `level_ix`.
    #[must_use]
    pub fn price(&self, level_ix: i64) -> u128 {
        self.spec
            .tick_size
            .saturating_mul(u128::try_from(level_ix).unwrap_or(0))
    }

    /// Quote value of `amount` base units at `price`.
    #[must_use]
    pub fn notional(&self, amount: u128, price: u128) -> u128 {
        let scale = 10u128
            .checked_pow(u32::from(self.spec.base_decimals))
            .unwrap_or(u128::MAX);
        mul_div(amount, price, scale)
    }

    /// Fee on `notional` at `rate` millionths.
    #[must_use]
    pub fn fee(notional: u128, rate: u64) -> u128 {
        mul_div(notional, u128::from(rate), FEE_RATE_SCALE)
    }

    /// Top-of-book summary.
    #[must_use]
    pub fn bid_offer_state(&self) -> BidOfferState {
        let key = |tree: &BalancedIndexTree<Level>, id: Option<NodeId>| id.and_then(|id| tree.key(id));
        BidOfferState {
            market_id: self.spec.market_id.clone(),
            best_bid_ix: key(&self.bids, self.bids.last()),
            min_bid_ix: key(&self.bids, self.bids.first()),
            best_offer_ix: key(&self.offers, self.offers.first()),
            max_offer_ix: key(&self.offers, self.offers.last()),
        }
    }

    /// The market and its book, best levels first.
    #[must_use]
    pub fn dump(&self) -> MarketDump {
        let level = |(level_ix, level): (i64, &Level)| LevelDump {
            level_ix,
            orders: level
                .orders
                .iter()
                .map(|o| OrderDump {
                    guid: o.guid,
                    wallet: o.wallet.clone(),
                    quantity: o.quantity,
                    fee_rate: o.fee_rate,
                })
                .collect(),
        };
        MarketDump {
            spec: self.spec.clone(),
            bids: self.bids.iter_rev().map(level).collect(),
            offers: self.offers.iter().map(level).collect(),
        }
    }

    fn cancel_set(&self, batch: &OrderBatch) -> Vec<OrderGuid> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        if batch.cancel_all {
            for (guid, resting) in &self.orders {
                if resting.wallet == batch.wallet && seen.insert(*guid) {
                    out.push(*guid);
                }
            }
        }
        for guid in &batch.orders_to_cancel {
            if seen.insert(*guid) {
                out.push(*guid);
            }
        }
        out
    }

    /// Upper bound on the quote a market buy of `amount` pays, fees
    /// included, after `skip` units were taken by earlier buys of the same
    /// batch and without the offers in `canceled`.
    fn market_buy_cost(
        &self,
        amount: u128,
        skip: u128,
        taker_rate: u64,
        canceled: &BTreeMap<i64, u128>,
    ) -> u128 {
        let mut skip = skip;
        let mut remaining = amount;
        let mut cost = 0u128;
        for (level_ix, level) in &self.offers {
            if remaining == 0 {
                break;
            }
            let mut available = level
                .total_quantity
                .saturating_sub(canceled.get(&level_ix).copied().unwrap_or(0));
            let skipped = skip.min(available);
            skip -= skipped;
            available -= skipped;
            let take = remaining.min(available);
            if take == 0 {
                continue;
            }
            let notional = self.notional(take, self.price(level_ix));
            cost = cost
                .saturating_add(notional)
                .saturating_add(Self::fee(notional, taker_rate));
            remaining -= take;
        }
        cost
    }

    /// `true` if the wallet can afford the batch.
    ///
    /// `base_available` and `quote_available` are the wallet's balances
    /// minus what its orders in other markets reserve. Resting orders of
    /// this market count unless the batch cancels them.
    #[must_use]
    pub fn check_limits(
        &self,
        batch: &OrderBatch,
        fee_rates: FeeRates,
        base_available: u128,
        quote_available: u128,
    ) -> bool {
        if batch.orders_to_add.is_empty() {
            return true;
        }
        let cancels: BTreeSet<OrderGuid> = self
            .cancel_set(batch)
            .into_iter()
            .filter(|guid| {
                self.orders
                    .get(guid)
                    .is_some_and(|resting| resting.wallet == batch.wallet)
            })
            .collect();
        let mut canceled_offers: BTreeMap<i64, u128> = BTreeMap::new();
        for guid in &cancels {
            if let Some((resting, order)) = self.level_order(*guid) {
                if !resting.is_buy {
                    *canceled_offers.entry(resting.level_ix).or_insert(0) += order.quantity;
                }
            }
        }
        let (mut base_required, mut quote_required) = self.reserved(&batch.wallet, &cancels);

        let limit_rate = fee_rates.maker.max(fee_rates.taker);
        let mut bought = 0u128;
        for order in &batch.orders_to_add {
            match order.order_type {
                OrderType::LimitSell | OrderType::MarketSell => {
                    base_required = base_required.saturating_add(order.amount);
                }
                OrderType::LimitBuy => {
                    quote_required = quote_required.saturating_add(self.buy_cost(
                        order.amount,
                        order.level_ix,
                        limit_rate,
                    ));
                    bought = bought.saturating_add(order.amount);
                }
                OrderType::MarketBuy => {
                    quote_required = quote_required.saturating_add(self.market_buy_cost(
                        order.amount,
                        bought,
                        fee_rates.taker,
                        &canceled_offers,
                    ));
                    bought = bought.saturating_add(order.amount);
                }
            }
        }

        trace!(
            market = %self.spec.market_id,
            wallet = %batch.wallet,
            base_required,
            quote_required,
            base_available,
            quote_available,
            "limit check"
        );
        base_required <= base_available && quote_required <= quote_available
    }

    /// Shrinks the orders of `wallet` reserving `asset` until they reserve
    /// at most `limit`, and returns the changes with the amount still
    /// reserved.
    ///
    /// Sells keep the lowest levels, buys the highest; within a level the
    /// oldest order is kept first.
    pub fn auto_reduce(
        &mut self,
        wallet: &WalletAddress,
        asset: &Asset,
        limit: u128,
    ) -> (Vec<OrderChanged>, u128) {
        let is_buy = if *asset == self.spec.market_id.base_asset() {
            false
        } else if *asset == self.spec.market_id.quote_asset() {
            true
        } else {
            return (Vec::new(), 0);
        };
        let tree = if is_buy { &self.bids } else { &self.offers };
        let mut candidates: Vec<(i64, usize, OrderGuid, u128, u64)> = self
            .wallet_orders
            .get(wallet)
            .into_iter()
            .flatten()
            .filter_map(|guid| {
                let resting = self.orders.get(guid)?;
                if resting.is_buy != is_buy {
                    return None;
                }
                let level = tree.get(resting.level_ix)?;
                let (position, order) = level
                    .orders
                    .iter()
                    .enumerate()
                    .find(|(_, o)| o.guid == *guid)?;
                Some((resting.level_ix, position, *guid, order.quantity, order.fee_rate))
            })
            .collect();
        if is_buy {
            candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        } else {
            candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        }

        let mut kept = 0u128;
        let mut changes = Vec::new();
        for (level_ix, _, guid, quantity, fee_rate) in candidates {
            let left = limit.saturating_sub(kept);
            let (cost, reduced) = if is_buy {
                let cost = self.buy_cost(quantity, level_ix, fee_rate);
                if cost <= left {
                    (cost, None)
                } else {
                    let reduced = self.affordable_quantity(left, level_ix, fee_rate).min(quantity);
                    (self.buy_cost(reduced, level_ix, fee_rate), Some(reduced))
                }
            } else if quantity <= left {
                (quantity, None)
            } else {
                (left, Some(left))
            };
            kept += cost;
            if let Some(reduced) = reduced {
                self.set_order_quantity(guid, reduced);
                changes.push(OrderChanged {
                    guid,
                    disposition: OrderDisposition::AutoReduced,
                    new_quantity: Some(reduced),
                });
            }
        }
        changes.sort_by_key(|change| change.guid);
        if !changes.is_empty() {
            debug!(
                market = %self.spec.market_id,
                %wallet,
                %asset,
                limit,
                reduced = changes.len(),
                "orders auto-reduced"
            );
        }
        (changes, kept)
    }

    /// Largest base quantity whose cost at `level_ix`, fee included, fits
    /// in `budget`.
    fn affordable_quantity(&self, budget: u128, level_ix: i64, fee_rate: u64) -> u128 {
        let price = self.price(level_ix);
        if price == 0 {
            return 0;
        }
        let notional = mul_div(budget, FEE_RATE_SCALE, FEE_RATE_SCALE + u128::from(fee_rate));
        let scale = 10u128
            .checked_pow(u32::from(self.spec.base_decimals))
            .unwrap_or(u128::MAX);
        mul_div(notional, scale, price)
    }

    fn set_order_quantity(&mut self, guid: OrderGuid, quantity: u128) {
        if quantity == 0 {
            self.remove_order(guid);
            return;
        }
        let Some(resting) = self.orders.get(&guid) else {
            return;
        };
        let tree = if resting.is_buy { &mut self.bids } else { &mut self.offers };
        let Some(level) = tree.get_mut(resting.level_ix) else {
            return;
        };
        if let Some(order) = level.orders.iter_mut().find(|o| o.guid == guid) {
            level.total_quantity = level.total_quantity - order.quantity + quantity;
            order.quantity = quantity;
        }
    }

    /// Applies cancels, then adds, in batch order.
    pub fn apply_order_batch(&mut self, batch: &OrderBatch, fee_rates: FeeRates) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();

        for guid in self.cancel_set(batch) {
            let reason = match self.orders.get(&guid) {
                None => Some(RejectReason::DoesNotExist),
                Some(resting) if resting.wallet != batch.wallet => Some(RejectReason::NotForWallet),
                Some(_) => None,
            };
            match reason {
                Some(reason) => outcome.orders_rejected.push(OrderRejected { guid, reason }),
                None => {
                    self.remove_order(guid);
                    outcome.orders_changed.push(OrderChanged {
                        guid,
                        disposition: OrderDisposition::Canceled,
                        new_quantity: None,
                    });
                }
            }
        }

        for order in &batch.orders_to_add {
            let disposition = self.add_order(&batch.wallet, order, fee_rates, &mut outcome);
            trace!(
                market = %self.spec.market_id,
                guid = order.guid,
                ?disposition,
                "order added"
            );
        }
        outcome
    }

    fn is_below_min_fee(&self, order: &Order, fee_rates: FeeRates) -> bool {
        if self.spec.min_fee == 0 {
            return false;
        }
        let (rate, level_ix) = match order.order_type {
            OrderType::MarketBuy => (
                fee_rates.taker,
                self.offers.first().and_then(|id| self.offers.key(id)),
            ),
            OrderType::MarketSell => (
                fee_rates.taker,
                self.bids.last().and_then(|id| self.bids.key(id)),
            ),
            OrderType::LimitBuy | OrderType::LimitSell => (fee_rates.maker, Some(order.level_ix)),
        };
        let Some(level_ix) = level_ix else {
            return false;
        };
        if rate == 0 {
            return false;
        }
        let notional = self.notional(order.amount, self.price(level_ix));
        Self::fee(notional, rate) < self.spec.min_fee
    }

    fn add_order(
        &mut self,
        wallet: &WalletAddress,
        order: &Order,
        fee_rates: FeeRates,
        outcome: &mut BatchOutcome,
    ) -> OrderDisposition {
        let is_buy = order.order_type.is_buy();
        let is_market = order.order_type.is_market();
        let invalid = order.amount == 0
            || self.orders.contains_key(&order.guid)
            || (!is_market && order.level_ix <= 0);

        let disposition = if invalid || self.is_below_min_fee(order, fee_rates) {
            OrderDisposition::Rejected
        } else {
            let limit = (!is_market).then_some(order.level_ix);
            let fills = self.take(is_buy, order.amount, limit);
            let filled: u128 = fills.iter().map(|f| f.amount).sum();
            self.settle(wallet, order.guid, is_buy, fee_rates.taker, fills, outcome);

            let remaining = order.amount - filled;
            if remaining == 0 {
                OrderDisposition::Filled
            } else if is_market {
                if filled > 0 {
                    OrderDisposition::PartiallyFilled
                } else {
                    OrderDisposition::Rejected
                }
            } else if self.rest(wallet, order.guid, is_buy, order.level_ix, remaining, fee_rates.maker) {
                if filled > 0 {
                    OrderDisposition::PartiallyFilled
                } else {
                    OrderDisposition::Accepted
                }
            } else if filled > 0 {
                OrderDisposition::PartiallyFilled
            } else {
                OrderDisposition::Rejected
            }
        };

        let new_quantity = match disposition {
            OrderDisposition::PartiallyFilled => self.order_quantity(order.guid),
            _ => None,
        };
        outcome.orders_changed.push(OrderChanged {
            guid: order.guid,
            disposition,
            new_quantity,
        });
        disposition
    }

    /// Consumes liquidity from the opposite side up to `limit`.
    fn take(&mut self, is_buy: bool, amount: u128, limit: Option<i64>) -> Vec<Fill> {
        let mut fills = Vec::new();
        let mut remaining = amount;
        while remaining > 0 {
            let tree = if is_buy { &self.offers } else { &self.bids };
            let best = if is_buy { tree.first() } else { tree.last() };
            let Some((id, level_ix)) = best.and_then(|id| tree.key(id).map(|k| (id, k))) else {
                break;
            };
            let crosses = match limit {
                Some(limit) if is_buy => level_ix <= limit,
                Some(limit) => level_ix >= limit,
                None => true,
            };
            if !crosses {
                break;
            }
            let price = self.price(level_ix);

            let tree = if is_buy { &mut self.offers } else { &mut self.bids };
            let Some(level) = tree.value_mut(id) else {
                break;
            };
            while remaining > 0 {
                let Some(front) = level.orders.front_mut() else {
                    break;
                };
                let amount = remaining.min(front.quantity);
                front.quantity -= amount;
                level.total_quantity -= amount;
                remaining -= amount;
                fills.push(Fill {
                    maker_guid: front.guid,
                    maker_wallet: front.wallet.clone(),
                    maker_rate: front.fee_rate,
                    maker_remaining: front.quantity,
                    amount,
                    level_ix,
                    price,
                });
                if front.quantity == 0 {
                    level.orders.pop_front();
                }
            }
            if level.orders.is_empty() {
                if let Some(level) = tree.remove(level_ix) {
                    self.level_pool.release(level);
                }
            }
        }
        fills
    }

    fn settle(
        &mut self,
        taker_wallet: &WalletAddress,
        taker_guid: OrderGuid,
        taker_is_buy: bool,
        taker_rate: u64,
        fills: Vec<Fill>,
        outcome: &mut BatchOutcome,
    ) {
        let base = self.spec.market_id.base_asset();
        let quote = self.spec.market_id.quote_asset();
        for fill in fills {
            let notional = self.notional(fill.amount, fill.price);
            let taker_fee = Self::fee(notional, taker_rate);
            let maker_fee = Self::fee(notional, fill.maker_rate);

            let maker_done = fill.maker_remaining == 0;
            if maker_done {
                self.orders.remove(&fill.maker_guid);
                self.unindex(&fill.maker_wallet, fill.maker_guid);
            }
            outcome.orders_changed.push(OrderChanged {
                guid: fill.maker_guid,
                disposition: if maker_done {
                    OrderDisposition::Filled
                } else {
                    OrderDisposition::PartiallyFilled
                },
                new_quantity: (!maker_done).then_some(fill.maker_remaining),
            });

            let (buyer, buyer_fee, buy_guid, seller, seller_fee, sell_guid) = if taker_is_buy {
                (taker_wallet, taker_fee, taker_guid, &fill.maker_wallet, maker_fee, fill.maker_guid)
            } else {
                (&fill.maker_wallet, maker_fee, fill.maker_guid, taker_wallet, taker_fee, taker_guid)
            };

            let deltas = &mut outcome.balance_deltas;
            add_delta(deltas, buyer, &base, signed(fill.amount));
            add_delta(deltas, buyer, &quote, -signed(notional.saturating_add(buyer_fee)));
            add_delta(deltas, seller, &base, -signed(fill.amount));
            add_delta(deltas, seller, &quote, signed(notional.saturating_sub(seller_fee)));

            outcome.trades_created.push(TradeCreated {
                market_id: self.spec.market_id.clone(),
                buy_order_guid: buy_guid,
                sell_order_guid: sell_guid,
                amount: fill.amount,
                level_ix: fill.level_ix,
                price: fill.price,
                buyer_fee,
                seller_fee,
            });
        }
    }

    /// Places the remainder of a limit order; `false` if the level is full.
    fn rest(
        &mut self,
        wallet: &WalletAddress,
        guid: OrderGuid,
        is_buy: bool,
        level_ix: i64,
        quantity: u128,
        fee_rate: u64,
    ) -> bool {
        let max_orders = self.spec.max_orders_per_level as usize;
        let tree = if is_buy { &mut self.bids } else { &mut self.offers };
        let order = LevelOrder {
            guid,
            wallet: wallet.clone(),
            quantity,
            fee_rate,
        };
        match tree.get_mut(level_ix) {
            Some(level) => {
                if level.orders.len() >= max_orders {
                    return false;
                }
                level.orders.push_back(order);
                level.total_quantity = level.total_quantity.saturating_add(quantity);
            }
            None => {
                if max_orders == 0 {
                    return false;
                }
                let level = self.level_pool.borrow_with(|level| {
                    level.level_ix = level_ix;
                    level.total_quantity = quantity;
                    level.orders.push_back(order);
                });
                tree.insert(level_ix, level);
            }
        }
        self.orders.insert(
            guid,
            RestingOrder {
                wallet: wallet.clone(),
                is_buy,
                level_ix,
            },
        );
        self.wallet_orders
            .entry(wallet.clone())
            .or_default()
            .insert(guid);
        true
    }

    fn unindex(&mut self, wallet: &WalletAddress, guid: OrderGuid) {
        if let Some(guids) = self.wallet_orders.get_mut(wallet) {
            guids.remove(&guid);
            if guids.is_empty() {
                self.wallet_orders.remove(wallet);
            }
        }
    }

    fn remove_order(&mut self, guid: OrderGuid) -> Option<u128> {
        let resting = self.orders.remove(&guid)?;
        self.unindex(&resting.wallet, guid);
        let tree = if resting.is_buy { &mut self.bids } else { &mut self.offers };
        let level = tree.get_mut(resting.level_ix)?;
        let index = level.orders.iter().position(|o| o.guid == guid)?;
        let removed = level.orders.remove(index)?;
        level.total_quantity = level.total_quantity.saturating_sub(removed.quantity);
        if level.orders.is_empty() {
            if let Some(level) = tree.remove(resting.level_ix) {
                self.level_pool.release(level);
            }
        }
        Some(removed.quantity)
    }
}
