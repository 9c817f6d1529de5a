//! Mutable sequencer state and deterministic command application.

use super::error::SequencerError;
use super::market::{BalanceDeltas, Market, add_delta};
use super::types::{
    Asset, BalanceBatch, BalanceChange, BalanceDump, Command, CommandKind, Effects,
    FailedSettlement, FeeRates, LimitsUpdate, MarketCreated, MarketId, MarketMinFee, MarketSpec,
    OrderBatch, OrderChanged, StateDump, WalletAddress, WithdrawalCreated, WithdrawalFee,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, info, warn};

/// Everything the sequencer owns: balances, markets and fee configuration.
///
/// Only the sequencer thread mutates it. Application is deterministic so
/// replaying the input log from a snapshot reproduces the same results.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SequencerState {
    balances: BTreeMap<WalletAddress, BTreeMap<Asset, u128>>,
    markets: BTreeMap<MarketId, Market>,
    fee_rates: FeeRates,
    withdrawal_fees: BTreeMap<Asset, u128>,
    #[serde(default)]
    sandbox: bool,
}

impl SequencerState {
    /// Empty state; `sandbox` enables [`CommandKind::Reset`] and
    /// [`CommandKind::GetState`].
    #[must_use]
    pub fn new(sandbox: bool) -> Self {
        Self {
            sandbox,
            ..Self::default()
        }
    }

    /// `true` if sandbox-only commands are accepted.
    #[must_use]
    pub fn is_sandbox(&self) -> bool {
        self.sandbox
    }

    /// Enables or disables sandbox-only commands.
    pub fn set_sandbox(&mut self, sandbox: bool) {
        self.sandbox = sandbox;
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

    /// Part of the balance of `wallet` in `asset` reserved by its resting
    /// orders across every market.
    #[must_use]
    pub fn reserved(&self, wallet: &WalletAddress, asset: &Asset) -> u128 {
        self.reserved_outside(wallet, asset, None)
    }

    /// Balance of `wallet` in `asset` not reserved by resting orders.
    #[must_use]
    pub fn available(&self, wallet: &WalletAddress, asset: &Asset) -> u128 {
        self.balance(wallet, asset)
            .saturating_sub(self.reserved(wallet, asset))
    }

    fn reserved_outside(
        &self,
        wallet: &WalletAddress,
        asset: &Asset,
        skip: Option<&MarketId>,
    ) -> u128 {
        let none = BTreeSet::new();
        self.markets
            .iter()
            .filter(|(id, market)| Some(*id) != skip && market.has_orders_of(wallet))
            .map(|(id, market)| {
                let (base, quote) = market.reserved(wallet, &none);
                if id.base_asset() == *asset {
                    base
                } else if id.quote_asset() == *asset {
                    quote
                } else {
                    0
                }
            })
            .fold(0u128, u128::saturating_add)
    }

    /// A market by id.
    #[must_use]
    pub fn market(&self, id: &MarketId) -> Option<&Market> {
        self.markets.get(id)
    }

    /// Number of markets.
    #[must_use]
    pub fn market_count(&self) -> usize {
        self.markets.len()
    }

    /// Current fee rates.
    #[must_use]
    pub fn fee_rates(&self) -> FeeRates {
        self.fee_rates
    }

    /// Withdrawal fee for `asset`, 0 when unset.
    #[must_use]
    pub fn withdrawal_fee(&self, asset: &Asset) -> u128 {
        self.withdrawal_fees.get(asset).copied().unwrap_or(0)
    }

    /// Applies one command and returns what it changed.
    ///
    /// # Errors
    ///
    /// Returns the business [`SequencerError`] that refused the command.
    /// Refused commands leave the state untouched.
    pub fn apply(&mut self, command: &Command) -> Result<Effects, SequencerError> {
        match &command.kind {
            CommandKind::AddMarket(spec) => self.add_market(spec),
            CommandKind::ApplyOrderBatch(batch) => self.apply_order_batch(batch),
            CommandKind::ApplyBalanceBatch(batch) => Ok(self.apply_balance_batch(batch)),
            CommandKind::Reset => self.reset(),
            CommandKind::GetState => self.get_state(),
            CommandKind::SetFeeRates(rates) => self.set_fee_rates(*rates),
            CommandKind::SetWithdrawalFees(fees) => self.set_withdrawal_fees(fees),
            CommandKind::SetMarketMinFees(fees) => self.set_market_min_fees(fees),
        }
    }

    fn add_market(&mut self, spec: &MarketSpec) -> Result<Effects, SequencerError> {
        if let Some(existing) = self.markets.get(&spec.market_id) {
            if existing.matches_spec(spec) {
                debug!(market = %spec.market_id, "market already exists with same parameters");
                return Ok(Effects {
                    markets_created: vec![MarketCreated {
                        spec: existing.spec().clone(),
                    }],
                    ..Effects::default()
                });
            }
            return Err(SequencerError::MarketExists);
        }
        if spec.tick_size == 0 || !spec.market_id.as_str().contains('/') {
            return Err(SequencerError::ProcessingFailed {
                message: format!("invalid market parameters for {}", spec.market_id),
            });
        }
        info!(market = %spec.market_id, tick_size = spec.tick_size, "market created");
        self.markets
            .insert(spec.market_id.clone(), Market::new(spec.clone()));
        Ok(Effects {
            markets_created: vec![MarketCreated { spec: spec.clone() }],
            ..Effects::default()
        })
    }

    fn apply_order_batch(&mut self, batch: &OrderBatch) -> Result<Effects, SequencerError> {
        let fee_rates = self.fee_rates;
        let (base, quote) = (batch.market_id.base_asset(), batch.market_id.quote_asset());
        if !self.markets.contains_key(&batch.market_id) {
            return Err(SequencerError::UnknownMarket);
        }
        let base_available = self
            .balance(&batch.wallet, &base)
            .saturating_sub(self.reserved_outside(&batch.wallet, &base, Some(&batch.market_id)));
        let quote_available = self
            .balance(&batch.wallet, &quote)
            .saturating_sub(self.reserved_outside(&batch.wallet, &quote, Some(&batch.market_id)));

        let market = self
            .markets
            .get_mut(&batch.market_id)
            .ok_or(SequencerError::UnknownMarket)?;
        if !market.check_limits(batch, fee_rates, base_available, quote_available) {
            return Err(SequencerError::ExceedsLimit);
        }
        let outcome = market.apply_order_batch(batch, fee_rates);

        let balances_changed = self.apply_deltas(&outcome.balance_deltas)?;
        let mut orders_changed = outcome.orders_changed;
        orders_changed.extend(self.auto_reduce(&outcome.balance_deltas));

        let mut touched = BTreeSet::new();
        touched.insert((batch.wallet.clone(), batch.market_id.clone()));
        let limits_updated = self.limits(&outcome.balance_deltas, touched);
        let bid_offer_state = self
            .markets
            .get(&batch.market_id)
            .map(Market::bid_offer_state);
        Ok(Effects {
            orders_changed,
            orders_rejected: outcome.orders_rejected,
            trades_created: outcome.trades_created,
            balances_changed,
            limits_updated,
            bid_offer_state,
            ..Effects::default()
        })
    }

    fn apply_balance_batch(&mut self, batch: &BalanceBatch) -> Effects {
        let mut deltas = BalanceDeltas::new();
        let mut withdrawals_created = Vec::new();

        for deposit in &batch.deposits {
            self.credit(&deposit.wallet, &deposit.asset, deposit.amount);
            add_delta(&mut deltas, &deposit.wallet, &deposit.asset, to_signed(deposit.amount));
        }

        for withdrawal in &batch.withdrawals {
            let balance = self.balance(&withdrawal.wallet, &withdrawal.asset);
            let fee = self.withdrawal_fee(&withdrawal.asset);
            let amount = if withdrawal.amount == 0 {
                balance
            } else {
                withdrawal.amount
            };
            if amount > fee && amount <= balance {
                self.set_balance(&withdrawal.wallet, &withdrawal.asset, balance - amount);
                add_delta(&mut deltas, &withdrawal.wallet, &withdrawal.asset, -to_signed(amount));
                withdrawals_created.push(WithdrawalCreated {
                    external_guid: withdrawal.external_guid.clone(),
                    wallet: withdrawal.wallet.clone(),
                    asset: withdrawal.asset.clone(),
                    amount,
                    fee,
                });
            } else {
                debug!(
                    wallet = %withdrawal.wallet,
                    asset = %withdrawal.asset,
                    amount,
                    balance,
                    fee,
                    "withdrawal skipped"
                );
            }
        }

        for failed in &batch.failed_withdrawals {
            self.credit(&failed.wallet, &failed.asset, failed.amount);
            add_delta(&mut deltas, &failed.wallet, &failed.asset, to_signed(failed.amount));
        }

        for failed in &batch.failed_settlements {
            self.unwind_settlement(failed, &mut deltas);
        }

        let orders_changed = self.auto_reduce(&deltas);
        let limits_updated = self.limits(&deltas, BTreeSet::new());
        Effects {
            orders_changed,
            balances_changed: changes(&deltas),
            limits_updated,
            withdrawals_created,
            ..Effects::default()
        }
    }

    /// Reverses a trade: the seller gets the base back and returns the
    /// proceeds, the buyer returns the base and gets the cost back, fees
    /// included. Skipped whole when either debit exceeds a balance.
    fn unwind_settlement(&mut self, failed: &FailedSettlement, deltas: &mut BalanceDeltas) {
        let Some(market) = self.markets.get(&failed.market_id) else {
            debug!(market = %failed.market_id, "failed settlement for unknown market ignored");
            return;
        };
        let (base, quote) = (failed.market_id.base_asset(), failed.market_id.quote_asset());
        let notional = market.notional(failed.amount, market.price(failed.level_ix));
        let seller_proceeds = notional.saturating_sub(failed.seller_fee);
        let buyer_cost = notional.saturating_add(failed.buyer_fee);

        let seller_quote = self.balance(&failed.sell_wallet, &quote);
        let buyer_base = self.balance(&failed.buy_wallet, &base);
        let same_wallet = failed.sell_wallet == failed.buy_wallet;
        let covered = if same_wallet {
            buyer_base >= failed.amount && seller_quote.saturating_add(buyer_cost) >= seller_proceeds
        } else {
            buyer_base >= failed.amount && seller_quote >= seller_proceeds
        };
        if !covered {
            warn!(
                market = %failed.market_id,
                buyer = %failed.buy_wallet,
                seller = %failed.sell_wallet,
                amount = failed.amount,
                "failed settlement exceeds balances, skipped"
            );
            return;
        }

        self.set_balance(&failed.buy_wallet, &base, buyer_base - failed.amount);
        self.credit(&failed.buy_wallet, &quote, buyer_cost);
        self.credit(&failed.sell_wallet, &base, failed.amount);
        let seller_quote = self.balance(&failed.sell_wallet, &quote);
        self.set_balance(&failed.sell_wallet, &quote, seller_quote - seller_proceeds);

        add_delta(deltas, &failed.buy_wallet, &base, -to_signed(failed.amount));
        add_delta(deltas, &failed.buy_wallet, &quote, to_signed(buyer_cost));
        add_delta(deltas, &failed.sell_wallet, &base, to_signed(failed.amount));
        add_delta(deltas, &failed.sell_wallet, &quote, -to_signed(seller_proceeds));
    }

    /// Shrinks resting orders of every wallet whose balance went down until
    /// its reservations across all markets fit the new balance.
    fn auto_reduce(&mut self, deltas: &BalanceDeltas) -> Vec<OrderChanged> {
        let mut orders_changed = Vec::new();
        for ((wallet, asset), delta) in deltas {
            if *delta >= 0 {
                continue;
            }
            let balance = self.balance(wallet, asset);
            if self.reserved(wallet, asset) <= balance {
                continue;
            }
            let mut limit = balance;
            for market in self.markets.values_mut() {
                if !market.has_orders_of(wallet) {
                    continue;
                }
                let (changed, kept) = market.auto_reduce(wallet, asset, limit);
                limit = limit.saturating_sub(kept);
                orders_changed.extend(changed);
            }
        }
        orders_changed
    }

    /// Available amounts for every market of every changed asset, plus the
    /// `touched` wallet and market pairs.
    fn limits(
        &self,
        deltas: &BalanceDeltas,
        mut touched: BTreeSet<(WalletAddress, MarketId)>,
    ) -> Vec<LimitsUpdate> {
        for (wallet, asset) in deltas.keys() {
            for id in self.markets.keys() {
                if id.base_asset() == *asset || id.quote_asset() == *asset {
                    touched.insert((wallet.clone(), id.clone()));
                }
            }
        }
        touched
            .into_iter()
            .map(|(wallet, market_id)| LimitsUpdate {
                base: self.available(&wallet, &market_id.base_asset()),
                quote: self.available(&wallet, &market_id.quote_asset()),
                wallet,
                market_id,
            })
            .collect()
    }

    fn reset(&mut self) -> Result<Effects, SequencerError> {
        if !self.sandbox {
            return Err(SequencerError::UnknownRequest);
        }
        info!("sequencer state reset");
        *self = Self::new(true);
        Ok(Effects::default())
    }

    fn get_state(&self) -> Result<Effects, SequencerError> {
        if !self.sandbox {
            return Err(SequencerError::UnknownRequest);
        }
        Ok(Effects {
            state_dump: Some(self.dump()),
            ..Effects::default()
        })
    }

    fn set_fee_rates(&mut self, rates: FeeRates) -> Result<Effects, SequencerError> {
        if !rates.is_valid() {
            return Err(SequencerError::InvalidFeeRate);
        }
        self.fee_rates = rates;
        Ok(Effects {
            fee_rates_set: Some(rates),
            ..Effects::default()
        })
    }

    fn set_withdrawal_fees(&mut self, fees: &[WithdrawalFee]) -> Result<Effects, SequencerError> {
        if fees.is_empty() {
            return Err(SequencerError::InvalidWithdrawalFee);
        }
        for fee in fees {
            self.withdrawal_fees.insert(fee.asset.clone(), fee.fee);
        }
        Ok(Effects {
            withdrawal_fees_set: fees.to_vec(),
            ..Effects::default()
        })
    }

    fn set_market_min_fees(&mut self, fees: &[MarketMinFee]) -> Result<Effects, SequencerError> {
        if fees.is_empty() {
            return Err(SequencerError::InvalidMarketMinFee);
        }
        let mut applied = Vec::with_capacity(fees.len());
        for fee in fees {
            match self.markets.get_mut(&fee.market_id) {
                Some(market) => {
                    market.set_min_fee(fee.min_fee);
                    applied.push(fee.clone());
                }
                None => debug!(market = %fee.market_id, "min fee for unknown market ignored"),
            }
        }
        Ok(Effects {
            market_min_fees_set: applied,
            ..Effects::default()
        })
    }

    /// Full state as reported by [`CommandKind::GetState`].
    #[must_use]
    pub fn dump(&self) -> StateDump {
        let balances = self
            .balances
            .iter()
            .flat_map(|(wallet, assets)| {
                assets.iter().map(move |(asset, amount)| BalanceDump {
                    wallet: wallet.clone(),
                    asset: asset.clone(),
                    amount: *amount,
                })
            })
            .collect();
        StateDump {
            balances,
            markets: self.markets.values().map(Market::dump).collect(),
            fee_rates: self.fee_rates,
            withdrawal_fees: self
                .withdrawal_fees
                .iter()
                .map(|(asset, fee)| WithdrawalFee {
                    asset: asset.clone(),
                    fee: *fee,
                })
                .collect(),
        }
    }

    fn credit(&mut self, wallet: &WalletAddress, asset: &Asset, amount: u128) {
        let balance = self.balance(wallet, asset).saturating_add(amount);
        self.set_balance(wallet, asset, balance);
    }

    fn set_balance(&mut self, wallet: &WalletAddress, asset: &Asset, amount: u128) {
        if amount == 0 {
            if let Some(assets) = self.balances.get_mut(wallet) {
                assets.remove(asset);
                if assets.is_empty() {
                    self.balances.remove(wallet);
                }
            }
            return;
        }
        self.balances
            .entry(wallet.clone())
            .or_default()
            .insert(asset.clone(), amount);
    }

    /// Applies trade deltas. Limit checks guarantee every debit is
    /// covered; a delta that would overdraw is refused before any balance
    /// changes.
    fn apply_deltas(&mut self, deltas: &BalanceDeltas) -> Result<Vec<BalanceChange>, SequencerError> {
        let mut updated = Vec::with_capacity(deltas.len());
        for ((wallet, asset), delta) in deltas {
            let balance = self.balance(wallet, asset);
            let next = if *delta >= 0 {
                balance.checked_add(delta.unsigned_abs())
            } else {
                balance.checked_sub(delta.unsigned_abs())
            };
            let Some(next) = next else {
                error!(%wallet, %asset, balance, delta, "balance change out of range");
                return Err(SequencerError::ProcessingFailed {
                    message: format!("balance of {wallet} in {asset} cannot change by {delta}"),
                });
            };
            updated.push((wallet, asset, next));
        }
        for (wallet, asset, next) in updated {
            self.set_balance(wallet, asset, next);
        }
        Ok(changes(deltas))
    }
}

fn to_signed(value: u128) -> i128 {
    i128::try_from(value).unwrap_or(i128::MAX)
}

fn changes(deltas: &BalanceDeltas) -> Vec<BalanceChange> {
    deltas
        .iter()
        .filter(|(_, delta)| **delta != 0)
        .map(|((wallet, asset), delta)| BalanceChange {
            wallet: wallet.clone(),
            asset: asset.clone(),
            delta: *delta,
        })
        .collect()
}
