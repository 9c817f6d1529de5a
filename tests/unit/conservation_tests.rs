//! Asset conservation across random command sequences.
//!
//! Trading only moves balances between wallets; the only ways value enters
//! or leaves are deposits, withdrawals and trade fees.

use exchange_sequencer::prelude::*;
use exchange_sequencer::sequencer::SequencerState;
use proptest::prelude::*;
use std::collections::BTreeMap;

const WALLETS: [&str; 3] = ["w0", "w1", "w2"];
const ASSETS: [&str; 3] = ["BTC", "ETH", "USDC"];
const MARKETS: [&str; 2] = ["BTC/USDC", "ETH/USDC"];

#[derive(Debug, Clone)]
enum Op {
    Deposit {
        wallet: usize,
        asset: usize,
        amount: u128,
    },
    Withdraw {
        wallet: usize,
        asset: usize,
        amount: u128,
    },
    Place {
        market: usize,
        wallet: usize,
        order_type: OrderType,
        amount: u128,
        level_ix: i64,
    },
    Cancel {
        market: usize,
        wallet: usize,
        pick: usize,
        all: bool,
    },
}

fn order_type() -> impl Strategy<Value = OrderType> {
    prop_oneof![
        Just(OrderType::LimitBuy),
        Just(OrderType::LimitSell),
        Just(OrderType::MarketBuy),
        Just(OrderType::MarketSell),
    ]
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        1 => (0..3usize, 0..3usize, 1u128..5_000).prop_map(|(wallet, asset, amount)| Op::Deposit {
            wallet,
            asset,
            amount
        }),
        1 => (0..3usize, 0..3usize, 0u128..3_000).prop_map(|(wallet, asset, amount)| Op::Withdraw {
            wallet,
            asset,
            amount
        }),
        4 => (0..2usize, 0..3usize, order_type(), 1u128..400, 1i64..20).prop_map(
            |(market, wallet, order_type, amount, level_ix)| Op::Place {
                market,
                wallet,
                order_type,
                amount,
                level_ix,
            }
        ),
        1 => (0..2usize, 0..3usize, any::<usize>(), any::<bool>()).prop_map(
            |(market, wallet, pick, all)| Op::Cancel {
                market,
                wallet,
                pick,
                all
            }
        ),
    ]
}

fn spec(market: &str) -> MarketSpec {
    MarketSpec {
        market_id: MarketId::from(market),
        tick_size: 100,
        base_decimals: 2,
        quote_decimals: 2,
        max_orders_per_level: 4,
        min_fee: 0,
    }
}

fn balances(state: &SequencerState) -> BTreeMap<(WalletAddress, Asset), u128> {
    state
        .dump()
        .balances
        .into_iter()
        .map(|b| ((b.wallet, b.asset), b.amount))
        .collect()
}

fn totals(state: &SequencerState) -> BTreeMap<Asset, u128> {
    let mut totals = BTreeMap::new();
    for ((_, asset), amount) in balances(state) {
        *totals.entry(asset).or_insert(0) += amount;
    }
    totals
}

fn command(op: &Op, next_guid: &mut u64, placed: &mut Vec<(usize, u64)>) -> CommandKind {
    match op {
        Op::Deposit {
            wallet,
            asset,
            amount,
        } => CommandKind::ApplyBalanceBatch(BalanceBatch {
            deposits: vec![Deposit {
                wallet: WalletAddress::from(WALLETS[*wallet]),
                asset: Asset::from(ASSETS[*asset]),
                amount: *amount,
            }],
            ..BalanceBatch::default()
        }),
        Op::Withdraw {
            wallet,
            asset,
            amount,
        } => CommandKind::ApplyBalanceBatch(BalanceBatch {
            withdrawals: vec![Withdrawal {
                wallet: WalletAddress::from(WALLETS[*wallet]),
                asset: Asset::from(ASSETS[*asset]),
                amount: *amount,
                external_guid: format!("wd-{next_guid}"),
            }],
            ..BalanceBatch::default()
        }),
        Op::Place {
            market,
            wallet,
            order_type,
            amount,
            level_ix,
        } => {
            *next_guid += 1;
            placed.push((*market, *next_guid));
            CommandKind::ApplyOrderBatch(OrderBatch {
                market_id: MarketId::from(MARKETS[*market]),
                wallet: WalletAddress::from(WALLETS[*wallet]),
                orders_to_add: vec![Order {
                    guid: *next_guid,
                    order_type: *order_type,
                    amount: *amount,
                    level_ix: *level_ix,
                }],
                orders_to_cancel: vec![],
                cancel_all: false,
            })
        }
        Op::Cancel {
            market,
            wallet,
            pick,
            all,
        } => {
            let guids: Vec<u64> = placed
                .iter()
                .filter(|(m, _)| m == market)
                .map(|(_, guid)| *guid)
                .collect();
            let orders_to_cancel = if *all || guids.is_empty() {
                vec![]
            } else {
                vec![guids[pick % guids.len()]]
            };
            CommandKind::ApplyOrderBatch(OrderBatch {
                market_id: MarketId::from(MARKETS[*market]),
                wallet: WalletAddress::from(WALLETS[*wallet]),
                orders_to_add: vec![],
                orders_to_cancel,
                cancel_all: *all,
            })
        }
    }
}

proptest! {
    #[test]
    fn balances_are_conserved(
        maker in 0u64..50_000,
        taker in 0u64..50_000,
        ops in prop::collection::vec(op(), 1..120),
    ) {
        let mut state = SequencerState::new(false);
        for market in MARKETS {
            state
                .apply(&Command::new(CommandKind::AddMarket(spec(market))))
                .expect("market");
        }
        state
            .apply(&Command::new(CommandKind::SetFeeRates(FeeRates { maker, taker })))
            .expect("fees");

        let mut expected: BTreeMap<Asset, u128> = BTreeMap::new();
        let mut next_guid = 0u64;
        let mut placed = Vec::new();

        for op in &ops {
            let before = balances(&state);
            let kind = command(op, &mut next_guid, &mut placed);
            let result = state.apply(&Command::new(kind));
            let after = balances(&state);

            match result {
                Err(_) => prop_assert_eq!(&before, &after),
                Ok(effects) => {
                    if let Op::Deposit { asset, amount, .. } = op {
                        *expected.entry(Asset::from(ASSETS[*asset])).or_insert(0) += amount;
                    }
                    for withdrawal in &effects.withdrawals_created {
                        let total = expected.entry(withdrawal.asset.clone()).or_insert(0);
                        *total -= withdrawal.amount;
                    }
                    for trade in &effects.trades_created {
                        let total = expected.entry(trade.market_id.quote_asset()).or_insert(0);
                        *total -= trade.buyer_fee + trade.seller_fee;
                    }

                    // published deltas are exactly what changed
                    let mut published: BTreeMap<(WalletAddress, Asset), i128> = BTreeMap::new();
                    for change in &effects.balances_changed {
                        published.insert((change.wallet.clone(), change.asset.clone()), change.delta);
                    }
                    for key in before.keys().chain(after.keys()) {
                        let moved = after.get(key).copied().unwrap_or(0) as i128
                            - before.get(key).copied().unwrap_or(0) as i128;
                        prop_assert_eq!(moved, published.get(key).copied().unwrap_or(0));
                    }

                    for limits in &effects.limits_updated {
                        prop_assert_eq!(
                            limits.base,
                            state.available(&limits.wallet, &limits.market_id.base_asset())
                        );
                        prop_assert_eq!(
                            limits.quote,
                            state.available(&limits.wallet, &limits.market_id.quote_asset())
                        );
                    }
                }
            }

            let totals = totals(&state);
            for asset in ASSETS {
                let asset = Asset::from(asset);
                prop_assert_eq!(
                    totals.get(&asset).copied().unwrap_or(0),
                    expected.get(&asset).copied().unwrap_or(0),
                    "{} not conserved after {:?}",
                    asset,
                    op
                );
            }
            for wallet in WALLETS {
                let wallet = WalletAddress::from(wallet);
                for asset in ASSETS {
                    let asset = Asset::from(asset);
                    prop_assert!(
                        state.reserved(&wallet, &asset) <= state.balance(&wallet, &asset),
                        "{} over-reserved in {} after {:?}",
                        wallet,
                        asset,
                        op
                    );
                }
            }
        }
    }
}
