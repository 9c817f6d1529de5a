use criterion::{BenchmarkId, Criterion, Throughput};
use exchange_sequencer::prelude::*;
use exchange_sequencer::sequencer::SequencerState;
use std::hint::black_box;

fn seeded_state() -> SequencerState {
    let mut state = SequencerState::new(false);
    let setup = [
        CommandKind::AddMarket(MarketSpec {
            market_id: MarketId::from("BTC/USDC"),
            tick_size: 100,
            base_decimals: 2,
            quote_decimals: 2,
            max_orders_per_level: 10_000,
            min_fee: 0,
        }),
        CommandKind::SetFeeRates(FeeRates {
            maker: 1_000,
            taker: 2_000,
        }),
        CommandKind::ApplyBalanceBatch(BalanceBatch {
            deposits: vec![
                Deposit {
                    wallet: WalletAddress::from("maker"),
                    asset: Asset::from("BTC"),
                    amount: u64::MAX as u128,
                },
                Deposit {
                    wallet: WalletAddress::from("taker"),
                    asset: Asset::from("USDC"),
                    amount: u64::MAX as u128,
                },
            ],
            ..BalanceBatch::default()
        }),
    ];
    for kind in setup {
        let _ = state.apply(&Command::new(kind));
    }
    state
}

fn order(wallet: &str, guid: u64, order_type: OrderType, amount: u128, level_ix: i64) -> Command {
    Command::new(CommandKind::ApplyOrderBatch(OrderBatch {
        market_id: MarketId::from("BTC/USDC"),
        wallet: WalletAddress::from(wallet),
        orders_to_add: vec![Order {
            guid,
            order_type,
            amount,
            level_ix,
        }],
        orders_to_cancel: vec![],
        cancel_all: false,
    }))
}

/// Register state machine benchmarks.
pub fn register_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("Sequencer - process");

    for &resting in &[100u64, 1_000] {
        group.throughput(Throughput::Elements(resting));
        group.bench_with_input(BenchmarkId::new("rest_then_sweep", resting), &resting, |b, &n| {
            b.iter_with_setup(
                || {
                    let commands: Vec<Command> = (0..n)
                        .map(|i| {
                            order("maker", i + 1, OrderType::LimitSell, 100, 100 + (i % 50) as i64)
                        })
                        .collect();
                    (seeded_state(), commands)
                },
                |(mut state, commands)| {
                    for (position, command) in commands.iter().enumerate() {
                        black_box(Sequencer::process(&mut state, command, position as u64));
                    }
                    let sweep =
                        order("taker", u64::MAX, OrderType::MarketBuy, u128::from(n) * 100, 0);
                    black_box(Sequencer::process(&mut state, &sweep, n))
                },
            );
        });
    }

    group.finish();
}
