//! Shared fixtures for the integration tests.

use exchange_sequencer::prelude::*;
use exchange_sequencer::sequencer::SequencerState;
use std::time::Duration;
use tempfile::TempDir;

pub const MARKET: &str = "BTC/USDC";

/// Logs under a fresh temporary directory with small segments.
pub fn setup() -> (TempDir, SequencerConfig, SequencerLogs) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = SequencerConfig::new(dir.path())
        .with_segment_size(64 * 1024)
        .with_gateway_timeout(Duration::from_secs(5));
    let logs = SequencerLogs::open(&config).expect("logs");
    (dir, config, logs)
}

/// One level step is 100 quote units per whole base unit; 100 base units
/// make one whole unit.
pub fn market_spec() -> MarketSpec {
    MarketSpec {
        market_id: MarketId::from(MARKET),
        tick_size: 100,
        base_decimals: 2,
        quote_decimals: 2,
        max_orders_per_level: 10,
        min_fee: 0,
    }
}

pub fn deposits(entries: &[(&str, &str, u128)]) -> BalanceBatch {
    BalanceBatch {
        deposits: entries
            .iter()
            .map(|(wallet, asset, amount)| Deposit {
                wallet: WalletAddress::from(*wallet),
                asset: Asset::from(*asset),
                amount: *amount,
            })
            .collect(),
        ..BalanceBatch::default()
    }
}

pub fn place(
    wallet: &str,
    guid: u64,
    order_type: OrderType,
    amount: u128,
    level_ix: i64,
) -> OrderBatch {
    OrderBatch {
        market_id: MarketId::from(MARKET),
        wallet: WalletAddress::from(wallet),
        orders_to_add: vec![Order {
            guid,
            order_type,
            amount,
            level_ix,
        }],
        orders_to_cancel: vec![],
        cancel_all: false,
    }
}

/// A market, fees, funded wallets and one crossing trade.
pub fn trading_session() -> Vec<Command> {
    vec![
        Command::new(CommandKind::AddMarket(market_spec())),
        Command::new(CommandKind::SetFeeRates(FeeRates {
            maker: 10_000,
            taker: 20_000,
        })),
        Command::new(CommandKind::ApplyBalanceBatch(deposits(&[
            ("seller", "BTC", 100),
            ("buyer", "USDC", 1_000),
        ]))),
        Command::new(CommandKind::ApplyOrderBatch(place(
            "seller",
            1,
            OrderType::LimitSell,
            100,
            5,
        ))),
        Command::new(CommandKind::ApplyOrderBatch(place(
            "buyer",
            2,
            OrderType::MarketBuy,
            100,
            0,
        ))),
    ]
}

pub fn balance(state: &SequencerState, wallet: &str, asset: &str) -> u128 {
    state.balance(&WalletAddress::from(wallet), &Asset::from(asset))
}
