//! Integration tests for the blocking gateway against a running sequencer.

use crate::common::{balance, deposits, market_spec, place, setup};
use exchange_sequencer::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn concurrent_callers_each_receive_their_own_result() {
    let (_dir, config, logs) = setup();
    let mut sequencer = Sequencer::new(config.clone(), &logs).expect("sequencer");
    sequencer.start().expect("start");
    let gateway = Arc::new(Gateway::new(logs.clone(), config.gateway_timeout()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let gateway = Arc::clone(&gateway);
            thread::spawn(move || {
                let wallet = format!("wallet-{t}");
                let mut positions = Vec::new();
                for _ in 0..25 {
                    let command = Command::new(CommandKind::ApplyBalanceBatch(deposits(&[(
                        wallet.as_str(),
                        "USDC",
                        1,
                    )])));
                    let guid = command.guid.clone();
                    let response = gateway.submit(command);
                    assert!(response.success, "{response:?}");
                    let result = response.response.expect("result");
                    assert_eq!(result.guid, guid);
                    positions.push(result.position);
                }
                positions
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for position in handle.join().expect("caller thread") {
            assert!(seen.insert(position), "position {position} answered twice");
        }
    }
    assert_eq!(seen.len(), 100);
    assert_eq!(logs.output.next_position(), 100);

    sequencer.stop(Duration::from_secs(5)).expect("stop");
    let state = sequencer.state().expect("state");
    for t in 0..4 {
        assert_eq!(balance(state, &format!("wallet-{t}"), "USDC"), 25);
    }
}

#[test]
fn trade_through_gateway_reports_effects() {
    let (_dir, config, logs) = setup();
    let mut sequencer = Sequencer::new(config.clone(), &logs).expect("sequencer");
    sequencer.start().expect("start");
    let gateway = Gateway::new(logs.clone(), config.gateway_timeout());

    assert!(gateway.add_market(market_spec()).success);
    assert!(
        gateway
            .set_fee_rates(FeeRates {
                maker: 10_000,
                taker: 20_000,
            })
            .success
    );
    assert!(
        gateway
            .apply_balance_batch(deposits(&[("seller", "BTC", 100), ("buyer", "USDC", 1_000)]))
            .success
    );
    let resting = gateway.apply_order_batch(place("seller", 1, OrderType::LimitSell, 100, 5));
    let resting = resting.response.expect("result");
    assert!(resting.is_success());
    assert_eq!(resting.effects.orders_changed.len(), 1);

    let taker = gateway.apply_order_batch(place("buyer", 2, OrderType::MarketBuy, 100, 0));
    assert!(taker.success);
    let effects = taker.response.expect("result").effects;
    assert_eq!(effects.trades_created.len(), 1);
    let trade = &effects.trades_created[0];
    assert_eq!(trade.buy_order_guid, 2);
    assert_eq!(trade.sell_order_guid, 1);
    assert_eq!(trade.amount, 100);
    assert_eq!(trade.buyer_fee, 10);
    assert_eq!(trade.seller_fee, 5);

    sequencer.stop(Duration::from_secs(5)).expect("stop");
    let state = sequencer.state().expect("state");
    assert_eq!(balance(state, "buyer", "BTC"), 100);
    assert_eq!(balance(state, "buyer", "USDC"), 490);
    assert_eq!(balance(state, "seller", "USDC"), 495);
}

#[test]
fn business_error_is_a_response_not_a_transport_failure() {
    let (_dir, config, logs) = setup();
    let mut sequencer = Sequencer::new(config.clone(), &logs).expect("sequencer");
    sequencer.start().expect("start");
    let gateway = Gateway::new(logs.clone(), config.gateway_timeout());

    let response = gateway.set_fee_rates(FeeRates {
        maker: 2_000_000,
        taker: 0,
    });
    assert!(!response.success);
    assert!(response.error.is_none());
    assert_eq!(
        response.response.expect("result").error,
        Some(SequencerError::InvalidFeeRate)
    );

    let response = gateway.apply_order_batch(place("nobody", 9, OrderType::LimitBuy, 1, 1));
    assert_eq!(
        response.response.expect("result").error,
        Some(SequencerError::UnknownMarket)
    );

    sequencer.stop(Duration::from_secs(5)).expect("stop");
}

#[test]
fn sandbox_reset_and_state_dump() {
    let (_dir, config, logs) = setup();
    let config = config.with_sandbox(true);
    let mut sequencer = Sequencer::new(config.clone(), &logs).expect("sequencer");
    sequencer.start().expect("start");
    let gateway = Gateway::new(logs.clone(), config.gateway_timeout());

    gateway.add_market(market_spec());
    gateway.apply_balance_batch(deposits(&[("alice", "BTC", 7)]));
    let dump = gateway
        .get_state()
        .response
        .expect("result")
        .effects
        .state_dump
        .expect("dump");
    assert_eq!(dump.markets.len(), 1);
    assert_eq!(dump.balances.len(), 1);

    assert!(gateway.reset().success);
    let dump = gateway
        .get_state()
        .response
        .expect("result")
        .effects
        .state_dump
        .expect("dump");
    assert!(dump.markets.is_empty());
    assert!(dump.balances.is_empty());

    sequencer.stop(Duration::from_secs(5)).expect("stop");
}

#[test]
fn timeout_leaves_command_logged_for_a_later_sequencer() {
    let (_dir, config, logs) = setup();
    let gateway = Gateway::new(logs.clone(), Duration::from_millis(20));
    let response = gateway.set_fee_rates(FeeRates {
        maker: 5,
        taker: 6,
    });
    assert!(matches!(
        response.error,
        Some(GatewayError::Timeout { position: 0, .. })
    ));

    let mut sequencer = Sequencer::new(config, &logs).expect("sequencer");
    assert_eq!(sequencer.run_until_idle().expect("run"), 1);
    assert_eq!(
        sequencer.state().expect("state").fee_rates(),
        FeeRates { maker: 5, taker: 6 }
    );
}
