//! Integration tests for the Tokio gateway façade.

use crate::common::{deposits, market_spec, setup};
use exchange_sequencer::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_callers_share_one_gateway() {
    let (_dir, config, logs) = setup();
    let mut sequencer = Sequencer::new(config.clone(), &logs).expect("sequencer");
    sequencer.start().expect("start");
    let gateway = GatewayTokio::new(Arc::new(Gateway::new(
        logs.clone(),
        config.gateway_timeout(),
    )));

    assert!(gateway.add_market(market_spec()).await.success);

    let mut tasks = Vec::new();
    for t in 0..8 {
        let gateway = gateway.clone();
        tasks.push(tokio::spawn(async move {
            let wallet = format!("async-{t}");
            gateway
                .apply_balance_batch(deposits(&[(wallet.as_str(), "BTC", 10)]))
                .await
        }));
    }
    for task in tasks {
        let response = task.await.expect("task");
        assert!(response.success, "{response:?}");
    }

    let response = gateway
        .set_fee_rates(FeeRates {
            maker: 100,
            taker: 300,
        })
        .await;
    assert_eq!(
        response.response.expect("result").effects.fee_rates_set,
        Some(FeeRates {
            maker: 100,
            taker: 300,
        })
    );
    assert_eq!(gateway.gateway().timeout(), config.gateway_timeout());

    sequencer.stop(Duration::from_secs(5)).expect("stop");
    assert_eq!(logs.output.next_position(), 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn async_timeout_without_sequencer() {
    let (_dir, _config, logs) = setup();
    let gateway = GatewayTokio::new(Arc::new(Gateway::new(logs, Duration::from_millis(20))));
    let response = gateway.submit(Command::new(CommandKind::GetState)).await;
    assert!(!response.success);
    assert!(matches!(response.error, Some(GatewayError::Timeout { .. })));
}
