//! Integration tests for the response processor and result stores.

use crate::common::{setup, trading_session};
use exchange_sequencer::prelude::*;
use exchange_sequencer::sequencer::LedgerOrder;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Wraps a ledger and fails the first `failures` apply calls.
struct FlakyStore {
    inner: MemoryLedger,
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakyStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryLedger::new(),
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }
}

impl ResultStore for FlakyStore {
    fn last_processed_index(&self) -> Result<Option<u64>, StoreError> {
        self.inner.last_processed_index()
    }

    fn apply(
        &self,
        command: &Command,
        response: &SequencerResponse,
        read_index: u64,
    ) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Apply("injected failure".to_string()));
        }
        self.inner.apply(command, response, read_index)
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 4,
        retry_delay_ms: 1,
    }
}

fn sequenced_logs() -> (tempfile::TempDir, SequencerConfig, SequencerLogs) {
    let (dir, config, logs) = setup();
    for command in trading_session() {
        logs.input.append(&command).expect("append");
    }
    Sequencer::new(config.clone(), &logs)
        .expect("sequencer")
        .run_until_idle()
        .expect("run");
    (dir, config, logs)
}

#[test]
fn transient_failures_are_retried_and_committed_once() {
    let (_dir, _config, logs) = sequenced_logs();
    let store = Arc::new(FlakyStore::new(3));
    let mut processor =
        ResponseProcessor::new(&logs, Arc::clone(&store), fast_retry(), Duration::from_millis(1))
            .expect("processor");

    assert!(processor.step().expect("step"));
    assert_eq!(store.calls.load(Ordering::SeqCst), 4);
    let ledger = store.inner.snapshot().expect("ledger");
    assert_eq!(ledger.cursor(), Some(0));
    assert_eq!(ledger.applied_results, 1);
    assert_eq!(ledger.markets.len(), 1);

    assert_eq!(processor.run_until_idle().expect("drain"), 4);
    assert_eq!(processor.next_index(), 5);
    assert!(!processor.is_halted());
}

#[test]
fn exhausted_retries_halt_without_commit() {
    let (_dir, _config, logs) = sequenced_logs();
    let store = Arc::new(FlakyStore::new(5));
    let mut processor =
        ResponseProcessor::new(&logs, Arc::clone(&store), fast_retry(), Duration::from_millis(1))
            .expect("processor");

    match processor.step() {
        Err(ProcessorError::RetriesExhausted {
            read_index,
            attempts,
            ..
        }) => {
            assert_eq!(read_index, 0);
            assert_eq!(attempts, 5);
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert!(processor.is_halted());
    assert_eq!(store.calls.load(Ordering::SeqCst), 5);
    assert_eq!(store.inner.snapshot().expect("ledger").cursor(), None);

    assert!(processor.step().is_err());
    assert_eq!(store.calls.load(Ordering::SeqCst), 5);
}

#[test]
fn abnormal_stop_handler_fires_on_processor_thread() {
    let (_dir, _config, logs) = sequenced_logs();
    let store = Arc::new(FlakyStore::new(u32::MAX));
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut processor = ResponseProcessor::new(
        &logs,
        store,
        RetryPolicy {
            max_retries: 1,
            retry_delay_ms: 1,
        },
        Duration::from_millis(1),
    )
    .expect("processor")
    .on_abnormal_stop(Arc::new(move |e: &ProcessorError| {
        sink.lock().expect("lock").push(e.to_string());
    }));

    processor.start().expect("start");
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while processor.is_running() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(processor.is_halted());
    assert!(matches!(
        processor.stop(Duration::from_secs(5)),
        Err(ProcessorError::RetriesExhausted { attempts: 2, .. })
    ));
    assert_eq!(seen.lock().expect("lock").len(), 1);
}

#[test]
fn ledger_reflects_trading_session() {
    let (_dir, _config, logs) = sequenced_logs();
    let ledger = Arc::new(MemoryLedger::new());
    let mut processor = ResponseProcessor::new(
        &logs,
        Arc::clone(&ledger),
        fast_retry(),
        Duration::from_millis(1),
    )
    .expect("processor");
    assert_eq!(processor.run_until_idle().expect("drain"), 5);

    let state = ledger.snapshot().expect("ledger");
    assert_eq!(state.cursor(), Some(4));
    assert_eq!(state.trades.len(), 1);
    assert_eq!(
        state.balance(&WalletAddress::from("buyer"), &Asset::from("USDC")),
        490
    );
    assert_eq!(
        state.balance(&WalletAddress::from("seller"), &Asset::from("USDC")),
        495
    );
    let sell: &LedgerOrder = state.orders.get(&1).expect("sell order");
    assert_eq!(sell.remaining, 0);
    assert_eq!(state.fee_rates.taker, 20_000);
}

#[test]
fn file_ledger_resumes_after_reopen() {
    let (dir, _config, logs) = sequenced_logs();
    let path = dir.path().join("ledger").join("ledger.json");
    {
        let ledger = Arc::new(FileLedger::open(&path).expect("ledger"));
        let mut processor =
            ResponseProcessor::new(&logs, ledger, fast_retry(), Duration::from_millis(1))
                .expect("processor");
        assert!(processor.step().expect("step"));
        assert!(processor.step().expect("step"));
    }

    let ledger = Arc::new(FileLedger::open(&path).expect("reopen"));
    assert_eq!(ledger.last_processed_index().expect("cursor"), Some(1));
    let mut processor = ResponseProcessor::new(
        &logs,
        Arc::clone(&ledger),
        fast_retry(),
        Duration::from_millis(1),
    )
    .expect("processor");
    assert_eq!(processor.next_index(), 2);
    assert_eq!(processor.run_until_idle().expect("drain"), 3);
    let state = ledger.snapshot().expect("ledger");
    assert_eq!(state.applied_results, 5);
    assert_eq!(state.cursor(), Some(4));
}

#[test]
fn live_pipeline_reaches_the_ledger() {
    let (_dir, config, logs) = setup();
    let mut sequencer = Sequencer::new(config.clone(), &logs).expect("sequencer");
    sequencer.start().expect("start");
    let ledger = Arc::new(MemoryLedger::new());
    let mut processor = ResponseProcessor::new(
        &logs,
        Arc::clone(&ledger),
        config.retry,
        config.idle_wait(),
    )
    .expect("processor");
    processor.start().expect("start");

    let gateway = Gateway::new(logs.clone(), config.gateway_timeout());
    for command in trading_session() {
        assert!(gateway.submit(command).success);
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while processor.applied_count() < 5 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    processor.stop(Duration::from_secs(5)).expect("stop processor");
    sequencer.stop(Duration::from_secs(5)).expect("stop sequencer");

    let state = ledger.snapshot().expect("ledger");
    assert_eq!(state.cursor(), Some(4));
    assert_eq!(state.trades.len(), 1);
}
