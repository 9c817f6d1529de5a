//! Integration tests for restart, replay and snapshots.

use crate::common::{balance, setup, trading_session};
use exchange_sequencer::prelude::*;
use exchange_sequencer::sequencer::{SEQUENCER_CHECKPOINT, SequencerState, SnapshotStore};

fn append_all(logs: &SequencerLogs, commands: &[Command]) {
    for command in commands {
        logs.input.append(command).expect("append");
    }
}

#[test]
fn restart_rebuilds_state_without_republishing() {
    let (_dir, config, logs) = setup();
    append_all(&logs, &trading_session());

    let mut first = Sequencer::new(config.clone(), &logs).expect("sequencer");
    first.run_until_idle().expect("run");
    let before = first.state().expect("state").dump();
    let published: Vec<SequencerResponse> = logs
        .output
        .read_from(0)
        .map(|r| r.expect("result").payload)
        .collect();
    drop(first);

    let mut second = Sequencer::new(config.with_strict_replay(true), &logs).expect("sequencer");
    assert_eq!(second.run_until_idle().expect("replay"), 5);
    assert_eq!(logs.output.next_position(), 5);
    assert_eq!(second.state().expect("state").dump(), before);

    let unchanged: Vec<SequencerResponse> = logs
        .output
        .read_from(0)
        .map(|r| r.expect("result").payload)
        .collect();
    assert_eq!(unchanged, published);
}

#[test]
fn commands_after_a_crash_are_answered_once() {
    let (_dir, config, logs) = setup();
    let session = trading_session();
    append_all(&logs, &session[..3]);
    Sequencer::new(config.clone(), &logs)
        .expect("sequencer")
        .run_until_idle()
        .expect("run");
    assert_eq!(logs.output.next_position(), 3);

    append_all(&logs, &session[3..]);
    let mut restarted = Sequencer::new(config, &logs).expect("sequencer");
    restarted.run_until_idle().expect("run");
    assert_eq!(logs.output.next_position(), 5);
    for position in 0..5 {
        let result = logs.output.read(position).expect("read").expect("result");
        assert_eq!(result.payload.position, position);
        assert_eq!(
            result.payload.guid,
            logs.input.read(position).expect("read").expect("command").payload.guid
        );
    }
    let state = restarted.state().expect("state");
    assert_eq!(balance(state, "buyer", "BTC"), 100);
}

#[test]
fn snapshot_checkpoint_shortens_replay() {
    let (_dir, config, logs) = setup();
    let config = config.with_snapshot_interval(2);
    append_all(&logs, &trading_session());
    Sequencer::new(config.clone(), &logs)
        .expect("sequencer")
        .run_until_idle()
        .expect("run");

    assert_eq!(
        logs.input.load_checkpoint(SEQUENCER_CHECKPOINT).expect("checkpoint"),
        Some(4)
    );
    let store = SnapshotStore::open(config.snapshot_dir()).expect("snapshots");
    assert_eq!(store.positions().expect("list"), vec![2, 4]);

    let mut restarted = Sequencer::new(config, &logs).expect("sequencer");
    assert_eq!(restarted.next_position(), 4);
    assert_eq!(restarted.run_until_idle().expect("run"), 1);
    let state = restarted.state().expect("state");
    assert_eq!(balance(state, "buyer", "USDC"), 490);
    assert_eq!(balance(state, "seller", "USDC"), 495);
}

#[test]
fn missing_snapshot_falls_back_to_full_replay() {
    let (_dir, config, logs) = setup();
    let config = config.with_snapshot_interval(2);
    append_all(&logs, &trading_session());
    let mut first = Sequencer::new(config.clone(), &logs).expect("sequencer");
    first.run_until_idle().expect("run");
    let expected = first.state().expect("state").dump();
    drop(first);

    std::fs::remove_dir_all(config.snapshot_dir()).expect("remove snapshots");

    let mut restarted = Sequencer::new(config, &logs).expect("sequencer");
    assert_eq!(restarted.next_position(), 0);
    assert_eq!(restarted.run_until_idle().expect("run"), 5);
    assert_eq!(logs.output.next_position(), 5);
    assert_eq!(restarted.state().expect("state").dump(), expected);
}

#[test]
fn snapshot_store_keeps_newest_two() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::open(dir.path()).expect("open");
    let mut state = SequencerState::new(false);
    for command in trading_session() {
        state.apply(&command).expect("apply");
    }

    for position in [10, 20, 30] {
        store.save(position, &state).expect("save");
    }
    assert_eq!(store.positions().expect("list"), vec![20, 30]);
    assert_eq!(store.latest().expect("latest"), Some(30));
    assert!(store.load(10).expect("load").is_none());

    let loaded = store.load(30).expect("load").expect("present");
    assert_eq!(loaded.dump(), state.dump());
    assert_eq!(balance(&loaded, "buyer", "BTC"), 100);
}

#[test]
fn tampered_snapshot_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SnapshotStore::open(dir.path()).expect("open");
    let mut state = SequencerState::new(false);
    state
        .apply(&Command::new(CommandKind::SetFeeRates(FeeRates {
            maker: 1,
            taker: 2,
        })))
        .expect("apply");
    let path = store.save(7, &state).expect("save");

    let text = std::fs::read_to_string(&path).expect("read");
    std::fs::write(&path, text.replace("\"taker\":2", "\"taker\":3")).expect("write");
    assert!(store.load(7).is_err());
}

#[test]
fn strict_replay_halts_when_outcome_differs() {
    let (_dir, config, logs) = setup();
    logs.input
        .append(&Command::new(CommandKind::Reset))
        .expect("append");
    Sequencer::new(config.clone().with_sandbox(true), &logs)
        .expect("sequencer")
        .run_until_idle()
        .expect("run");
    assert!(logs.output.read(0).expect("read").expect("result").payload.is_success());

    // Without sandbox the same reset is refused, so the replayed result differs.
    let mut strict = Sequencer::new(config.with_strict_replay(true), &logs).expect("sequencer");
    assert!(matches!(
        strict.run_until_idle(),
        Err(EngineError::ReplayMismatch { position: 0 })
    ));
}
