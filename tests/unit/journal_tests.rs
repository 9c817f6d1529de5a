//! Integration tests for the durable logs and tailers.

use exchange_sequencer::prelude::*;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn open(dir: &std::path::Path) -> FileLog<String> {
    FileLog::open_with(dir, 1024, LogCodec::Json).expect("open")
}

#[test]
fn positions_survive_reopen_across_segments() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let log = open(dir.path());
        for i in 0..100u64 {
            assert_eq!(log.append(&format!("record-{i}")).expect("append"), i);
        }
        assert!(log.segment_count() > 1);
    }

    let log = open(dir.path());
    assert_eq!(log.next_position(), 100);
    log.verify_integrity().expect("intact");
    assert_eq!(log.append(&"after-reopen".to_string()).expect("append"), 100);
    let record = log.read(57).expect("read").expect("present");
    assert_eq!(record.position, 57);
    assert_eq!(record.payload, "record-57");
    let all: Vec<u64> = log
        .read_from(0)
        .map(|r| r.expect("record").position)
        .collect();
    assert_eq!(all, (0..=100).collect::<Vec<_>>());
}

#[test]
fn concurrent_appenders_get_dense_positions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log: Arc<dyn DurableLog<String>> = Arc::new(open(dir.path()));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                (0..50)
                    .map(|i| log.append(&format!("{t}-{i}")).expect("append"))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut positions: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().expect("appender"))
        .collect();
    positions.sort_unstable();
    assert_eq!(positions, (0..200).collect::<Vec<_>>());
}

#[test]
fn named_tailer_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log: Arc<dyn DurableLog<String>> = Arc::new(open(dir.path()));
    for i in 0..5 {
        log.append(&i.to_string()).expect("append");
    }

    let mut tailer = LogTailer::named(Arc::clone(&log), "reader").expect("tailer");
    assert_eq!(tailer.position(), 0);
    tailer.try_next().expect("read").expect("record");
    tailer.try_next().expect("read").expect("record");
    tailer.save_checkpoint().expect("checkpoint");
    drop(tailer);

    let mut resumed = LogTailer::named(Arc::clone(&log), "reader").expect("tailer");
    assert_eq!(resumed.position(), 2);
    assert_eq!(resumed.try_next().expect("read").expect("record").payload, "2");
    assert_eq!(resumed.last_read_index(), Some(2));

    let other = LogTailer::named(log, "someone-else").expect("tailer");
    assert_eq!(other.position(), 0);
}

#[test]
fn tailer_wakes_on_append_from_another_thread() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log: Arc<dyn DurableLog<String>> = Arc::new(open(dir.path()));
    let mut tailer = LogTailer::new(Arc::clone(&log));
    tailer.to_end();
    assert!(tailer.next_timeout(Duration::from_millis(10)).expect("wait").is_none());

    let writer = Arc::clone(&log);
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        writer.append(&"late".to_string()).expect("append");
    });
    let record = tailer
        .next_timeout(Duration::from_secs(5))
        .expect("wait")
        .expect("record");
    assert_eq!(record.payload, "late");
    handle.join().expect("writer");
}
