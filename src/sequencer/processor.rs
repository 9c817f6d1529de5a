//! Crash-safe replay of sequencer results into a [`ResultStore`].
//!
//! The processor tails the output log from the store's cursor, reads the
//! originating command from the input log and hands both to the store,
//! which commits effects and cursor together. A result that keeps failing
//! halts the processor rather than being skipped.

use super::config::RetryPolicy;
use super::engine::SequencerLogs;
use super::error::ProcessorError;
use super::journal::LogTailer;
use super::store::ResultStore;
use super::types::{Command, SequencerResponse};
use crossbeam::utils::Backoff;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Callback fired when the processor thread stops on a fatal error.
pub type AbnormalStopHandler = Arc<dyn Fn(&ProcessorError) + Send + Sync>;

#[derive(Debug, Default)]
struct Shared {
    stop: AtomicBool,
    applied: AtomicU64,
    next_index: AtomicU64,
    halted: AtomicBool,
}

struct ProcessorCore<S: ResultStore> {
    store: Arc<S>,
    output: LogTailer<SequencerResponse>,
    input: LogTailer<Command>,
    retry: RetryPolicy,
}

impl<S: ResultStore> ProcessorCore<S> {
    fn apply_once(&mut self, read_index: u64) -> Result<(), ProcessorError> {
        self.output.seek(read_index);
        let Some(result) = self.output.try_next()? else {
            return Err(ProcessorError::MissingCommand {
                position: read_index,
            });
        };
        let response = result.payload;

        self.input.seek(response.position);
        let Some(command) = self.input.try_next()? else {
            return Err(ProcessorError::MissingCommand {
                position: response.position,
            });
        };
        self.store.apply(&command.payload, &response, read_index)?;
        Ok(())
    }

    fn step(&mut self, shared: &Shared) -> Result<bool, ProcessorError> {
        if shared.halted.load(Ordering::Acquire) {
            return Err(ProcessorError::RetriesExhausted {
                read_index: shared.next_index.load(Ordering::Acquire),
                attempts: 0,
                last_error: "processor halted".to_string(),
            });
        }
        let read_index = shared.next_index.load(Ordering::Acquire);
        if read_index >= self.output.log().next_position() {
            return Ok(false);
        }

        let attempts = self.retry.max_attempts();
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.apply_once(read_index) {
                Ok(()) => {
                    shared.next_index.store(read_index + 1, Ordering::Release);
                    shared.applied.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "metrics")]
                    metrics::counter!("processor_results_applied_total").increment(1);
                    debug!(read_index, attempt, "result applied");
                    return Ok(true);
                }
                Err(e) => {
                    warn!(read_index, attempt, max = attempts, error = %e, "apply failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        #[cfg(feature = "metrics")]
                        metrics::counter!("processor_retries_total").increment(1);
                        std::thread::sleep(self.retry.retry_delay());
                    }
                }
            }
        }

        shared.halted.store(true, Ordering::Release);
        error!(read_index, attempts, "retries exhausted, response processor halted");
        Err(ProcessorError::RetriesExhausted {
            read_index,
            attempts,
            last_error,
        })
    }

    fn run(
        mut self,
        shared: Arc<Shared>,
        idle_wait: Duration,
        on_abnormal_stop: Option<AbnormalStopHandler>,
    ) -> (Self, Result<(), ProcessorError>) {
        info!(
            next_index = shared.next_index.load(Ordering::Acquire),
            "response processor started"
        );
        let backoff = Backoff::new();
        let result = loop {
            if shared.stop.load(Ordering::Acquire) {
                break Ok(());
            }
            match self.step(&shared) {
                Ok(true) => backoff.reset(),
                Ok(false) => {
                    if backoff.is_completed() {
                        let next = shared.next_index.load(Ordering::Acquire);
                        self.output.log().wait_for(next, idle_wait);
                    } else {
                        backoff.snooze();
                    }
                }
                Err(e) => {
                    if let Some(handler) = &on_abnormal_stop {
                        handler(&e);
                    }
                    break Err(e);
                }
            }
        };
        info!(
            next_index = shared.next_index.load(Ordering::Acquire),
            "response processor stopped"
        );
        (self, result)
    }
}

type ProcessorHandle<S> = JoinHandle<(ProcessorCore<S>, Result<(), ProcessorError>)>;

/// Replays the output log into a store, on the caller's thread via
/// [`step`](Self::step) or on a dedicated thread via [`start`](Self::start).
pub struct ResponseProcessor<S: ResultStore + 'static> {
    shared: Arc<Shared>,
    core: Option<ProcessorCore<S>>,
    handle: Option<ProcessorHandle<S>>,
    idle_wait: Duration,
    on_abnormal_stop: Option<AbnormalStopHandler>,
}

impl<S: ResultStore + 'static> ResponseProcessor<S> {
    /// Positions the processor after the store's cursor.
    ///
    /// A cursor beyond the end of the output log is clamped to its last
    /// index; without a cursor processing starts at index 0.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::Store`] if the cursor cannot be read.
    pub fn new(
        logs: &SequencerLogs,
        store: Arc<S>,
        retry: RetryPolicy,
        idle_wait: Duration,
    ) -> Result<Self, ProcessorError> {
        let cursor = store.last_processed_index()?;
        let last = logs.output.last_position();
        let clamped = match (cursor, last) {
            (Some(cursor), Some(last)) if cursor > last => {
                warn!(cursor, last, "cursor beyond output log, clamping");
                Some(last)
            }
            (Some(_), None) => {
                warn!(?cursor, "cursor set but output log is empty");
                None
            }
            (cursor, _) => cursor,
        };
        let start = clamped.map_or(0, |c| c + 1);
        info!(?cursor, start, "response processor positioned");

        let shared = Arc::new(Shared {
            next_index: AtomicU64::new(start),
            ..Shared::default()
        });
        Ok(Self {
            shared,
            core: Some(ProcessorCore {
                store,
                output: LogTailer::new(Arc::clone(&logs.output)),
                input: LogTailer::new(Arc::clone(&logs.input)),
                retry,
            }),
            handle: None,
            idle_wait,
            on_abnormal_stop: None,
        })
    }

    /// Registers a callback for fatal errors on the processor thread.
    #[must_use]
    pub fn on_abnormal_stop(mut self, handler: AbnormalStopHandler) -> Self {
        self.on_abnormal_stop = Some(handler);
        self
    }

    /// Applies the next result, retrying per the policy.
    ///
    /// Returns `Ok(false)` when no result is pending.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::RetriesExhausted`] once every attempt
    /// failed (and on every call after that), or
    /// [`ProcessorError::AlreadyRunning`] while the thread owns the loop.
    pub fn step(&mut self) -> Result<bool, ProcessorError> {
        match self.core.as_mut() {
            Some(core) => core.step(&self.shared),
            None => Err(ProcessorError::AlreadyRunning),
        }
    }

    /// Applies every pending result on the calling thread.
    ///
    /// # Errors
    ///
    /// See [`step`](Self::step).
    pub fn run_until_idle(&mut self) -> Result<u64, ProcessorError> {
        let mut applied = 0;
        while self.step()? {
            applied += 1;
        }
        Ok(applied)
    }

    /// Spawns the loop on a thread named `sequencer_response_processor`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::AlreadyRunning`] or
    /// [`ProcessorError::Spawn`].
    pub fn start(&mut self) -> Result<(), ProcessorError> {
        let Some(core) = self.core.take() else {
            return Err(ProcessorError::AlreadyRunning);
        };
        self.shared.stop.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let idle_wait = self.idle_wait;
        let handler = self.on_abnormal_stop.clone();
        let handle = std::thread::Builder::new()
            .name("sequencer_response_processor".to_string())
            .spawn(move || core.run(shared, idle_wait, handler))
            .map_err(|e| ProcessorError::Spawn(e.to_string()))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Requests a cooperative stop and waits up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessorError::StopTimeout`], or the fatal error that
    /// ended the loop.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), ProcessorError> {
        self.shared.stop.store(true, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                self.handle = Some(handle);
                return Err(ProcessorError::StopTimeout {
                    millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        match handle.join() {
            Ok((core, result)) => {
                self.core = Some(core);
                result
            }
            Err(_) => Err(ProcessorError::Spawn(
                "response processor thread panicked".to_string(),
            )),
        }
    }

    /// `true` while the processor thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// `true` after retries were exhausted.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::Acquire)
    }

    /// Results applied by this instance.
    #[must_use]
    pub fn applied_count(&self) -> u64 {
        self.shared.applied.load(Ordering::Relaxed)
    }

    /// Output-log index of the next result to apply.
    #[must_use]
    pub fn next_index(&self) -> u64 {
        self.shared.next_index.load(Ordering::Acquire)
    }
}

impl<S: ResultStore + 'static> Drop for ResponseProcessor<S> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
    }
}

impl<S: ResultStore + 'static> std::fmt::Debug for ResponseProcessor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseProcessor")
            .field("next_index", &self.next_index())
            .field("applied", &self.applied_count())
            .field("halted", &self.is_halted())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::config::SequencerConfig;
    use crate::sequencer::engine::Sequencer;
    use crate::sequencer::store::MemoryLedger;
    use crate::sequencer::types::{CommandKind, FeeRates};

    fn setup(commands: u64) -> (tempfile::TempDir, SequencerLogs) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = SequencerConfig::new(dir.path()).with_segment_size(64 * 1024);
        let logs = SequencerLogs::open(&config).expect("logs");
        for maker in 0..commands {
            logs.input
                .append(&Command::new(CommandKind::SetFeeRates(FeeRates { maker, taker: 0 })))
                .expect("append");
        }
        Sequencer::new(config, &logs)
            .expect("sequencer")
            .run_until_idle()
            .expect("run");
        (dir, logs)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 4,
            retry_delay_ms: 1,
        }
    }

    #[test]
    fn test_applies_every_result_once() {
        let (_dir, logs) = setup(3);
        let ledger = Arc::new(MemoryLedger::new());
        let mut processor =
            ResponseProcessor::new(&logs, Arc::clone(&ledger), fast_retry(), Duration::from_millis(5))
                .expect("processor");
        assert_eq!(processor.run_until_idle().expect("run"), 3);
        let state = ledger.snapshot().expect("state");
        assert_eq!(state.cursor(), Some(2));
        assert_eq!(state.fee_rates.maker, 2);

        let mut resumed =
            ResponseProcessor::new(&logs, Arc::clone(&ledger), fast_retry(), Duration::from_millis(5))
                .expect("processor");
        assert_eq!(resumed.next_index(), 3);
        assert!(!resumed.step().expect("step"));
    }

    #[test]
    fn test_threaded_processor_catches_up() {
        let (_dir, logs) = setup(4);
        let ledger = Arc::new(MemoryLedger::new());
        let mut processor =
            ResponseProcessor::new(&logs, Arc::clone(&ledger), fast_retry(), Duration::from_millis(5))
                .expect("processor");
        processor.start().expect("start");
        let deadline = Instant::now() + Duration::from_secs(5);
        while processor.next_index() < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        processor.stop(Duration::from_secs(5)).expect("stop");
        assert_eq!(ledger.snapshot().expect("state").applied_results, 4);
    }
}
