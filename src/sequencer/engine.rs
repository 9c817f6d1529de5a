//! The single-writer sequencer loop.
//!
//! The loop tails the input log, applies each command to the
//! [`SequencerState`] and appends exactly one [`SequencerResponse`] to the
//! output log. Output index `i` always holds the result of input position
//! `i`, which is what lets a restart skip results that were already logged.

use super::config::SequencerConfig;
use super::error::{EngineError, SequencerError};
use super::journal::{DurableLog, FileLog, JournalError, LogTailer};
use super::snapshot::SnapshotStore;
use super::state::SequencerState;
use super::types::{Command, CommandType, Correlation, SequencerResponse};
use crate::utils::current_time_millis;
use crossbeam::utils::Backoff;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Name of the input-log checkpoint owned by the sequencer.
pub const SEQUENCER_CHECKPOINT: &str = "sequencer";

/// The three logs shared by the gateway, sequencer and response processor.
#[derive(Clone)]
pub struct SequencerLogs {
    /// Commands, in submission order.
    pub input: Arc<dyn DurableLog<Command>>,
    /// `{guid, position}` for every submitted command.
    pub correlation: Arc<dyn DurableLog<Correlation>>,
    /// One result per input position.
    pub output: Arc<dyn DurableLog<SequencerResponse>>,
}

impl SequencerLogs {
    /// Opens (creating if needed) the file-backed logs under
    /// `config.log_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if any log cannot be opened.
    pub fn open(config: &SequencerConfig) -> Result<Self, JournalError> {
        let input: FileLog<Command> =
            FileLog::open_with(config.input_dir(), config.segment_size, config.codec)?;
        let correlation: FileLog<Correlation> =
            FileLog::open_with(config.correlation_dir(), config.segment_size, config.codec)?;
        let output: FileLog<SequencerResponse> =
            FileLog::open_with(config.output_dir(), config.segment_size, config.codec)?;
        Ok(Self {
            input: Arc::new(input),
            correlation: Arc::new(correlation),
            output: Arc::new(output),
        })
    }
}

impl std::fmt::Debug for SequencerLogs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencerLogs")
            .field("input_next", &self.input.next_position())
            .field("correlation_next", &self.correlation.next_position())
            .field("output_next", &self.output.next_position())
            .finish()
    }
}

/// Observable state of the sequencer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SequencerPhase {
    /// Waiting for input.
    Idle = 0,
    /// Reading the next command.
    Reading = 1,
    /// Applying a command to the state.
    Applying = 2,
    /// Appending the result.
    Publishing = 3,
    /// Not running.
    Stopped = 4,
}

impl SequencerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SequencerPhase::Idle,
            1 => SequencerPhase::Reading,
            2 => SequencerPhase::Applying,
            3 => SequencerPhase::Publishing,
            _ => SequencerPhase::Stopped,
        }
    }
}

#[derive(Debug)]
struct Shared {
    stop: AtomicBool,
    phase: AtomicU8,
    applied: AtomicU64,
    next_position: AtomicU64,
}

impl Shared {
    fn set_phase(&self, phase: SequencerPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

/// Everything the loop owns; moved onto the sequencer thread while running.
struct SequencerCore {
    state: SequencerState,
    input: LogTailer<Command>,
    output: Arc<dyn DurableLog<SequencerResponse>>,
    snapshots: SnapshotStore,
    replay_until: u64,
    snapshot_interval: u64,
    since_snapshot: u64,
    strict_replay: bool,
}

impl SequencerCore {
    fn recover(config: &SequencerConfig, logs: &SequencerLogs) -> Result<Self, EngineError> {
        let snapshots = SnapshotStore::open(config.snapshot_dir())?;
        let mut input = LogTailer::named(Arc::clone(&logs.input), SEQUENCER_CHECKPOINT)?;
        let checkpoint = input.position();

        let mut state = match snapshots.load(checkpoint)? {
            Some(state) => {
                info!(position = checkpoint, "restored state from snapshot");
                state
            }
            None => {
                if checkpoint > 0 {
                    warn!(
                        position = checkpoint,
                        "no snapshot at checkpoint, replaying from the start"
                    );
                }
                input.seek(0);
                SequencerState::new(config.sandbox)
            }
        };
        state.set_sandbox(config.sandbox);

        let replay_until = logs.output.next_position();
        info!(
            resume = input.position(),
            replay_until,
            input_next = logs.input.next_position(),
            "sequencer recovered"
        );
        Ok(Self {
            state,
            input,
            output: Arc::clone(&logs.output),
            snapshots,
            replay_until,
            snapshot_interval: config.snapshot_interval,
            since_snapshot: 0,
            strict_replay: config.strict_replay,
        })
    }

    /// Processes one input record; `Ok(false)` when the input is exhausted.
    fn step(&mut self, shared: &Shared) -> Result<bool, EngineError> {
        shared.set_phase(SequencerPhase::Reading);
        let record = match self.input.try_next() {
            Ok(None) => return Ok(false),
            Ok(Some(record)) => Ok(record),
            Err(e) => Err(e),
        };

        shared.set_phase(SequencerPhase::Applying);
        let (response, validate) = match record {
            Ok(record) => {
                let command_type = record.payload.command_type();
                let response = Sequencer::process(&mut self.state, &record.payload, record.position);
                (response, command_type != CommandType::GetState)
            }
            Err(e) => {
                let position = self.input.last_read_index().unwrap_or(0);
                warn!(position, error = %e, "undecodable input record");
                let mut response = SequencerResponse::failed(
                    String::new(),
                    position,
                    SequencerError::ProcessingFailed {
                        message: e.to_string(),
                    },
                );
                response.created_at_ms = current_time_millis();
                (response, false)
            }
        };

        #[cfg(feature = "metrics")]
        {
            metrics::counter!("sequencer_commands_total").increment(1);
            if !response.is_success() {
                metrics::counter!("sequencer_errors_total").increment(1);
            }
        }

        shared.set_phase(SequencerPhase::Publishing);
        self.publish(response, validate)?;

        shared.applied.fetch_add(1, Ordering::Relaxed);
        shared
            .next_position
            .store(self.input.position(), Ordering::Release);

        self.since_snapshot += 1;
        if self.snapshot_interval > 0 && self.since_snapshot >= self.snapshot_interval {
            self.snapshot()?;
        }
        Ok(true)
    }

    fn publish(&mut self, response: SequencerResponse, validate: bool) -> Result<(), EngineError> {
        let position = response.position;
        if position < self.replay_until {
            if self.strict_replay && validate {
                let matches = self
                    .output
                    .read(position)?
                    .is_some_and(|logged| logged.payload.same_outcome(&response));
                if !matches {
                    error!(position, "replayed result differs from logged result");
                    return Err(EngineError::ReplayMismatch { position });
                }
            }
            trace!(position, "result already logged, skipping append");
            return Ok(());
        }
        let output_position = self.output.append(&response)?;
        if output_position != position {
            warn!(
                input_position = position,
                output_position, "output log out of step with input log"
            );
        }
        debug!(
            position,
            guid = %response.guid,
            success = response.is_success(),
            "result published"
        );
        Ok(())
    }

    fn snapshot(&mut self) -> Result<(), EngineError> {
        let position = self.input.position();
        self.snapshots.save(position, &self.state)?;
        self.input.save_checkpoint()?;
        self.since_snapshot = 0;
        Ok(())
    }

    fn run(mut self, shared: Arc<Shared>, idle_wait: Duration) -> (Self, Result<(), EngineError>) {
        info!(position = self.input.position(), "sequencer loop started");
        let backoff = Backoff::new();
        let result = loop {
            if shared.stop.load(Ordering::Acquire) {
                break Ok(());
            }
            match self.step(&shared) {
                Ok(true) => backoff.reset(),
                Ok(false) => {
                    shared.set_phase(SequencerPhase::Idle);
                    if backoff.is_completed() {
                        self.input.log().wait_for(self.input.position(), idle_wait);
                    } else {
                        backoff.snooze();
                    }
                }
                Err(e) => {
                    error!(error = %e, "sequencer loop stopped on fatal error");
                    break Err(e);
                }
            }
        };
        shared.set_phase(SequencerPhase::Stopped);
        info!(position = self.input.position(), "sequencer loop stopped");
        (self, result)
    }
}

type LoopHandle = JoinHandle<(SequencerCore, Result<(), EngineError>)>;

/// Owner of the sequencer loop and its thread.
///
/// # Example
///
/// ```rust,no_run
/// use exchange_sequencer::sequencer::{Sequencer, SequencerConfig, SequencerLogs};
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = SequencerConfig::new("/tmp/sequencer");
/// let logs = SequencerLogs::open(&config)?;
/// let mut sequencer = Sequencer::new(config, &logs)?;
/// sequencer.start()?;
/// // ... submit commands through a Gateway ...
/// sequencer.stop(Duration::from_secs(1))?;
/// # Ok(())
/// # }
/// ```
pub struct Sequencer {
    config: SequencerConfig,
    shared: Arc<Shared>,
    core: Option<SequencerCore>,
    handle: Option<LoopHandle>,
}

impl Sequencer {
    /// Recovers state from the newest checkpointed snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] if the checkpoint or snapshot is unreadable.
    pub fn new(config: SequencerConfig, logs: &SequencerLogs) -> Result<Self, EngineError> {
        let core = SequencerCore::recover(&config, logs)?;
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            phase: AtomicU8::new(SequencerPhase::Stopped as u8),
            applied: AtomicU64::new(0),
            next_position: AtomicU64::new(core.input.position()),
        });
        Ok(Self {
            config,
            shared,
            core: Some(core),
            handle: None,
        })
    }

    /// Applies one command, turning business errors and panics into a
    /// failed result. Never touches any log.
    pub fn process(
        state: &mut SequencerState,
        command: &Command,
        position: u64,
    ) -> SequencerResponse {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| state.apply(command)));
        let mut response = match outcome {
            Ok(Ok(effects)) => {
                let mut response = SequencerResponse::new(command.guid.clone(), position);
                response.effects = effects;
                response
            }
            Ok(Err(error)) => SequencerResponse::failed(command.guid.clone(), position, error),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic while applying command".to_string());
                error!(position, guid = %command.guid, %message, "command panicked");
                SequencerResponse::failed(
                    command.guid.clone(),
                    position,
                    SequencerError::ProcessingFailed { message },
                )
            }
        };
        response.created_at_ms = current_time_millis();
        response.processing_time_ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        trace!(
            position,
            command = %command.command_type(),
            success = response.is_success(),
            "command applied"
        );
        response
    }

    /// Spawns the loop on a thread named `sequencer`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyRunning`] or [`EngineError::Spawn`].
    pub fn start(&mut self) -> Result<(), EngineError> {
        let Some(core) = self.core.take() else {
            return Err(EngineError::AlreadyRunning);
        };
        self.shared.stop.store(false, Ordering::Release);
        self.shared.set_phase(SequencerPhase::Idle);
        let shared = Arc::clone(&self.shared);
        let idle_wait = self.config.idle_wait();
        let handle = std::thread::Builder::new()
            .name("sequencer".to_string())
            .spawn(move || core.run(shared, idle_wait))
            .map_err(|e| EngineError::Spawn(e.to_string()))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Requests a cooperative stop and waits up to `timeout` for the loop.
    ///
    /// The thread is never killed: on timeout it keeps running until it
    /// observes the stop flag, and a later `stop` can collect it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StopTimeout`], or the fatal error that ended
    /// the loop.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), EngineError> {
        self.shared.stop.store(true, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                self.handle = Some(handle);
                return Err(EngineError::StopTimeout {
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
            Err(_) => Err(EngineError::Spawn("sequencer thread panicked".to_string())),
        }
    }

    /// `true` while the loop thread is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Current loop phase.
    #[must_use]
    pub fn phase(&self) -> SequencerPhase {
        SequencerPhase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    /// Commands applied since this instance was created.
    #[must_use]
    pub fn applied_count(&self) -> u64 {
        self.shared.applied.load(Ordering::Relaxed)
    }

    /// Next input position the loop will read.
    #[must_use]
    pub fn next_position(&self) -> u64 {
        self.shared.next_position.load(Ordering::Acquire)
    }

    /// The state, while the loop is not running.
    #[must_use]
    pub fn state(&self) -> Option<&SequencerState> {
        self.core.as_ref().map(|core| &core.state)
    }

    /// Applies every pending command on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyRunning`] while the thread owns the
    /// loop, or any fatal loop error.
    pub fn run_until_idle(&mut self) -> Result<u64, EngineError> {
        let Some(core) = self.core.as_mut() else {
            return Err(EngineError::AlreadyRunning);
        };
        let mut applied = 0;
        while core.step(&self.shared)? {
            applied += 1;
        }
        self.shared.set_phase(SequencerPhase::Stopped);
        Ok(applied)
    }

    /// Writes a snapshot and advances the checkpoint now.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyRunning`] while the thread owns the
    /// loop, or the snapshot error.
    pub fn snapshot_now(&mut self) -> Result<(), EngineError> {
        match self.core.as_mut() {
            Some(core) => core.snapshot(),
            None => Err(EngineError::AlreadyRunning),
        }
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("phase", &self.phase())
            .field("applied", &self.applied_count())
            .field("next_position", &self.next_position())
            .field("running", &self.is_running())
            .finish()
    }
}
