//! Independent read cursors over a durable log.

use super::error::JournalError;
use super::log::{DurableLog, LogPayload, LogRecord};
use std::sync::Arc;
use std::time::Duration;

/// A reader-owned cursor over a shared [`DurableLog`].
///
/// Every component that consumes a log owns its own tailer; tailers never
/// interfere with each other or with the writer. A named tailer can persist
/// its position as a reader checkpoint so a restart resumes instead of
/// rescanning.
pub struct LogTailer<R: LogPayload> {
    log: Arc<dyn DurableLog<R>>,
    name: Option<String>,
    next: u64,
    last_read: Option<u64>,
}

impl<R: LogPayload> LogTailer<R> {
    /// Anonymous tailer positioned at the start of the log.
    pub fn new(log: Arc<dyn DurableLog<R>>) -> Self {
        Self {
            log,
            name: None,
            next: 0,
            last_read: None,
        }
    }

    /// Named tailer resumed from its stored checkpoint.
    ///
    /// The checkpoint holds the next position to read; a missing checkpoint
    /// starts at 0.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the checkpoint exists but is unreadable.
    pub fn named(log: Arc<dyn DurableLog<R>>, name: &str) -> Result<Self, JournalError> {
        let next = log.load_checkpoint(name)?.unwrap_or(0);
        Ok(Self {
            log,
            name: Some(name.to_string()),
            next,
            last_read: None,
        })
    }

    /// Moves the cursor past every committed record.
    pub fn to_end(&mut self) -> &mut Self {
        self.next = self.log.next_position();
        self
    }

    /// Moves the cursor so that the next read returns `position`.
    pub fn seek(&mut self, position: u64) -> &mut Self {
        self.next = position;
        self
    }

    /// The position the next read will return.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.next
    }

    /// Position of the record most recently returned by this tailer.
    #[must_use]
    pub fn last_read_index(&self) -> Option<u64> {
        self.last_read
    }

    /// The checkpoint name, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the next record without blocking, or `None` at the end.
    ///
    /// A record that fails to decode still advances the cursor, so the
    /// caller decides how to handle the damaged position.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] for corrupt or undecodable records.
    pub fn try_next(&mut self) -> Result<Option<LogRecord<R>>, JournalError> {
        let position = self.next;
        match self.log.read(position) {
            Ok(Some(record)) => {
                self.next = position + 1;
                self.last_read = Some(position);
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.next = position + 1;
                self.last_read = Some(position);
                Err(e)
            }
        }
    }

    /// Waits up to `timeout` for the next record.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] for corrupt or undecodable records.
    pub fn next_timeout(&mut self, timeout: Duration) -> Result<Option<LogRecord<R>>, JournalError> {
        if !self.log.wait_for(self.next, timeout) {
            return Ok(None);
        }
        self.try_next()
    }

    /// Persists the current position under this tailer's name.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Checkpoint`] for an anonymous tailer.
    pub fn save_checkpoint(&self) -> Result<(), JournalError> {
        match &self.name {
            Some(name) => self.log.store_checkpoint(name, self.next),
            None => Err(JournalError::Checkpoint {
                name: String::new(),
                message: "anonymous tailer has no checkpoint".to_string(),
            }),
        }
    }

    /// Shared handle to the underlying log.
    #[must_use]
    pub fn log(&self) -> &Arc<dyn DurableLog<R>> {
        &self.log
    }
}

impl<R: LogPayload> std::fmt::Debug for LogTailer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTailer")
            .field("name", &self.name)
            .field("next", &self.next)
            .field("last_read", &self.last_read)
            .finish()
    }
}
