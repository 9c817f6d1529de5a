//! Memory-mapped file log implementation.
//!
//! [`FileLog`] persists payloads to append-only, memory-mapped segment
//! files. Each segment is pre-allocated to a configurable size (default
//! 64 MB) and rotated when full. Positions are assigned by the log itself.
//!
//! # On-Disk Record Format (little-endian)
//!
//! ```text
//! [4 bytes: entry_length][8 bytes: position][8 bytes: timestamp_ns]
//! [N bytes: payload][4 bytes: CRC32]
//! ```
//!
//! - `entry_length` is the number of bytes after itself (20 + N).
//! - CRC32 covers `position ‖ timestamp_ns ‖ payload`.
//!
//! # Segment Files
//!
//! Segments are named `segment-{start_position:020}.log`. On open, every
//! segment is scanned and an in-memory offset index is rebuilt. A torn
//! record at the tail of the newest segment (crash mid-append) is discarded
//! and its bytes zeroed; corruption anywhere else is an error.

use super::checkpoint::CheckpointStore;
use super::codec::LogCodec;
use super::error::JournalError;
use super::log::{
    DurableLog, ENTRY_CRC_SIZE, ENTRY_HEADER_SIZE, LogPayload, LogReadIter, LogRecord,
};
use crate::utils::current_time_nanos;
use memmap2::{Mmap, MmapMut};
use std::fs::{self, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default segment size in bytes (64 MB).
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024 * 1024;

/// Manages writing to the active memory-mapped segment file.
struct SegmentWriter {
    mmap: MmapMut,
    write_pos: usize,
    capacity: usize,
    path: PathBuf,
}

impl SegmentWriter {
    /// Create a new zero-filled segment file of `capacity` bytes.
    fn create(path: &Path, capacity: usize) -> Result<Self, JournalError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| JournalError::io_at(e, path))?;

        file.set_len(capacity as u64)
            .map_err(|e| JournalError::io_at(e, path))?;

        // SAFETY: the segment file is owned by this log and is never
        // truncated while the writable mapping is alive.
        let mmap = unsafe { MmapMut::map_mut(&file).map_err(|e| JournalError::io_at(e, path))? };

        Ok(Self {
            mmap,
            write_pos: 0,
            capacity,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing segment for appending at `write_pos`.
    ///
    /// Everything after `write_pos` is zeroed so that a discarded torn
    /// record can never be mistaken for data on the next scan.
    fn open_existing(path: &Path, write_pos: usize) -> Result<Self, JournalError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| JournalError::io_at(e, path))?;

        // SAFETY: see `create`.
        let mut mmap =
            unsafe { MmapMut::map_mut(&file).map_err(|e| JournalError::io_at(e, path))? };
        let capacity = mmap.len();

        if write_pos < capacity && mmap[write_pos..].iter().any(|b| *b != 0) {
            mmap[write_pos..].fill(0);
            mmap.flush().map_err(|e| JournalError::io_at(e, path))?;
        }

        Ok(Self {
            mmap,
            write_pos,
            capacity,
            path: path.to_path_buf(),
        })
    }

    #[inline]
    fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.write_pos)
    }

    /// Copy `entry_bytes` at the write position and flush that range.
    fn write_entry(&mut self, entry_bytes: &[u8]) -> Result<usize, JournalError> {
        let start = self.write_pos;
        let end = start
            .checked_add(entry_bytes.len())
            .filter(|end| *end <= self.capacity)
            .ok_or(JournalError::EntryTooLarge {
                entry_bytes: entry_bytes.len(),
                segment_size: self.capacity,
            })?;

        self.mmap[start..end].copy_from_slice(entry_bytes);
        self.mmap
            .flush_range(start, entry_bytes.len())
            .map_err(|e| JournalError::io_at(e, &self.path))?;
        self.write_pos = end;
        Ok(start)
    }
}

/// Read side of one segment: a shared read-only mapping plus the byte
/// offset of every committed record in it.
struct SegmentIndex {
    start: u64,
    map: Mmap,
    offsets: Vec<usize>,
}

impl SegmentIndex {
    fn contains(&self, position: u64) -> bool {
        position >= self.start && position - self.start < self.offsets.len() as u64
    }
}

/// A memory-mapped, append-only log of `R` payloads with segment rotation.
///
/// # Thread Safety
///
/// Appends are serialised by an internal [`Mutex`]. Readers never take
/// the writer lock: they consult the offset index under a [`RwLock`] and
/// the committed length through an atomic, and may block on
/// [`wait_for`](DurableLog::wait_for) for new records.
///
/// # Example
///
/// ```rust,no_run
/// use exchange_sequencer::sequencer::journal::{DurableLog, FileLog};
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log: FileLog<String> = FileLog::open("/tmp/sequencer/input")?;
/// let position = log.append(&"hello".to_string())?;
/// assert_eq!(log.read(position)?.map(|r| r.payload), Some("hello".to_string()));
/// # Ok(())
/// # }
/// ```
pub struct FileLog<R> {
    dir: PathBuf,
    writer: Mutex<SegmentWriter>,
    segments: RwLock<Vec<SegmentIndex>>,
    committed: AtomicU64,
    notify_lock: Mutex<()>,
    appended: Condvar,
    segment_size: usize,
    codec: LogCodec,
    checkpoints: CheckpointStore,
    _payload: PhantomData<fn() -> R>,
}

impl<R: LogPayload> FileLog<R> {
    /// Open or create a JSON-encoded log in `dir` with the default segment
    /// size.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the directory cannot be created or an
    /// existing segment is corrupt.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, JournalError> {
        Self::open_with(dir, DEFAULT_SEGMENT_SIZE, LogCodec::default())
    }

    /// Open or create a log with an explicit segment size and codec.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the directory cannot be created, a
    /// segment cannot be mapped, or stored positions are not contiguous.
    pub fn open_with<P: AsRef<Path>>(
        dir: P,
        segment_size: usize,
        codec: LogCodec,
    ) -> Result<Self, JournalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| JournalError::io_at(e, &dir))?;
        let checkpoints = CheckpointStore::open(dir.join("checkpoints"))?;

        let mut starts = list_segments(&dir)?;
        starts.sort_unstable();

        let mut segments = Vec::with_capacity(starts.len().max(1));
        let mut expected = starts.first().copied().unwrap_or(0);
        let mut tail_end = 0usize;

        for (i, start) in starts.iter().copied().enumerate() {
            if start != expected {
                return Err(JournalError::OutOfOrder {
                    expected,
                    found: start,
                });
            }
            let path = segment_path(&dir, start);
            let map = map_read_only(&path)?;
            let is_last = i + 1 == starts.len();
            let scan = scan_segment(&map, start)?;
            if let Some(reason) = scan.stopped_early {
                if !is_last {
                    return Err(JournalError::InvalidEntryHeader {
                        offset: scan.end,
                        message: format!("segment {start} damaged before its end: {reason}"),
                    });
                }
                warn!(
                    log = %dir.display(),
                    segment = start,
                    offset = scan.end,
                    reason = %reason,
                    "discarding torn tail record"
                );
            }
            expected = start.saturating_add(scan.offsets.len() as u64);
            tail_end = scan.end;
            segments.push(SegmentIndex {
                start,
                map,
                offsets: scan.offsets,
            });
        }

        let writer = match segments.last() {
            Some(last) => SegmentWriter::open_existing(&segment_path(&dir, last.start), tail_end)?,
            None => {
                let path = segment_path(&dir, 0);
                let writer = SegmentWriter::create(&path, segment_size)?;
                segments.push(SegmentIndex {
                    start: 0,
                    map: map_read_only(&path)?,
                    offsets: Vec::new(),
                });
                writer
            }
        };

        info!(
            log = %dir.display(),
            segments = segments.len(),
            next_position = expected,
            "opened durable log"
        );

        Ok(Self {
            dir,
            writer: Mutex::new(writer),
            segments: RwLock::new(segments),
            committed: AtomicU64::new(expected),
            notify_lock: Mutex::new(()),
            appended: Condvar::new(),
            segment_size,
            codec,
            checkpoints,
            _payload: PhantomData,
        })
    }

    /// Directory holding this log's segments.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Payload codec of this log.
    #[must_use]
    pub fn codec(&self) -> LogCodec {
        self.codec
    }

    /// Number of segment files currently indexed.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Rotate to a new segment whose first record will be `start`.
    fn rotate_segment(&self, writer: &mut SegmentWriter, start: u64) -> Result<(), JournalError> {
        let old_path = writer.path.clone();
        let old_len = writer.write_pos;
        writer
            .mmap
            .flush()
            .map_err(|e| JournalError::io_at(e, &old_path))?;

        let new_path = segment_path(&self.dir, start);
        let new_writer = SegmentWriter::create(&new_path, self.segment_size)?;
        let map = map_read_only(&new_path)?;
        *writer = new_writer;

        self.segments
            .write()
            .map_err(|_| JournalError::MutexPoisoned)?
            .push(SegmentIndex {
                start,
                map,
                offsets: Vec::new(),
            });

        // Reclaim the unused tail of the sealed segment (best effort).
        if let Ok(file) = OpenOptions::new().write(true).open(&old_path) {
            let _ = file.set_len(old_len as u64);
        }

        debug!(log = %self.dir.display(), start, "rotated log segment");
        Ok(())
    }

    fn notify_appended(&self) {
        if let Ok(_guard) = self.notify_lock.lock() {
            self.appended.notify_all();
        }
    }

    fn record_at(&self, position: u64) -> Result<Option<LogRecord<R>>, JournalError> {
        if position >= self.committed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let segments = self
            .segments
            .read()
            .map_err(|_| JournalError::MutexPoisoned)?;
        let idx = segments.partition_point(|s| s.start <= position);
        let segment = idx
            .checked_sub(1)
            .and_then(|i| segments.get(i))
            .filter(|s| s.contains(position))
            .ok_or(JournalError::PositionNotFound { position })?;
        let offset = segment.offsets[(position - segment.start) as usize];

        let raw = parse_record(&segment.map, offset)?
            .ok_or(JournalError::PositionNotFound { position })?;
        raw.verify()?;
        if raw.position != position {
            return Err(JournalError::OutOfOrder {
                expected: position,
                found: raw.position,
            });
        }
        let payload = self.codec.decode(position, raw.payload)?;
        Ok(Some(LogRecord {
            position,
            timestamp_ns: raw.timestamp_ns,
            payload,
            stored_crc: raw.stored_crc,
        }))
    }
}

impl<R: LogPayload> DurableLog<R> for FileLog<R> {
    fn append(&self, payload: &R) -> Result<u64, JournalError> {
        let body = self.codec.encode(payload)?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| JournalError::MutexPoisoned)?;

        // Only the writer-lock holder advances `committed`.
        let position = self.committed.load(Ordering::Acquire);
        let entry = encode_entry(position, current_time_nanos(), &body)?;

        if entry.len() > self.segment_size.max(writer.capacity) {
            return Err(JournalError::EntryTooLarge {
                entry_bytes: entry.len(),
                segment_size: self.segment_size,
            });
        }
        if writer.remaining() < entry.len() {
            self.rotate_segment(&mut writer, position)?;
        }
        if writer.remaining() < entry.len() {
            return Err(JournalError::EntryTooLarge {
                entry_bytes: entry.len(),
                segment_size: self.segment_size,
            });
        }

        let offset = writer.write_entry(&entry)?;
        {
            let mut segments = self
                .segments
                .write()
                .map_err(|_| JournalError::MutexPoisoned)?;
            if let Some(active) = segments.last_mut() {
                active.offsets.push(offset);
            }
        }
        self.committed.store(position + 1, Ordering::Release);
        drop(writer);

        self.notify_appended();
        Ok(position)
    }

    fn read(&self, position: u64) -> Result<Option<LogRecord<R>>, JournalError> {
        self.record_at(position)
    }

    fn read_from(&self, position: u64) -> LogReadIter<'_, R> {
        Box::new(FileLogIter {
            log: self,
            next: position,
        })
    }

    fn next_position(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    fn verify_integrity(&self) -> Result<(), JournalError> {
        let segments = self
            .segments
            .read()
            .map_err(|_| JournalError::MutexPoisoned)?;
        let committed = self.committed.load(Ordering::Acquire);
        for segment in segments.iter() {
            for (i, offset) in segment.offsets.iter().copied().enumerate() {
                if segment.start + i as u64 >= committed {
                    break;
                }
                parse_record(&segment.map, offset)?
                    .ok_or(JournalError::InvalidEntryHeader {
                        offset,
                        message: "indexed record vanished".to_string(),
                    })?
                    .verify()?;
            }
        }
        Ok(())
    }

    fn wait_for(&self, position: u64, timeout: Duration) -> bool {
        if position < self.committed.load(Ordering::Acquire) {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let Ok(mut guard) = self.notify_lock.lock() else {
            return false;
        };
        loop {
            if position < self.committed.load(Ordering::Acquire) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.appended.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => guard = g,
                Err(_) => return false,
            }
        }
    }

    fn load_checkpoint(&self, name: &str) -> Result<Option<u64>, JournalError> {
        self.checkpoints.load(name)
    }

    fn store_checkpoint(&self, name: &str, position: u64) -> Result<(), JournalError> {
        self.checkpoints.store(name, position)
    }
}

impl<R> std::fmt::Debug for FileLog<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLog")
            .field("dir", &self.dir)
            .field("segment_size", &self.segment_size)
            .field("codec", &self.codec)
            .field("next_position", &self.committed.load(Ordering::Relaxed))
            .finish()
    }
}

// ─── Iteration ──────────────────────────────────────────────────────────────

struct FileLogIter<'a, R> {
    log: &'a FileLog<R>,
    next: u64,
}

impl<R: LogPayload> Iterator for FileLogIter<'_, R> {
    type Item = Result<LogRecord<R>, JournalError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.log.record_at(self.next).transpose()?;
        self.next = self.next.saturating_add(1);
        Some(item)
    }
}

// ─── Encoding / scanning ────────────────────────────────────────────────────

/// Encode a record into the on-disk binary format.
fn encode_entry(position: u64, timestamp_ns: u64, payload: &[u8]) -> Result<Vec<u8>, JournalError> {
    let entry_length = u32::try_from(payload.len())
        .ok()
        .and_then(|n| n.checked_add((ENTRY_HEADER_SIZE - 4 + ENTRY_CRC_SIZE) as u32))
        .ok_or(JournalError::Encode {
            message: "record size overflow".to_string(),
        })?;

    let mut buf = Vec::with_capacity(entry_length as usize + 4);
    buf.extend_from_slice(&entry_length.to_le_bytes());
    buf.extend_from_slice(&position.to_le_bytes());
    buf.extend_from_slice(&timestamp_ns.to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = crc32fast::hash(&buf[4..]);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

#[inline]
fn le_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at.checked_add(4)?)?
        .try_into()
        .ok()
        .map(u32::from_le_bytes)
}

#[inline]
fn le_u64(data: &[u8], at: usize) -> Option<u64> {
    data.get(at..at.checked_add(8)?)?
        .try_into()
        .ok()
        .map(u64::from_le_bytes)
}

/// A record parsed in place from a mapped segment.
struct RawRecord<'a> {
    position: u64,
    timestamp_ns: u64,
    payload: &'a [u8],
    stored_crc: u32,
    computed_crc: u32,
    end: usize,
}

impl RawRecord<'_> {
    fn verify(&self) -> Result<(), JournalError> {
        if self.stored_crc == self.computed_crc {
            Ok(())
        } else {
            Err(JournalError::CorruptEntry {
                position: self.position,
                expected_crc: self.stored_crc,
                actual_crc: self.computed_crc,
            })
        }
    }
}

/// Parse the record starting at `offset`.
///
/// Returns `Ok(None)` at the end of written data (zero length or no room
/// for a header).
fn parse_record(data: &[u8], offset: usize) -> Result<Option<RawRecord<'_>>, JournalError> {
    let Some(entry_length) = le_u32(data, offset) else {
        return Ok(None);
    };
    if entry_length == 0 {
        return Ok(None);
    }
    let entry_length = entry_length as usize;
    if entry_length < ENTRY_HEADER_SIZE - 4 + ENTRY_CRC_SIZE {
        return Err(JournalError::InvalidEntryHeader {
            offset,
            message: format!("entry_length {entry_length} too small"),
        });
    }
    let body_start = offset + 4;
    let end = body_start
        .checked_add(entry_length)
        .filter(|end| *end <= data.len())
        .ok_or(JournalError::InvalidEntryHeader {
            offset,
            message: "record extends beyond segment".to_string(),
        })?;
    let crc_start = end - ENTRY_CRC_SIZE;

    let truncated = || JournalError::InvalidEntryHeader {
        offset,
        message: "truncated record".to_string(),
    };
    let position = le_u64(data, body_start).ok_or_else(truncated)?;
    let timestamp_ns = le_u64(data, body_start + 8).ok_or_else(truncated)?;
    let stored_crc = le_u32(data, crc_start).ok_or_else(truncated)?;
    let checksummed = data.get(body_start..crc_start).ok_or_else(truncated)?;
    let payload = data
        .get(body_start + 16..crc_start)
        .ok_or_else(truncated)?;

    Ok(Some(RawRecord {
        position,
        timestamp_ns,
        payload,
        stored_crc,
        computed_crc: crc32fast::hash(checksummed),
        end,
    }))
}

struct SegmentScan {
    offsets: Vec<usize>,
    end: usize,
    stopped_early: Option<String>,
}

/// Walk a segment from the start, collecting record offsets until the
/// zero-filled tail or the first damaged record.
fn scan_segment(data: &[u8], start: u64) -> Result<SegmentScan, JournalError> {
    let mut offsets = Vec::new();
    let mut offset = 0usize;
    let mut expected = start;

    loop {
        let raw = match parse_record(data, offset) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                return Ok(SegmentScan {
                    offsets,
                    end: offset,
                    stopped_early: None,
                });
            }
            Err(e) => {
                return Ok(SegmentScan {
                    offsets,
                    end: offset,
                    stopped_early: Some(e.to_string()),
                });
            }
        };
        if raw.verify().is_err() {
            return Ok(SegmentScan {
                offsets,
                end: offset,
                stopped_early: Some(format!("CRC mismatch at position {}", raw.position)),
            });
        }
        if raw.position != expected {
            return Err(JournalError::OutOfOrder {
                expected,
                found: raw.position,
            });
        }
        offsets.push(offset);
        offset = raw.end;
        expected += 1;
    }
}

fn map_read_only(path: &Path) -> Result<Mmap, JournalError> {
    let file = OpenOptions::new()
        .read(true)
        .open(path)
        .map_err(|e| JournalError::io_at(e, path))?;
    // SAFETY: read-only mapping of a segment owned by this log; bytes are
    // only read below the committed offset index.
    unsafe { Mmap::map(&file).map_err(|e| JournalError::io_at(e, path)) }
}

/// Build the path for a segment file given its first position.
fn segment_path(dir: &Path, start: u64) -> PathBuf {
    dir.join(format!("segment-{start:020}.log"))
}

/// List the start positions of every segment in `dir`.
fn list_segments(dir: &Path) -> Result<Vec<u64>, JournalError> {
    let mut starts = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| JournalError::io_at(e, dir))?;
    for entry in entries {
        let entry = entry.map_err(|e| JournalError::io_at(e, dir))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("segment-")
            && let Some(start) = rest.strip_suffix(".log")
            && let Ok(start) = start.parse::<u64>()
        {
            starts.push(start);
        }
    }
    Ok(starts)
}
