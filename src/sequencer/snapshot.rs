//! Checksummed snapshots of [`SequencerState`] keyed by input-log position.
//!
//! A snapshot at position `p` holds the state after applying every command
//! up to and including `p - 1`; replay resumes at `p`. Files are named
//! `state-{position:020}.snapshot` and written atomically.

use super::error::SnapshotError;
use super::state::SequencerState;
use crate::utils::current_time_millis;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Format version written by this build.
pub const STATE_SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Snapshots retained after a successful save.
pub const DEFAULT_SNAPSHOTS_RETAINED: usize = 2;

const SNAPSHOT_PREFIX: &str = "state-";
const SNAPSHOT_SUFFIX: &str = ".snapshot";

#[derive(Serialize)]
struct SnapshotPackageRef<'a> {
    version: u32,
    position: u64,
    created_at_ms: u64,
    checksum: String,
    state: &'a SequencerState,
}

/// A snapshot read back from disk.
#[derive(Debug, Deserialize)]
pub struct StateSnapshotPackage {
    /// Schema version.
    pub version: u32,
    /// Next input position to apply.
    pub position: u64,
    /// Wall-clock time of the save.
    pub created_at_ms: u64,
    /// Hex-encoded SHA-256 of the serialized state.
    pub checksum: String,
    /// The state.
    pub state: SequencerState,
}

impl StateSnapshotPackage {
    /// Validates the checksum and version.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Version`] or [`SnapshotError::ChecksumMismatch`].
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.version != STATE_SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::Version {
                found: self.version,
                expected: STATE_SNAPSHOT_FORMAT_VERSION,
            });
        }
        let computed = compute_checksum(&self.state)?;
        if computed != self.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                expected: self.checksum.clone(),
                actual: computed,
            });
        }
        Ok(())
    }

    /// Consumes the package and returns the validated state.
    ///
    /// # Errors
    ///
    /// See [`validate`](Self::validate).
    pub fn into_state(self) -> Result<SequencerState, SnapshotError> {
        self.validate()?;
        Ok(self.state)
    }
}

fn compute_checksum(state: &SequencerState) -> Result<String, SnapshotError> {
    let payload =
        serde_json::to_vec(state).map_err(|e| SnapshotError::Serialization(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(payload);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Directory of state snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    retained: usize,
}

impl SnapshotStore {
    /// Opens (creating if needed) a snapshot directory.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] if the directory cannot be created.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, SnapshotError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retained: DEFAULT_SNAPSHOTS_RETAINED,
        })
    }

    /// Sets how many snapshots survive pruning (at least 1).
    #[must_use]
    pub fn with_retained(mut self, retained: usize) -> Self {
        self.retained = retained.max(1);
        self
    }

    /// The snapshot directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, position: u64) -> PathBuf {
        self.dir
            .join(format!("{SNAPSHOT_PREFIX}{position:020}{SNAPSHOT_SUFFIX}"))
    }

    /// Writes a snapshot of `state` at `position`, then prunes old ones.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] on encoding or filesystem failures.
    pub fn save(&self, position: u64, state: &SequencerState) -> Result<PathBuf, SnapshotError> {
        let package = SnapshotPackageRef {
            version: STATE_SNAPSHOT_FORMAT_VERSION,
            position,
            created_at_ms: current_time_millis(),
            checksum: compute_checksum(state)?,
            state,
        };
        let bytes = serde_json::to_vec(&package)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;

        let path = self.path_for(position);
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        info!(position, bytes = bytes.len(), "state snapshot written");
        self.prune()?;
        Ok(path)
    }

    /// Positions of every snapshot on disk, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] if the directory cannot be listed.
    pub fn positions(&self) -> Result<Vec<u64>, SnapshotError> {
        let mut positions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(position) = name
                .strip_prefix(SNAPSHOT_PREFIX)
                .and_then(|rest| rest.strip_suffix(SNAPSHOT_SUFFIX))
                .and_then(|digits| digits.parse::<u64>().ok())
            {
                positions.push(position);
            }
        }
        positions.sort_unstable();
        Ok(positions)
    }

    /// Position of the newest snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Io`] if the directory cannot be listed.
    pub fn latest(&self) -> Result<Option<u64>, SnapshotError> {
        Ok(self.positions()?.last().copied())
    }

    /// Loads and validates the snapshot at `position`, if present.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError`] if the file exists but is damaged.
    pub fn load(&self, position: u64) -> Result<Option<SequencerState>, SnapshotError> {
        let path = self.path_for(position);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let package: StateSnapshotPackage = serde_json::from_slice(&bytes)
            .map_err(|e| SnapshotError::Serialization(e.to_string()))?;
        if package.position != position {
            return Err(SnapshotError::PositionMismatch {
                file: position,
                contents: package.position,
            });
        }
        debug!(position, "state snapshot loaded");
        package.into_state().map(Some)
    }

    fn prune(&self) -> Result<(), SnapshotError> {
        let positions = self.positions()?;
        if positions.len() <= self.retained {
            return Ok(());
        }
        let excess = positions.len() - self.retained;
        for position in &positions[..excess] {
            if let Err(e) = fs::remove_file(self.path_for(*position)) {
                warn!(position, error = %e, "failed to remove old snapshot");
            }
        }
        Ok(())
    }
}
