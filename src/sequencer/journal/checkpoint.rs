//! Named reader checkpoints.
//!
//! A checkpoint is a tiny file `checkpoints/{name}.checkpoint` holding a
//! log position so that a restarting reader resumes rather than rescans.
//!
//! ```text
//! [8 bytes: position LE][4 bytes: CRC32 of position]
//! ```
//!
//! Files are replaced atomically: write to `.tmp`, fsync, rename.

use super::error::JournalError;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const CHECKPOINT_LEN: usize = 8 + 4;

/// Stores named checkpoints in a directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Creates a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] if the directory cannot be created.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, JournalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| JournalError::io_at(e, &dir))?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, JournalError> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(JournalError::Checkpoint {
                name: name.to_string(),
                message: "checkpoint names must be non-empty [A-Za-z0-9_-]".to_string(),
            });
        }
        Ok(self.dir.join(format!("{name}.checkpoint")))
    }

    /// Loads the checkpoint `name`, returning `None` if it was never stored.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Checkpoint`] for a truncated or corrupt file.
    pub fn load(&self, name: &str) -> Result<Option<u64>, JournalError> {
        let path = self.path_for(name)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(JournalError::io_at(e, path)),
        };

        let corrupt = |message: &str| JournalError::Checkpoint {
            name: name.to_string(),
            message: message.to_string(),
        };

        if bytes.len() != CHECKPOINT_LEN {
            return Err(corrupt("unexpected checkpoint length"));
        }
        let mut pos = [0u8; 8];
        pos.copy_from_slice(&bytes[..8]);
        let mut crc = [0u8; 4];
        crc.copy_from_slice(&bytes[8..]);
        if crc32fast::hash(&pos) != u32::from_le_bytes(crc) {
            return Err(corrupt("checksum mismatch"));
        }
        Ok(Some(u64::from_le_bytes(pos)))
    }

    /// Stores `position` under `name`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] if the file cannot be written.
    pub fn store(&self, name: &str, position: u64) -> Result<(), JournalError> {
        let path = self.path_for(name)?;
        let tmp = path.with_extension("checkpoint.tmp");

        let pos = position.to_le_bytes();
        let mut buf = Vec::with_capacity(CHECKPOINT_LEN);
        buf.extend_from_slice(&pos);
        buf.extend_from_slice(&crc32fast::hash(&pos).to_le_bytes());

        let mut file = File::create(&tmp).map_err(|e| JournalError::io_at(e, &tmp))?;
        file.write_all(&buf)
            .map_err(|e| JournalError::io_at(e, &tmp))?;
        file.sync_all().map_err(|e| JournalError::io_at(e, &tmp))?;
        fs::rename(&tmp, &path).map_err(|e| JournalError::io_at(e, &path))?;
        Ok(())
    }
}
