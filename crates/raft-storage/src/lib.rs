//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: written through by raft-server on every term / vote / log change
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use raft_core::PersistentState;
use thiserror::Error;

/// errors raised by a storage backend
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt raft state: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// trait for durable storage of raft state
///
/// term, vote and log are always written together so a crash can never
/// leave a new term paired with an old vote.
/// this abstraction allows the same code to work with:
/// - real filesystem (native)
/// - in-memory (testing)
pub trait Storage: Send {
    /// persist the whole state; must be durable before returning
    fn save_state(&mut self, state: &PersistentState) -> Result<(), StorageError>;

    /// load the persisted state, `None` for a node that never saved anything
    fn load_state(&self) -> Result<Option<PersistentState>, StorageError>;

    /// clear all persisted state
    fn clear(&mut self) -> Result<(), StorageError>;
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory as a single `state.json`
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }
}

impl Storage for FileStorage {
    fn save_state(&mut self, state: &PersistentState) -> Result<(), StorageError> {
        let json = serde_json::to_vec(state)?;

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join("state.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.state_path())?;
        // the rename itself is only durable once the directory entry is
        File::open(&self.dir)?.sync_all()?;

        tracing::trace!(
            dir = %self.dir.display(),
            term = state.current_term,
            entries = state.log.len(),
            "persisted raft state"
        );
        Ok(())
    }

    fn load_state(&self) -> Result<Option<PersistentState>, StorageError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }

        let mut contents = String::new();
        File::open(&path)?.read_to_string(&mut contents)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        match fs::remove_file(self.state_path()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// clones share the same slot, so a test can hand one clone to a node,
/// kill it, and restart a new node from another clone.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    slot: Arc<Mutex<Option<PersistentState>>>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// how large the last saved state is once encoded
    pub fn state_size(&self) -> Result<usize, StorageError> {
        let slot = self.slot.lock().map_err(|_| StorageError::Poisoned)?;
        match slot.as_ref() {
            Some(state) => Ok(serde_json::to_vec(state)?.len()),
            None => Ok(0),
        }
    }
}

impl Storage for InMemoryStorage {
    fn save_state(&mut self, state: &PersistentState) -> Result<(), StorageError> {
        let mut slot = self.slot.lock().map_err(|_| StorageError::Poisoned)?;
        *slot = Some(state.clone());
        Ok(())
    }

    fn load_state(&self) -> Result<Option<PersistentState>, StorageError> {
        let slot = self.slot.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(slot.clone())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        let mut slot = self.slot.lock().map_err(|_| StorageError::Poisoned)?;
        *slot = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft_core::LogEntry;
    use tempfile::tempdir;

    fn sample_state() -> PersistentState {
        PersistentState {
            current_term: 7,
            voted_for: Some(3),
            log: vec![
                LogEntry::new(1, 1, b"set key1 value1".to_vec()),
                LogEntry::new(7, 2, b"set key2 value2".to_vec()),
            ],
        }
    }

    #[test]
    fn in_memory_storage_round_trips_state() {
        let mut storage = InMemoryStorage::new();
        storage.save_state(&sample_state()).unwrap();
        assert_eq!(storage.load_state().unwrap(), Some(sample_state()));
    }

    #[test]
    fn in_memory_clones_share_state() {
        let mut storage = InMemoryStorage::new();
        let other = storage.clone();
        storage.save_state(&sample_state()).unwrap();
        assert_eq!(other.load_state().unwrap().unwrap().current_term, 7);
        assert!(other.state_size().unwrap() > 0);
    }

    #[test]
    fn file_storage_survives_restart() {
        let dir = tempdir().unwrap();

        // first "session"
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_state(&sample_state()).unwrap();
        }

        // "restart" - new storage instance
        {
            let storage = FileStorage::new(dir.path()).unwrap();
            assert_eq!(storage.load_state().unwrap(), Some(sample_state()));
        }
    }

    #[test]
    fn file_storage_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_state(&sample_state()).unwrap();
        assert!(!dir.path().join("state.tmp").exists());
        assert!(dir.path().join("state.json").exists());
    }
}
