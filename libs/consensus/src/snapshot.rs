//! Local snapshot storage
//!
//! A bootstrapping follower that finds a local snapshot may skip replaying
//! the full backlog and instead report the snapshot's index to the leader.

use crate::types::{Address, LogIndex, Term};
use crate::Result;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const SNAPSHOT_FILE: &str = "snapshot.bin";

/// Snapshot metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Index of the last entry included in the snapshot
    pub last_included_index: LogIndex,

    /// Term of the last entry included in the snapshot
    pub last_included_term: Term,

    /// Cluster members at the time of the snapshot
    pub configuration: Vec<Address>,
}

/// A complete snapshot of the replicated state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Vec<u8>,
}

/// Trait for snapshot storage backends
pub trait SnapshotStore: Send + Sync {
    /// Load the latest snapshot, if one exists
    fn load(&self) -> Result<Option<Snapshot>>;

    /// Replace the stored snapshot
    fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

/// In-memory snapshot storage (for testing and development)
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshot: RwLock<Option<Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        Self {
            snapshot: RwLock::new(Some(snapshot)),
        }
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshot.read().clone())
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        *self.snapshot.write() = Some(snapshot.clone());
        Ok(())
    }
}

/// Snapshot stored as a single bincode file inside the state directory
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Option<Snapshot>> {
        let bytes = match fs::read(self.path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = bincode::serialize(snapshot)?;
        let tmp = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, self.path())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(index: u64) -> Snapshot {
        Snapshot {
            metadata: SnapshotMetadata {
                last_included_index: LogIndex(index),
                last_included_term: Term(2),
                configuration: vec![Address::new("10.0.0.2", 7000)],
            },
            data: b"snapshot_data".to_vec(),
        }
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySnapshotStore::new();
        assert!(store.load().unwrap().is_none());

        store.save(&snapshot(4)).unwrap();
        assert_eq!(store.load().unwrap(), Some(snapshot(4)));
    }

    #[test]
    fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path());
        assert!(store.load().unwrap().is_none());

        store.save(&snapshot(7)).unwrap();
        store.save(&snapshot(9)).unwrap();

        let reopened = FileSnapshotStore::new(dir.path());
        assert_eq!(reopened.load().unwrap(), Some(snapshot(9)));
        assert!(!dir.path().join("snapshot.bin.tmp").exists());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SNAPSHOT_FILE), b"\xff").unwrap();

        let store = FileSnapshotStore::new(dir.path());
        assert!(store.load().is_err());
    }
}
