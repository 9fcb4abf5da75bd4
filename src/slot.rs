//! Durable slot - the single persistent entry that survives restarts
//! Backed by sled in production, by plain memory for tests and ephemeral use

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sled::Db;
use tracing::debug;

use crate::error::StoreError;

/// Fixed key of the one database-image entry.
const SLOT_KEY: &str = "goal_sqlite_db";
/// Tree holding the entry, kept separate from sled's default namespace.
const SLOT_TREE: &str = "goal_db";

/// A named durable location holding at most one serialized database image
pub trait DurableSlot: Send + Sync {
    /// Read the stored image, if any.
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite the stored image.
    fn store(&self, bytes: &[u8]) -> Result<(), StoreError>;
}

impl<T: DurableSlot + ?Sized> DurableSlot for Arc<T> {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).load()
    }

    fn store(&self, bytes: &[u8]) -> Result<(), StoreError> {
        (**self).store(bytes)
    }
}

/// Durable slot backed by a sled database on disk
pub struct SledSlot {
    db: Db,
}

impl SledSlot {
    /// Open or create the backing database at a specific path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = sled::open(path).map_err(slot_err)?;
        debug!("Opened durable slot at {:?}", path);
        Ok(Self { db })
    }

    /// Open the slot at the default location
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(Self::default_path()?)
    }

    /// Get the default slot path
    fn default_path() -> Result<PathBuf, StoreError> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| StoreError::Slot("no config directory found".to_string()))?;
        path.push("goal-store");
        path.push("goals.db");
        Ok(path)
    }
}

impl DurableSlot for SledSlot {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let tree = self.db.open_tree(SLOT_TREE).map_err(slot_err)?;
        let bytes = tree
            .get(SLOT_KEY.as_bytes())
            .map_err(slot_err)?
            .map(|ivec| ivec.to_vec());
        Ok(bytes)
    }

    fn store(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let tree = self.db.open_tree(SLOT_TREE).map_err(slot_err)?;
        tree.insert(SLOT_KEY.as_bytes(), bytes).map_err(slot_err)?;
        tree.flush().map_err(slot_err)?;
        Ok(())
    }
}

/// In-memory slot; contents are lost when the value is dropped
#[derive(Default)]
pub struct MemorySlot {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl MemorySlot {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableSlot for MemorySlot {
    fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.bytes.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(guard.clone())
    }

    fn store(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.bytes.lock().map_err(|_| StoreError::LockPoisoned)?;
        *guard = Some(bytes.to_vec());
        Ok(())
    }
}

fn slot_err(err: sled::Error) -> StoreError {
    StoreError::Slot(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_slot_round_trip() {
        let slot = MemorySlot::new();
        assert_eq!(slot.load().unwrap(), None);

        slot.store(&[1, 2, 3]).unwrap();
        assert_eq!(slot.load().unwrap(), Some(vec![1, 2, 3]));

        // Overwrite replaces the whole entry
        slot.store(&[9]).unwrap();
        assert_eq!(slot.load().unwrap(), Some(vec![9]));
    }

    #[test]
    fn test_sled_slot_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slot.db");

        {
            let slot = SledSlot::open(&path).unwrap();
            assert_eq!(slot.load().unwrap(), None);
            slot.store(b"image").unwrap();
        }

        let slot = SledSlot::open(&path).unwrap();
        assert_eq!(slot.load().unwrap(), Some(b"image".to_vec()));
    }
}
