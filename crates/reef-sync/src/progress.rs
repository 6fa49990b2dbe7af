//! [`ProgressStore`] — fjall-backed persistence of per-shard sync state.
//!
//! Snapshots let a restarted node skip re-scanning shards it already
//! finished and carry heal entries across restarts. They are an
//! optimization: a missing snapshot only means a full metadata scan.

use std::path::Path;

use fjall::{Database, Keyspace, KeyspaceCreateOptions};
use reef_types::Contract;
use tracing::debug;

use crate::error::SyncError;
use crate::task::TaskSnapshot;

/// Key length: 20-byte contract plus big-endian shard index.
const KEY_LEN: usize = 28;

/// Durable store of [`TaskSnapshot`]s, keyed by `(contract, shard_index)`.
pub struct ProgressStore {
    #[allow(dead_code)]
    db: Database,
    /// `contract ++ shard_index BE` → postcard [`TaskSnapshot`].
    tasks: Keyspace,
}

impl ProgressStore {
    /// Open a persistent progress store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let db = Database::builder(path).open()?;
        Self::init_keyspaces(db)
    }

    /// Open a temporary progress store that is cleaned up on drop.
    ///
    /// Useful for tests.
    pub fn open_temporary() -> Result<Self, SyncError> {
        let tmp = tempfile::tempdir().map_err(|e| SyncError::Codec(e.to_string()))?;
        let db = Database::builder(tmp.path()).temporary(true).open()?;
        Self::init_keyspaces(db)
    }

    fn init_keyspaces(db: Database) -> Result<Self, SyncError> {
        let tasks = db.keyspace("sync_tasks", KeyspaceCreateOptions::default)?;
        Ok(Self { db, tasks })
    }

    fn key(contract: Contract, shard_index: u64) -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        key[..20].copy_from_slice(contract.as_bytes());
        key[20..].copy_from_slice(&shard_index.to_be_bytes());
        key
    }

    /// Persist the snapshot for `(contract, shard_index)`.
    pub fn save(
        &self,
        contract: Contract,
        shard_index: u64,
        snapshot: &TaskSnapshot,
    ) -> Result<(), SyncError> {
        let value =
            postcard::to_allocvec(snapshot).map_err(|e| SyncError::Codec(e.to_string()))?;
        self.tasks.insert(Self::key(contract, shard_index), value)?;
        debug!(%contract, shard = shard_index, done = snapshot.done, "saved sync snapshot");
        Ok(())
    }

    /// Load the snapshot for `(contract, shard_index)`, if any.
    pub fn load(
        &self,
        contract: Contract,
        shard_index: u64,
    ) -> Result<Option<TaskSnapshot>, SyncError> {
        let Some(bytes) = self.tasks.get(Self::key(contract, shard_index))? else {
            return Ok(None);
        };
        let snapshot =
            postcard::from_bytes(&bytes).map_err(|e| SyncError::Codec(e.to_string()))?;
        Ok(Some(snapshot))
    }

    /// Remove the snapshot for `(contract, shard_index)`.
    pub fn clear(&self, contract: Contract, shard_index: u64) -> Result<(), SyncError> {
        self.tasks.remove(Self::key(contract, shard_index))?;
        Ok(())
    }
}

impl std::fmt::Debug for ProgressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(n: u8) -> Contract {
        Contract::from([n; 20])
    }

    #[test]
    fn test_save_load_roundtrip() {
        let store = ProgressStore::open_temporary().unwrap();
        let snapshot = TaskSnapshot {
            subtasks: vec![(0, 4, 8), (12, 12, 16)],
            heal: vec![9, 10],
            done: false,
        };

        store.save(contract(1), 3, &snapshot).unwrap();
        assert_eq!(store.load(contract(1), 3).unwrap(), Some(snapshot));
    }

    #[test]
    fn test_load_missing_returns_none() {
        let store = ProgressStore::open_temporary().unwrap();
        assert_eq!(store.load(contract(1), 0).unwrap(), None);
    }

    #[test]
    fn test_keys_are_disjoint_per_shard() {
        let store = ProgressStore::open_temporary().unwrap();
        let a = TaskSnapshot {
            done: true,
            ..Default::default()
        };
        let b = TaskSnapshot {
            heal: vec![1],
            ..Default::default()
        };

        store.save(contract(1), 0, &a).unwrap();
        store.save(contract(1), 1, &b).unwrap();
        store.save(contract(2), 0, &b).unwrap();

        assert_eq!(store.load(contract(1), 0).unwrap(), Some(a));
        assert_eq!(store.load(contract(1), 1).unwrap(), Some(b.clone()));
        assert_eq!(store.load(contract(2), 0).unwrap(), Some(b));
    }

    #[test]
    fn test_clear_removes_snapshot() {
        let store = ProgressStore::open_temporary().unwrap();
        store
            .save(contract(1), 0, &TaskSnapshot::default())
            .unwrap();
        store.clear(contract(1), 0).unwrap();
        assert_eq!(store.load(contract(1), 0).unwrap(), None);
    }
}
