//! Persistent snapshot cache using sled
//!
//! Learned topology survives a restart here. Peer membership itself lives in
//! the peers directory, not in this database.

use sdwan_core::{Identity, TopologySnapshot};
use sled::Db;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
}

/// Last received snapshot per identity
pub struct SnapshotStore {
    db: Db,
    /// Snapshot tree: identity bytes -> TopologySnapshot
    snapshots: sled::Tree,
}

impl SnapshotStore {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let snapshots = db.open_tree("snapshots")?;
        Ok(Self { db, snapshots })
    }

    /// Store a snapshot, replacing any earlier one
    pub fn put(&self, identity: &Identity, snapshot: &TopologySnapshot) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(snapshot)?;
        self.snapshots.insert(identity.as_bytes(), value)?;
        Ok(())
    }

    /// Get the snapshot stored for an identity
    pub fn get(&self, identity: &Identity) -> Result<Option<TopologySnapshot>, StorageError> {
        match self.snapshots.get(identity.as_bytes())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Iterate over every stored snapshot
    pub fn all(&self) -> impl Iterator<Item = Result<(Identity, TopologySnapshot), StorageError>> + '_ {
        self.snapshots.iter().filter_map(|result| {
            let (key, value) = match result {
                Ok(pair) => pair,
                Err(e) => return Some(Err(e.into())),
            };
            // keys are always written from 32-byte identities
            let bytes: [u8; 32] = key.as_ref().try_into().ok()?;
            Some(
                postcard::from_bytes(&value)
                    .map(|snapshot| (Identity::from_bytes(bytes), snapshot))
                    .map_err(StorageError::from),
            )
        })
    }

    /// Count stored snapshots
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
