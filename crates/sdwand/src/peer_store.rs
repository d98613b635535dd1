//! Durable registry of paired peers
//!
//! Layout on disk, one directory per peer:
//!
//! ```text
//! peers/<fs-safe identity>/address   last known underlay host
//! peers/<fs-safe identity>/ssh       the peer's published SSH keys
//! ```
//!
//! The controller CLI writes the same directory, so the daemon rescans it with
//! [`PeerStore::reload`]. Snapshots received by gossip are kept in memory under
//! the same lock and mirrored into a [`SnapshotStore`] when one is attached.

use crate::storage::{SnapshotStore, StorageError};
use parking_lot::RwLock;
use sdwan_core::{Identity, TopologySnapshot};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const ADDRESS_FILE: &str = "address";
const SSH_FILE: &str = "ssh";

/// Peer store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Everything known about one paired peer
#[derive(Clone, Debug, PartialEq)]
pub struct PeerRecord {
    pub identity: Identity,
    /// Underlay host recorded at pairing time, without a port
    pub endpoint: Option<String>,
    pub ssh_keys: Option<String>,
    /// Most recent snapshot received for this peer
    pub snapshot: Option<TopologySnapshot>,
}

impl PeerRecord {
    /// `host:port` for the recorded endpoint, bracketing IPv6 literals
    pub fn endpoint_with_port(&self, port: u16) -> Option<String> {
        self.endpoint.as_deref().map(|host| join_host_port(host, port))
    }
}

/// Join a host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Registry of paired peers
pub struct PeerStore {
    root: PathBuf,
    peers: RwLock<BTreeMap<Identity, PeerRecord>>,
    snapshots: Option<Arc<SnapshotStore>>,
}

impl PeerStore {
    /// Open the peers directory, creating it if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let store = Self {
            root,
            peers: RwLock::new(BTreeMap::new()),
            snapshots: None,
        };
        store.reload()?;
        Ok(store)
    }

    /// Attach a snapshot cache and restore cached snapshots of known peers
    pub fn with_snapshots(mut self, snapshots: Arc<SnapshotStore>) -> Result<Self, StoreError> {
        {
            let mut peers = self.peers.write();
            for entry in snapshots.all() {
                let (identity, snapshot) = entry?;
                if let Some(record) = peers.get_mut(&identity) {
                    record.snapshot = Some(snapshot);
                }
            }
        }
        self.snapshots = Some(snapshots);
        Ok(self)
    }

    /// Directory the store lives in
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register a peer. Returns `false` and changes nothing when the peer is
    /// already known.
    pub fn register(
        &self,
        identity: Identity,
        endpoint: Option<&str>,
        ssh_keys: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut peers = self.peers.write();
        if peers.contains_key(&identity) {
            debug!("Peer {} already registered", identity.short());
            return Ok(false);
        }

        let dir = self.root.join(identity.to_path());
        fs::create_dir_all(&dir)?;
        if let Some(host) = endpoint {
            fs::write(dir.join(ADDRESS_FILE), format!("{}\n", host))?;
        }
        if let Some(keys) = ssh_keys {
            fs::write(dir.join(SSH_FILE), keys)?;
        }

        peers.insert(
            identity,
            PeerRecord {
                identity,
                endpoint: endpoint.map(str::to_string),
                ssh_keys: ssh_keys.map(str::to_string),
                snapshot: None,
            },
        );
        info!("Registered peer {}", identity);
        Ok(true)
    }

    /// All known peers, ordered by identity
    pub fn list(&self) -> Vec<PeerRecord> {
        self.peers.read().values().cloned().collect()
    }

    /// Identities of all known peers
    pub fn identities(&self) -> Vec<Identity> {
        self.peers.read().keys().copied().collect()
    }

    pub fn get(&self, identity: &Identity) -> Option<PeerRecord> {
        self.peers.read().get(identity).cloned()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.peers.read().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Replace the snapshot held for a known peer.
    ///
    /// Returns `false` for identities that were never paired; their snapshot
    /// is not stored.
    pub fn record_snapshot(
        &self,
        identity: &Identity,
        snapshot: TopologySnapshot,
    ) -> Result<bool, StoreError> {
        {
            let mut peers = self.peers.write();
            let Some(record) = peers.get_mut(identity) else {
                return Ok(false);
            };
            if let Some(cache) = &self.snapshots {
                cache.put(identity, &snapshot)?;
            }
            record.snapshot = Some(snapshot);
        }
        Ok(true)
    }

    /// Every stored snapshot, ordered by identity
    pub fn snapshots(&self) -> Vec<(Identity, TopologySnapshot)> {
        self.peers
            .read()
            .values()
            .filter_map(|record| record.snapshot.clone().map(|s| (record.identity, s)))
            .collect()
    }

    /// Rescan the peers directory. Newly found peers are added, recorded
    /// endpoints and keys of known peers are refreshed. Returns the new
    /// identities.
    pub fn reload(&self) -> Result<Vec<Identity>, StoreError> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let identity = match Identity::from_path(&name) {
                Ok(identity) => identity,
                Err(e) => {
                    warn!("Skipping peer directory '{}': {}", name, e);
                    continue;
                }
            };
            let endpoint = read_optional(&entry.path().join(ADDRESS_FILE))?
                .map(|text| text.trim().to_string())
                .filter(|host| !host.is_empty());
            let ssh_keys = read_optional(&entry.path().join(SSH_FILE))?;
            found.push((identity, endpoint, ssh_keys));
        }

        let mut added = Vec::new();
        let mut peers = self.peers.write();
        for (identity, endpoint, ssh_keys) in found {
            match peers.get_mut(&identity) {
                Some(record) => {
                    record.endpoint = endpoint;
                    record.ssh_keys = ssh_keys;
                }
                None => {
                    let snapshot = match &self.snapshots {
                        Some(cache) => cache.get(&identity)?,
                        None => None,
                    };
                    peers.insert(
                        identity,
                        PeerRecord {
                            identity,
                            endpoint,
                            ssh_keys,
                            snapshot,
                        },
                    );
                    added.push(identity);
                }
            }
        }
        if !added.is_empty() {
            debug!("Found {} new peers in {}", added.len(), self.root.display());
        }
        Ok(added)
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
