//! Topology gossip
//!
//! Every known peer gets its own task that periodically fetches the peer's
//! export (`GET /api/sdwan`) and merges it entry by entry. Merging is
//! last-writer-wins per identity with no version check: whichever peer task
//! writes last decides what is known about an identity. Identities that were
//! never paired locally are dropped, and our own identity is never merged.
//!
//! The [`Exporter`] serves the other direction: a fresh snapshot of this node
//! followed by every snapshot learned so far, streamed as one JSON array.

use crate::config::GossipTarget;
use crate::peer_store::{PeerStore, StoreError};
use crate::probe::SnapshotSource;
use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use sdwan_core::{global_address, Identity, TopologyEntry};
use sdwan_net::{FrameError, JsonArrayCodec};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{Encoder, FramedRead};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

/// Sync protocol errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url} responded with {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("Bad export document: {0}")]
    Frame(#[from] FrameError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("No endpoint recorded for peer {0}")]
    NoAddress(Identity),
    #[error("Peer {0} is not registered")]
    UnknownPeer(Identity),
}

/// What happened to one received entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    /// Entry about this node, ignored
    OwnIdentity,
    /// Entry about an identity that was never paired, dropped
    UnknownPeer,
}

/// Anti-entropy state for a peer
#[derive(Clone, Debug, Default)]
pub struct PeerSyncState {
    pub last_success: Option<Instant>,
    /// Completed fetches
    pub rounds: u64,
    /// Consecutive failures
    pub failures: u32,
    /// Entries merged over the task's lifetime
    pub merged: u64,
}

/// Sync statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub peer_count: usize,
    pub total_rounds: u64,
    pub failing_peers: usize,
}

/// Synchronization manager
pub struct SyncManager {
    local: Identity,
    peers: Arc<PeerStore>,
    http: reqwest::Client,
    states: RwLock<HashMap<Identity, PeerSyncState>>,
    interval: Duration,
    port: u16,
    target: GossipTarget,
}

impl SyncManager {
    pub fn new(
        local: Identity,
        peers: Arc<PeerStore>,
        interval: Duration,
        timeout: Duration,
        port: u16,
        target: GossipTarget,
    ) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sdwand/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            local,
            peers,
            http,
            states: RwLock::new(HashMap::new()),
            interval,
            port,
            target,
        })
    }

    /// Export URL of a peer
    pub fn peer_url(&self, peer: &Identity) -> Result<String, SyncError> {
        let authority = match self.target {
            GossipTarget::Mesh => format!("[{}]:{}", global_address(peer).addr(), self.port),
            GossipTarget::Endpoint => self
                .peers
                .get(peer)
                .ok_or(SyncError::UnknownPeer(*peer))?
                .endpoint_with_port(self.port)
                .ok_or(SyncError::NoAddress(*peer))?,
        };
        Ok(format!("http://{}/api/sdwan", authority))
    }

    /// Merge one entry received from `from`
    pub fn merge_entry(&self, from: &Identity, entry: TopologyEntry) -> Result<MergeOutcome, SyncError> {
        if entry.identity == self.local {
            debug!("Ignoring entry about ourselves from {}", from.short());
            return Ok(MergeOutcome::OwnIdentity);
        }
        if !self.peers.record_snapshot(&entry.identity, entry.node)? {
            warn!(
                "Dropping entry for unknown identity {} from {}",
                entry.identity,
                from.short()
            );
            return Ok(MergeOutcome::UnknownPeer);
        }
        Ok(MergeOutcome::Merged)
    }

    /// Fetch one peer's export and merge it. Returns the number of merged
    /// entries. Entries decoded before a failure stay merged.
    pub async fn sync_once(&self, peer: &Identity) -> Result<usize, SyncError> {
        let url = self.peer_url(peer)?;
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(SyncError::Status {
                url,
                status: response.status(),
            });
        }

        let body = StreamReader::new(response.bytes_stream().map_err(io::Error::other));
        let entries = FramedRead::new(body, JsonArrayCodec::<TopologyEntry>::new());
        tokio::pin!(entries);
        let mut merged = 0;
        while let Some(entry) = entries.next().await {
            if self.merge_entry(peer, entry?)? == MergeOutcome::Merged {
                merged += 1;
            }
        }
        debug!("Merged {} entries from {}", merged, peer.short());
        Ok(merged)
    }

    fn record(&self, peer: &Identity, result: Result<usize, SyncError>) {
        let mut states = self.states.write();
        let state = states.entry(*peer).or_default();
        match result {
            Ok(merged) => {
                state.last_success = Some(Instant::now());
                state.rounds += 1;
                state.failures = 0;
                state.merged += merged as u64;
            }
            Err(e) => {
                state.failures += 1;
                warn!(
                    "Gossip with {} failed ({} in a row): {}",
                    peer.short(),
                    state.failures,
                    e
                );
            }
        }
    }

    pub fn peer_state(&self, peer: &Identity) -> Option<PeerSyncState> {
        self.states.read().get(peer).cloned()
    }

    /// Get sync statistics
    pub fn stats(&self) -> SyncStats {
        let states = self.states.read();
        SyncStats {
            peer_count: states.len(),
            total_rounds: states.values().map(|s| s.rounds).sum(),
            failing_peers: states.values().filter(|s| s.failures > 0).count(),
        }
    }

    async fn run_peer(self: Arc<Self>, peer: Identity, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.states.write().entry(peer).or_default();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = shutdown.recv() => break,
                result = self.sync_once(&peer) => self.record(&peer, result),
            }
        }
        debug!("Gossip task for {} stopped", peer.short());
    }

    /// Start the supervisor: one task per known peer, with the peers
    /// directory rescanned every `rescan` to pick up new pairings.
    pub fn spawn(self: Arc<Self>, rescan: Duration, shutdown: broadcast::Sender<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tasks = JoinSet::new();
            let mut started = HashSet::new();
            let mut stop = shutdown.subscribe();
            let mut ticker = tokio::time::interval(rescan);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.peers.reload() {
                            warn!("Rescanning peers failed: {}", e);
                        }
                        for peer in self.peers.identities() {
                            if peer == self.local || !started.insert(peer) {
                                continue;
                            }
                            info!("Starting gossip with {}", peer);
                            tasks.spawn(self.clone().run_peer(peer, shutdown.subscribe()));
                        }
                    }
                    Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(e) = result {
                            warn!("Gossip task ended abnormally: {}", e);
                        }
                    }
                }
            }

            tasks.shutdown().await;
            info!("Gossip stopped");
        })
    }
}

/// Producer of this node's export stream
pub struct Exporter {
    local: Identity,
    source: Arc<dyn SnapshotSource>,
    peers: Arc<PeerStore>,
}

impl Exporter {
    pub fn new(local: Identity, source: Arc<dyn SnapshotSource>, peers: Arc<PeerStore>) -> Self {
        Self {
            local,
            source,
            peers,
        }
    }

    /// Export entries in order: a fresh local entry first, then every learned
    /// snapshot
    pub async fn entries(&self) -> Vec<TopologyEntry> {
        let own = TopologyEntry {
            identity: self.local,
            node: self.source.snapshot().await,
        };
        std::iter::once(own)
            .chain(
                self.peers
                    .snapshots()
                    .into_iter()
                    .filter(|(identity, _)| *identity != self.local)
                    .map(|(identity, node)| TopologyEntry { identity, node }),
            )
            .collect()
    }

    /// Stream the export as JSON array chunks.
    ///
    /// A producer task encodes entries into a small channel. Dropping the
    /// stream stops the producer; passing `deadline` stops it early, which
    /// leaves the array unterminated for the reader.
    pub fn stream(
        self: &Arc<Self>,
        deadline: Option<tokio::time::Instant>,
    ) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(4);
        let exporter = self.clone();

        tokio::spawn(async move {
            let produce = async {
                let mut codec = JsonArrayCodec::<TopologyEntry>::new();
                for entry in exporter.entries().await {
                    let mut chunk = BytesMut::new();
                    if let Err(e) = codec.encode(entry, &mut chunk) {
                        warn!("Encoding export entry failed: {}", e);
                        let _ = tx.send(Err(io::Error::other(e))).await;
                        return;
                    }
                    if tx.send(Ok(chunk.freeze())).await.is_err() {
                        debug!("Export reader went away");
                        return;
                    }
                }
                let mut chunk = BytesMut::new();
                codec.finish(&mut chunk);
                let _ = tx.send(Ok(chunk.freeze())).await;
            };

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, produce).await.is_err() {
                        warn!("Export deadline passed before the array was complete");
                    }
                }
                None => produce.await,
            }
        });

        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
    }
}
