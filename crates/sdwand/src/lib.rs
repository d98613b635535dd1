//! sdwand - Branch mesh overlay controller
//!
//! This daemon provides:
//! - Identity derived from the WireGuard key pair
//! - Manual pairing between branches over HTTP
//! - Point-to-point tunnel plans with deterministic addressing
//! - Topology probing and gossip of per-node snapshots
//! - Load-adaptive admission of inbound connections
//! - Optional model-driven health diagnostics

pub mod api;
pub mod config;
pub mod diagnostics;
pub mod inference;
pub mod keys;
pub mod pairing;
pub mod peer_store;
pub mod probe;
pub mod server;
pub mod storage;
pub mod sync;
pub mod tunnel;

pub use config::Config;
pub use diagnostics::{Diagnostician, HealthRegistry};
pub use pairing::{PairingClient, PendingLinks};
pub use peer_store::{PeerRecord, PeerStore};
pub use server::Server;
pub use storage::SnapshotStore;
pub use sync::{Exporter, SyncManager};
