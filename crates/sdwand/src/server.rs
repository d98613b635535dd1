//! Daemon wiring and the HTTP front door

use crate::api::{router, AppState, RequestDeadline};
use crate::config::Config;
use crate::diagnostics::{spawn_loop, Diagnostician, HealthRegistry};
use crate::inference::{Inference, InferenceError, LlamaClient};
use crate::keys::{load_identity, load_ssh_keys, KeyError};
use crate::pairing::PendingLinks;
use crate::peer_store::{PeerStore, StoreError};
use crate::probe::{locate, CommandRunner, LocalProbe, SnapshotSource, SystemRunner};
use crate::storage::{SnapshotStore, StorageError};
use crate::sync::{Exporter, SyncError, SyncManager, SyncStats};
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use sdwan_core::Identity;
use sdwan_net::{Admission, AdmissionError};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Peer store error: {0}")]
    Store(#[from] StoreError),
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),
    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),
    #[error("Failed to bind to {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
enum ConnectionError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("{0}")]
    Serve(Box<dyn std::error::Error + Send + Sync>),
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub identity: Identity,
    pub peer_count: usize,
    pub stored_snapshots: usize,
    pub sync: SyncStats,
    pub diagnostics: bool,
}

/// The branch controller
pub struct Server {
    config: Config,
    identity: Identity,
    peers: Arc<PeerStore>,
    snapshots: Arc<SnapshotStore>,
    sync: Arc<SyncManager>,
    state: AppState,
    diagnostician: Option<Arc<Diagnostician>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Load keys and state from the data directory and wire the components
    pub async fn new(config: Config) -> Result<Self, ServerError> {
        let identity = load_identity(&config.private_key_path())?;
        let ssh_keys = load_ssh_keys(&config.ssh_dir_path())?;
        info!("Node identity {}", identity);

        let snapshots = Arc::new(SnapshotStore::open(config.state_path())?);
        let peers = Arc::new(PeerStore::open(config.peers_dir())?.with_snapshots(snapshots.clone())?);
        info!("Loaded {} peers", peers.len());

        let location = match &config.whois_url {
            Some(url) => {
                let http = reqwest::Client::builder()
                    .timeout(config.sync_timeout())
                    .build()
                    .map_err(SyncError::from)?;
                match locate(&http, url).await {
                    Ok(location) => Some(location),
                    Err(e) => {
                        warn!("Geolocation lookup failed: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let source: Arc<dyn SnapshotSource> =
            Arc::new(LocalProbe::new(runner.clone()).with_location(location));

        let sync = Arc::new(SyncManager::new(
            identity,
            peers.clone(),
            config.sync_interval(),
            config.sync_timeout(),
            config.gossip_port,
            config.gossip_target,
        )?);
        let exporter = Arc::new(Exporter::new(identity, source.clone(), peers.clone()));

        let inference: Option<Arc<dyn Inference>> = match &config.llm_url {
            Some(url) => Some(Arc::new(LlamaClient::new(
                url,
                config.llm_model.clone(),
                config.sync_timeout(),
            )?)),
            None => None,
        };
        let (health, diagnostician) = match &inference {
            Some(inference) => {
                info!("Diagnostics enabled every {:?}", config.health_interval());
                (
                    Some(HealthRegistry::spawn(config.health_history)),
                    Some(Arc::new(Diagnostician::new(
                        inference.clone(),
                        runner,
                        config.diagnostics_exec,
                        config.max_rounds,
                    ))),
                )
            }
            None => (None, None),
        };

        let state = AppState {
            identity,
            ssh_keys: Arc::from(ssh_keys),
            pending: Arc::new(PendingLinks::new(config.pending_dir())),
            exporter,
            source,
            health,
            inference,
        };

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            identity,
            peers,
            snapshots,
            sync,
            state,
            diagnostician,
            shutdown_tx,
        })
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.listen;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::BindFailed { addr, source })?;
        info!("Listening on {}", addr);
        self.serve(listener).await
    }

    /// Serve connections from `listener` until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let admission = {
            let mut rx = self.shutdown_tx.subscribe();
            Admission::spawn(
                self.config.admission_capacity,
                self.config.admission_timeout(),
                async move {
                    let _ = rx.recv().await;
                },
            )?
        };

        let sync_task = self
            .sync
            .clone()
            .spawn(self.config.rescan_interval(), self.shutdown_tx.clone());
        let diagnostics_task = match (&self.diagnostician, &self.state.health) {
            (Some(diagnostician), Some(registry)) => Some(spawn_loop(
                diagnostician.clone(),
                registry.clone(),
                self.config.health_interval(),
                self.shutdown_tx.subscribe(),
            )),
            _ => None,
        };

        let app = router(self.state.clone());
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Connection from {}", addr);
                            connections.spawn(serve_connection(stream, addr, admission.clone(), app.clone()));
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                Some(result) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            warn!("Connection task panicked: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        connections.shutdown().await;
        if let Err(e) = sync_task.await {
            warn!("Sync supervisor ended abnormally: {}", e);
        }
        if let Some(task) = diagnostics_task {
            if let Err(e) = task.await {
                warn!("Diagnostics loop ended abnormally: {}", e);
            }
        }
        self.snapshots.flush()?;
        Ok(())
    }

    /// Signal every task to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Sender that triggers shutdown, for signal handlers
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            identity: self.identity,
            peer_count: self.peers.len(),
            stored_snapshots: self.snapshots.len(),
            sync: self.sync.stats(),
            diagnostics: self.diagnostician.is_some(),
        }
    }
}

/// Serve one connection within the grace period granted at accept time
async fn serve_connection(stream: TcpStream, addr: SocketAddr, admission: Admission, app: Router) {
    let grace = match admission.duration().await {
        Ok(grace) => grace,
        Err(e) => {
            debug!("Dropping connection from {}: {}", addr, e);
            return;
        }
    };
    let deadline = tokio::time::Instant::now() + grace;

    let result = tokio::time::timeout_at(deadline, async {
        // held until the connection closes
        let _token = admission.acquire().await?;
        let service = service_fn(move |mut request: Request<Incoming>| {
            request.extensions_mut().insert(RequestDeadline(deadline));
            app.clone().oneshot(request)
        });
        ConnBuilder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(stream), service)
            .await
            .map_err(ConnectionError::Serve)
    })
    .await;

    match result {
        Ok(Ok(())) => debug!("Connection from {} closed", addr),
        Ok(Err(e)) => debug!("Connection from {} failed: {}", addr, e),
        Err(_) => debug!("Connection from {} cut off after {:?}", addr, grace),
    }
}
