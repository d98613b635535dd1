//! sdwand - Branch mesh overlay controller
//!
//! Runs the branch daemon, or one of the operator commands around it:
//! key generation, pairing, tunnel plans and pending link requests.

use anyhow::Context;
use clap::Parser;
use sdwand::config::{Command, Config};
use sdwand::keys::{generate_private_key, load_identity};
use sdwand::pairing::{PairingClient, PendingLinks};
use sdwand::peer_store::PeerStore;
use sdwand::server::Server;
use sdwand::tunnel::{render_plan, TunnelSettings};
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    // Initialize logging
    let default_filter = if config.verbose {
        "sdwand=debug,sdwan_net=debug"
    } else {
        "sdwand=info,sdwan_net=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let (pretty, json) = if config.log_format == "json" {
        (None, Some(fmt::layer().json()))
    } else {
        (Some(fmt::layer()), None)
    };
    tracing_subscriber::registry()
        .with(pretty)
        .with(json)
        .with(filter)
        .init();

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    let result = match config.command.clone().unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Keygen { force } => keygen(&config, force),
        Command::Pair { host } => pair(&config, &host).await,
        Command::Plan => plan(&config),
        Command::Pending => pending(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        "sdwand v{} - Branch Mesh Overlay Controller",
        env!("CARGO_PKG_VERSION")
    );

    let server = Server::new(config)
        .await
        .context("Failed to initialize server")?;

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        let _ = shutdown.send(());
    });

    server.run().await.context("Server error")?;
    Ok(())
}

fn keygen(config: &Config, force: bool) -> anyhow::Result<()> {
    let path = config.private_key_path();
    let identity = generate_private_key(&path, force)?;
    info!("Wrote private key to {}", path.display());
    println!("{}", identity);
    Ok(())
}

async fn pair(config: &Config, host: &str) -> anyhow::Result<()> {
    let local = load_identity(&config.private_key_path())?;
    let store = PeerStore::open(config.peers_dir())?;
    let client = PairingClient::new(config.sync_timeout())?;

    let paired = client.pair(host, &local, &store).await?;
    info!("Paired with {} at {}", paired.identity, paired.host);
    println!("{}", paired.identity);
    Ok(())
}

fn plan(config: &Config) -> anyhow::Result<()> {
    let local = load_identity(&config.private_key_path())?;
    let store = PeerStore::open(config.peers_dir())?;
    let settings = TunnelSettings {
        interface: config.interface.clone(),
        listen_port: config.wg_port,
        private_key: config.private_key_path(),
    };
    let exists = Path::new("/sys/class/net").join(&config.interface).exists();

    for line in render_plan(&local, &settings, &store.list(), exists)? {
        println!("{}", line);
    }
    Ok(())
}

fn pending(config: &Config) -> anyhow::Result<()> {
    let pending = PendingLinks::new(config.pending_dir());
    for identity in pending.list()? {
        println!("{}", identity);
    }
    Ok(())
}
