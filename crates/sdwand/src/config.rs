//! Configuration for sdwand

use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// sdwand - Branch mesh overlay controller
#[derive(Parser, Debug, Clone)]
#[command(name = "sdwand")]
#[command(about = "Branch mesh overlay controller")]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Listen address for the HTTP front door
    #[arg(short, long, env = "SDWAN_LISTEN", default_value = "[::]:8080")]
    pub listen: SocketAddr,

    /// Data directory holding peers/, pending/ and state.sled
    #[arg(short, long, env = "SDWAN_DATA_DIR", default_value = ".", global = true)]
    pub data_dir: PathBuf,

    /// WireGuard private key file (base64), relative to the data directory
    #[arg(long, env = "SDWAN_PRIVATE_KEY", default_value = "wireguard/private", global = true)]
    pub private_key: PathBuf,

    /// Directory scanned for `*.pub` SSH keys, relative to the data directory
    #[arg(long, env = "SDWAN_SSH_DIR", default_value = ".ssh")]
    pub ssh_dir: PathBuf,

    /// Name of the mesh tunnel interface
    #[arg(long, default_value = "avaron", global = true)]
    pub interface: String,

    /// WireGuard listen port on every branch
    #[arg(long, default_value = "51820", global = true)]
    pub wg_port: u16,

    /// Gossip interval in seconds
    #[arg(long, default_value = "5")]
    pub sync_interval_secs: u64,

    /// Timeout for a single gossip fetch in seconds
    #[arg(long, default_value = "10")]
    pub sync_timeout_secs: u64,

    /// Port peers serve the topology export on
    #[arg(long, default_value = "8080")]
    pub gossip_port: u16,

    /// Address used to reach peers for gossip
    #[arg(long, value_enum, default_value_t = GossipTarget::Mesh)]
    pub gossip_target: GossipTarget,

    /// How often the peers directory is rescanned, in seconds
    #[arg(long, default_value = "30")]
    pub rescan_interval_secs: u64,

    /// Maximum concurrently served connections
    #[arg(long, default_value = "256")]
    pub admission_capacity: usize,

    /// Connection grace period on an idle server, in seconds
    #[arg(long, default_value = "60")]
    pub admission_timeout_secs: u64,

    /// Diagnostics interval in seconds
    #[arg(long, default_value = "60")]
    pub health_interval_secs: u64,

    /// Number of diagnostics transcripts kept
    #[arg(long, default_value = "64")]
    pub health_history: usize,

    /// Base URL of a llama.cpp-compatible inference server (diagnostics are
    /// disabled without one)
    #[arg(long, env = "SDWAN_LLM_URL")]
    pub llm_url: Option<String>,

    /// Model name sent with completion requests
    #[arg(long, default_value = "mixtral.gguf")]
    pub llm_model: String,

    /// Run shell commands proposed by the diagnostics model
    #[arg(long)]
    pub diagnostics_exec: bool,

    /// Maximum model rounds per diagnostics tick
    #[arg(long, default_value = "3")]
    pub max_rounds: usize,

    /// Geolocation service queried once at startup
    #[arg(long, env = "SDWAN_WHOIS_URL")]
    pub whois_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: String,
}

/// Controller actions
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the daemon (default)
    Run,
    /// Generate a WireGuard private key and print the node identity
    Keygen {
        /// Overwrite an existing key
        #[arg(long)]
        force: bool,
    },
    /// Pair with another branch: fetch its keys, record it, and send our identity
    Pair {
        /// Target branch as host or host:port
        host: String,
    },
    /// Print the tunnel configuration plan for the known peers
    Plan,
    /// List pending inbound link requests
    Pending,
}

/// Which address gossip requests are sent to
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum GossipTarget {
    /// The peer's global address inside the mesh
    Mesh,
    /// The underlay endpoint recorded at pairing time
    Endpoint,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.admission_capacity == 0 {
            anyhow::bail!("Admission capacity must be at least 1");
        }
        if self.admission_timeout_secs == 0 {
            anyhow::bail!("Admission timeout cannot be zero");
        }
        if self.sync_interval_secs == 0 || self.rescan_interval_secs == 0 {
            anyhow::bail!("Gossip intervals cannot be zero");
        }
        if self.sync_timeout_secs == 0 {
            anyhow::bail!("Gossip timeout cannot be zero");
        }
        if self.health_interval_secs == 0 {
            anyhow::bail!("Diagnostics interval cannot be zero");
        }
        if self.health_history == 0 {
            anyhow::bail!("Diagnostics history must keep at least one transcript");
        }
        if self.max_rounds == 0 {
            anyhow::bail!("Diagnostics need at least one model round");
        }
        if self.interface.is_empty() {
            anyhow::bail!("Tunnel interface name cannot be empty");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("Unknown log format '{}' (expected json or pretty)", self.log_format);
        }
        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.resolve(&self.private_key)
    }

    pub fn ssh_dir_path(&self) -> PathBuf {
        self.resolve(&self.ssh_dir)
    }

    pub fn peers_dir(&self) -> PathBuf {
        self.data_dir.join("peers")
    }

    pub fn pending_dir(&self) -> PathBuf {
        self.data_dir.join("pending")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.sled")
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.admission_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["sdwand"]).unwrap();
        assert!(config.command.is_none());
        assert_eq!(config.listen.port(), 8080);
        assert_eq!(config.admission_capacity, 256);
        assert_eq!(config.admission_timeout(), Duration::from_secs(60));
        assert_eq!(config.sync_interval(), Duration::from_secs(5));
        assert_eq!(config.gossip_target, GossipTarget::Mesh);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_paths_resolve_against_data_dir() {
        let config =
            Config::try_parse_from(["sdwand", "--data-dir", "/srv/branch", "--private-key", "/etc/wg/key"])
                .unwrap();
        assert_eq!(config.private_key_path(), PathBuf::from("/etc/wg/key"));
        assert_eq!(config.ssh_dir_path(), PathBuf::from("/srv/branch/.ssh"));
        assert_eq!(config.peers_dir(), PathBuf::from("/srv/branch/peers"));
    }

    #[test]
    fn test_subcommand_parsing() {
        let config = Config::try_parse_from(["sdwand", "pair", "10.0.0.2:8080"]).unwrap();
        assert_eq!(
            config.command,
            Some(Command::Pair {
                host: "10.0.0.2:8080".into()
            })
        );

        let config = Config::try_parse_from(["sdwand", "keygen", "--force", "--data-dir", "/tmp/x"]).unwrap();
        assert_eq!(config.command, Some(Command::Keygen { force: true }));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = Config::try_parse_from(["sdwand", "--admission-capacity", "0"]).unwrap();
        assert!(config.validate().is_err());

        let config = Config::try_parse_from(["sdwand", "--log-format", "xml"]).unwrap();
        assert!(config.validate().is_err());
    }
}
