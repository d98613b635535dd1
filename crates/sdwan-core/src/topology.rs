//! Topology snapshot types exchanged by gossip
//!
//! A snapshot is one node's self-reported state. Field names follow the JSON
//! the export endpoint has always produced, so older branches keep decoding.

use crate::identity::Identity;
use ipnet::{IpNet, Ipv4Net};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// One node's self-reported state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    /// Hostname
    pub name: String,
    /// Geolocation, when the node could resolve it
    #[serde(default)]
    pub location: Option<Location>,
    /// Network interfaces keyed by interface name
    #[serde(default)]
    pub interfaces: BTreeMap<String, NetInterface>,
    /// WireGuard interfaces keyed by the interface public key
    #[serde(default)]
    pub tunnels: BTreeMap<Identity, TunnelInterface>,
    /// Kernel TCP metrics cache
    #[serde(default)]
    pub metrics: Vec<TcpMetric>,
    /// IPv4 routing table
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// One element of the export array: an identity and what is known about it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopologyEntry {
    pub identity: Identity,
    pub node: TopologySnapshot,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub latitude: f32,
    #[serde(default)]
    pub longitude: f32,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub country: String,
}

/// Network interface as reported by `ip -json address show`, plus the link
/// speed from ethtool where available
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetInterface {
    #[serde(default)]
    pub ifindex: u32,
    pub ifname: String,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub operstate: String,
    #[serde(default)]
    pub link_type: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub addr_info: Vec<AddrInfo>,
    #[serde(default)]
    pub stats64: Option<Stats64>,
    /// Link speed in Mb/s
    #[serde(default)]
    pub speed: Option<u32>,
    #[serde(default)]
    pub link_detected: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AddrInfo {
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub local: String,
    #[serde(default)]
    pub prefixlen: u8,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats64 {
    #[serde(default)]
    pub rx: LinkStats,
    #[serde(default)]
    pub tx: LinkStats,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub packets: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub dropped: u64,
}

/// Entry of the kernel TCP metrics cache
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpMetric {
    #[serde(rename = "dst", default)]
    pub destination: String,
    #[serde(alias = "src", default)]
    pub source: String,
    #[serde(default)]
    pub age: f64,
    #[serde(rename = "cwnd", default)]
    pub congestion_window: u64,
    #[serde(rename = "rtt", default)]
    pub round_trip_time: f64,
    #[serde(rename = "rttvar", default)]
    pub round_trip_time_variance: f64,
}

/// IPv4 route from `/proc/net/route`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub interface: String,
    pub destination: Ipv4Net,
    pub gateway: Ipv4Addr,
    #[serde(default)]
    pub flags: u16,
    #[serde(default)]
    pub metric: u32,
}

/// A WireGuard interface and its peers
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelInterface {
    pub name: String,
    #[serde(rename = "listeningPort", default)]
    pub listening_port: u16,
    #[serde(default)]
    pub peers: BTreeMap<Identity, TunnelPeer>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TunnelPeer {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(rename = "allowedIPs", default)]
    pub allowed_ips: Vec<IpNet>,
    #[serde(rename = "latestHandshake", default)]
    pub latest_handshake: Option<String>,
    #[serde(default)]
    pub received: Option<String>,
    #[serde(default)]
    pub sent: Option<String>,
    #[serde(rename = "persistentKeepalive", default)]
    pub persistent_keepalive: Option<String>,
}

// =============================================================================
// LINK CAPABILITIES
// =============================================================================

/// What kind of backend a link is
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Ethernet,
    Loopback,
    Tunnel,
    Other(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Up,
    Down,
    Unknown,
}

/// Fixed capability set shared by every link backend
pub trait Link {
    /// Stable identifier (interface name, peer identity)
    fn identifier(&self) -> String;
    fn kind(&self) -> LinkKind;
    fn status(&self) -> LinkStatus;
    /// Nominal bandwidth in bits per second, if the backend knows it
    fn bandwidth(&self) -> Option<u64>;
}

/// Serializable view of any [`Link`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkSummary {
    pub identifier: String,
    pub kind: LinkKind,
    pub status: LinkStatus,
    pub bandwidth: Option<u64>,
}

impl LinkSummary {
    pub fn of(link: &dyn Link) -> Self {
        Self {
            identifier: link.identifier(),
            kind: link.kind(),
            status: link.status(),
            bandwidth: link.bandwidth(),
        }
    }
}

impl Link for NetInterface {
    fn identifier(&self) -> String {
        self.ifname.clone()
    }

    fn kind(&self) -> LinkKind {
        match self.link_type.as_str() {
            "ether" => LinkKind::Ethernet,
            "loopback" => LinkKind::Loopback,
            other => LinkKind::Other(other.to_string()),
        }
    }

    fn status(&self) -> LinkStatus {
        match self.operstate.as_str() {
            "UP" => LinkStatus::Up,
            "DOWN" | "LOWERLAYERDOWN" | "NOTPRESENT" => LinkStatus::Down,
            // loopback and wireguard report UNKNOWN; trust the carrier flag
            _ if self.flags.iter().any(|f| f == "LOWER_UP") => LinkStatus::Up,
            _ => LinkStatus::Unknown,
        }
    }

    fn bandwidth(&self) -> Option<u64> {
        self.speed.map(|mbps| u64::from(mbps) * 1_000_000)
    }
}

/// A tunnel peer viewed as a link
pub struct TunnelLink<'a> {
    pub identity: &'a Identity,
    pub peer: &'a TunnelPeer,
}

impl Link for TunnelLink<'_> {
    fn identifier(&self) -> String {
        self.identity.to_string()
    }

    fn kind(&self) -> LinkKind {
        LinkKind::Tunnel
    }

    fn status(&self) -> LinkStatus {
        match self.peer.latest_handshake.as_deref() {
            Some(_) => LinkStatus::Up,
            None => LinkStatus::Down,
        }
    }

    fn bandwidth(&self) -> Option<u64> {
        None
    }
}

impl TopologySnapshot {
    /// Every link this snapshot describes: interfaces first, then tunnel peers
    pub fn links(&self) -> Vec<Box<dyn Link + '_>> {
        let mut links: Vec<Box<dyn Link + '_>> = Vec::new();
        for interface in self.interfaces.values() {
            links.push(Box::new(interface.clone()));
        }
        for tunnel in self.tunnels.values() {
            for (identity, peer) in &tunnel.peers {
                links.push(Box::new(TunnelLink { identity, peer }));
            }
        }
        links
    }
}
