//! Local topology probing
//!
//! [`LocalProbe`] assembles this node's [`TopologySnapshot`] from `ip`,
//! `ethtool`, `wg`, `/proc/net/route` and the kernel hostname. Every section
//! is best effort: a failing command leaves its section empty and logs a
//! warning, so the export never fails because one tool is missing.

use async_trait::async_trait;
use ipnet::{IpNet, Ipv4Net};
use sdwan_core::{
    Identity, IdentityError, Location, NetInterface, Route, TcpMetric, TopologySnapshot,
    TunnelInterface, TunnelPeer,
};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Probe errors
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{program} exited with {status}: {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Cannot parse '{line}': {reason}")]
    Parse { line: String, reason: String },
    #[error("Bad key in tool output: {0}")]
    Identity(#[from] IdentityError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

fn parse_error(line: &str, reason: impl Into<String>) -> ProbeError {
    ProbeError::Parse {
        line: line.to_string(),
        reason: reason.into(),
    }
}

/// Something that can produce this node's current snapshot
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> TopologySnapshot;
}

/// Runs external programs and returns their stdout
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>, ProbeError>;
}

/// [`CommandRunner`] backed by real processes
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>, ProbeError> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(ProbeError::Command {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Parse the text output of `wg show`, keyed by each interface's public key.
///
/// Interfaces without a public key (no private key configured yet) are
/// skipped.
pub fn parse_wg_show(text: &str) -> Result<BTreeMap<Identity, TunnelInterface>, ProbeError> {
    #[derive(Clone, Copy)]
    enum Section {
        None,
        Interface,
        Peer(Identity),
    }

    let mut parsed: Vec<(Option<Identity>, TunnelInterface)> = Vec::new();
    let mut section = Section::None;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            section = Section::None;
            continue;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| parse_error(line, "missing ':'"))?;
        let value = value.trim();

        match (section, key) {
            (_, "interface") => {
                parsed.push((
                    None,
                    TunnelInterface {
                        name: value.to_string(),
                        ..Default::default()
                    },
                ));
                section = Section::Interface;
            }
            (_, "peer") => {
                let (_, interface) = parsed
                    .last_mut()
                    .ok_or_else(|| parse_error(line, "peer before any interface"))?;
                let identity: Identity = value.parse()?;
                interface.peers.insert(identity, TunnelPeer::default());
                section = Section::Peer(identity);
            }
            (Section::None, _) => return Err(parse_error(line, "field outside a section")),
            (Section::Interface, field) => {
                // present whenever the section was opened
                let Some((public_key, interface)) = parsed.last_mut() else {
                    continue;
                };
                match field {
                    "public key" => *public_key = Some(value.parse()?),
                    "listening port" => {
                        interface.listening_port = value
                            .parse()
                            .map_err(|_| parse_error(line, "bad port"))?;
                    }
                    _ => {}
                }
            }
            (Section::Peer(identity), field) => {
                let Some(peer) = parsed
                    .last_mut()
                    .and_then(|(_, interface)| interface.peers.get_mut(&identity))
                else {
                    continue;
                };
                match field {
                    "endpoint" => peer.endpoint = Some(value.to_string()),
                    "allowed ips" => {
                        for cidr in value.split(", ").filter(|s| *s != "(none)") {
                            let net: IpNet = cidr
                                .parse()
                                .map_err(|_| parse_error(line, format!("bad CIDR {}", cidr)))?;
                            peer.allowed_ips.push(net.trunc());
                        }
                    }
                    "latest handshake" => peer.latest_handshake = Some(value.to_string()),
                    "transfer" => {
                        let (received, sent) = value
                            .split_once(", ")
                            .ok_or_else(|| parse_error(line, "expected 'rx, tx'"))?;
                        peer.received = Some(received.trim_end_matches(" received").to_string());
                        peer.sent = Some(sent.trim_end_matches(" sent").to_string());
                    }
                    "persistent keepalive" => {
                        peer.persistent_keepalive = Some(value.to_string())
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(parsed
        .into_iter()
        .filter_map(|(key, interface)| match key {
            Some(key) => Some((key, interface)),
            None => {
                debug!("wg interface {} has no public key", interface.name);
                None
            }
        })
        .collect())
}

fn proc_ipv4(field: &str, line: &str) -> Result<Ipv4Addr, ProbeError> {
    let value =
        u32::from_str_radix(field, 16).map_err(|_| parse_error(line, format!("bad hex {}", field)))?;
    // the kernel prints the network-order word in host byte order
    Ok(Ipv4Addr::from(value.to_ne_bytes()))
}

/// Parse `/proc/net/route`
pub fn parse_proc_routes(text: &str) -> Result<Vec<Route>, ProbeError> {
    let mut lines = text.lines();
    let header = lines.next().unwrap_or_default();
    if !header.starts_with("Iface") {
        return Err(parse_error(header, "missing header"));
    }

    let mut routes = Vec::new();
    for line in lines.filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            return Err(parse_error(line, "expected at least 8 fields"));
        }

        let destination = proc_ipv4(fields[1], line)?;
        let gateway = proc_ipv4(fields[2], line)?;
        let flags = u16::from_str_radix(fields[3], 16)
            .map_err(|_| parse_error(line, "bad flags"))?;
        let metric = fields[6]
            .parse()
            .map_err(|_| parse_error(line, "bad metric"))?;

        let mask = u32::from(proc_ipv4(fields[7], line)?);
        let prefix = mask.leading_ones();
        if mask.count_ones() != prefix {
            return Err(parse_error(line, "non-contiguous netmask"));
        }
        let destination = Ipv4Net::new(destination, prefix as u8)
            .map_err(|e| parse_error(line, e.to_string()))?;

        routes.push(Route {
            interface: fields[0].to_string(),
            destination,
            gateway,
            flags,
            metric,
        });
    }
    Ok(routes)
}

/// Extract `(speed, link detected)` from `ethtool --json <dev>` output
pub fn parse_ethtool(output: &[u8]) -> Result<(Option<u32>, Option<bool>), ProbeError> {
    let value: serde_json::Value = serde_json::from_slice(output)?;
    let Some(device) = value.as_array().and_then(|devices| devices.first()) else {
        return Ok((None, None));
    };
    let speed = device
        .get("speed")
        .and_then(|s| s.as_u64())
        .and_then(|s| u32::try_from(s).ok());
    let link_detected = device.get("link-detected").and_then(|l| l.as_bool());
    Ok((speed, link_detected))
}

/// Resolve the node's public location from an ipwho.is-style service
pub async fn locate(http: &reqwest::Client, url: &str) -> Result<Location, ProbeError> {
    let location = http
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .json::<Location>()
        .await?;
    debug!("Located at {}, {}", location.city, location.country);
    Ok(location)
}

/// Production [`SnapshotSource`]
pub struct LocalProbe {
    runner: Arc<dyn CommandRunner>,
    route_table: PathBuf,
    hostname_file: PathBuf,
    location: Option<Location>,
}

impl LocalProbe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            route_table: PathBuf::from("/proc/net/route"),
            hostname_file: PathBuf::from("/proc/sys/kernel/hostname"),
            location: None,
        }
    }

    /// Read routes and hostname from other files
    pub fn with_paths(mut self, route_table: impl Into<PathBuf>, hostname_file: impl Into<PathBuf>) -> Self {
        self.route_table = route_table.into();
        self.hostname_file = hostname_file.into();
        self
    }

    pub fn with_location(mut self, location: Option<Location>) -> Self {
        self.location = location;
        self
    }

    async fn hostname(&self) -> String {
        match tokio::fs::read_to_string(&self.hostname_file).await {
            Ok(name) => name.trim().to_string(),
            Err(e) => {
                warn!("Error reading hostname: {}", e);
                String::new()
            }
        }
    }

    async fn interfaces(&self) -> Result<BTreeMap<String, NetInterface>, ProbeError> {
        let output = self
            .runner
            .run("ip", &["-json", "-s", "-d", "address", "show"])
            .await?;
        let links: Vec<NetInterface> = serde_json::from_slice(&output)?;

        let mut interfaces = BTreeMap::new();
        for mut link in links {
            if link.link_type == "ether" && link.ifname != "lo" {
                match self.runner.run("ethtool", &["--json", &link.ifname]).await {
                    Ok(output) => match parse_ethtool(&output) {
                        Ok((speed, detected)) => {
                            link.speed = speed;
                            link.link_detected = detected;
                        }
                        Err(e) => warn!("Bad ethtool output for {}: {}", link.ifname, e),
                    },
                    Err(e) => debug!("ethtool {} failed: {}", link.ifname, e),
                }
            }
            interfaces.insert(link.ifname.clone(), link);
        }
        Ok(interfaces)
    }

    async fn metrics(&self) -> Result<Vec<TcpMetric>, ProbeError> {
        let output = self.runner.run("ip", &["-json", "tcpmetrics"]).await?;
        Ok(serde_json::from_slice(&output)?)
    }

    async fn tunnels(&self) -> Result<BTreeMap<Identity, TunnelInterface>, ProbeError> {
        let output = self.runner.run("wg", &["show"]).await?;
        parse_wg_show(&String::from_utf8_lossy(&output))
    }

    async fn routes(&self) -> Result<Vec<Route>, ProbeError> {
        let text = tokio::fs::read_to_string(&self.route_table).await?;
        parse_proc_routes(&text)
    }
}

fn or_empty<T: Default>(section: &str, result: Result<T, ProbeError>) -> T {
    result.unwrap_or_else(|e| {
        warn!("Probing {} failed: {}", section, e);
        T::default()
    })
}

#[async_trait]
impl SnapshotSource for LocalProbe {
    async fn snapshot(&self) -> TopologySnapshot {
        let (name, interfaces, metrics, tunnels, routes) = tokio::join!(
            self.hostname(),
            self.interfaces(),
            self.metrics(),
            self.tunnels(),
            self.routes(),
        );

        TopologySnapshot {
            name,
            location: self.location.clone(),
            interfaces: or_empty("interfaces", interfaces),
            tunnels: or_empty("tunnels", tunnels),
            metrics: or_empty("tcp metrics", metrics),
            routes: or_empty("routes", routes),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// Canned command output keyed by `program arg arg...`
    #[derive(Default)]
    pub(crate) struct FakeRunner {
        pub outputs: HashMap<String, Vec<u8>>,
    }

    impl FakeRunner {
        pub fn with(mut self, command: &str, output: &str) -> Self {
            self.outputs.insert(command.to_string(), output.as_bytes().to_vec());
            self
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<Vec<u8>, ProbeError> {
            let mut key = program.to_string();
            for arg in args {
                key.push(' ');
                key.push_str(arg);
            }
            self.outputs.get(&key).cloned().ok_or(ProbeError::Command {
                program: key,
                status: "exit status: 127".into(),
                stderr: "not found".into(),
            })
        }
    }

    const WG_SHOW: &str = "interface: wg0
  public key: IY/C7eZfk3/YJbiExUQY39zMjPqn77sXoKUWKm70Vw4=
  private key: (hidden)
  listening port: 49544

peer: h7HfpSlMu/99KnouS6s8Ugcmemmw2rvND9jrwTvv7UE=
  preshared key: (hidden)
  endpoint: 45.77.215.144:51820
  allowed ips: 10.0.0.0/24, fd00::1/128
  latest handshake: 1 minute, 27 seconds ago
  transfer: 2.47 GiB received, 54.44 MiB sent
  persistent keepalive: every 25 seconds

interface: avaron
  public key: gnH2O6at5ezSKaUezd/c1FpeO8gtYdRXtpo1Km/nxXg=
  private key: (hidden)
  listening port: 51820
";

    const PROC_ROUTE: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0100000A\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0000000A\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
";

    #[test]
    fn test_parse_wg_show() {
        let tunnels = parse_wg_show(WG_SHOW).unwrap();
        assert_eq!(tunnels.len(), 2);

        let wg0: Identity = "IY/C7eZfk3/YJbiExUQY39zMjPqn77sXoKUWKm70Vw4=".parse().unwrap();
        let peer: Identity = "h7HfpSlMu/99KnouS6s8Ugcmemmw2rvND9jrwTvv7UE=".parse().unwrap();
        let interface = &tunnels[&wg0];
        assert_eq!(interface.name, "wg0");
        assert_eq!(interface.listening_port, 49544);

        let p = &interface.peers[&peer];
        assert_eq!(p.endpoint.as_deref(), Some("45.77.215.144:51820"));
        assert_eq!(
            p.allowed_ips,
            vec!["10.0.0.0/24".parse::<IpNet>().unwrap(), "fd00::1/128".parse().unwrap()]
        );
        assert_eq!(p.received.as_deref(), Some("2.47 GiB"));
        assert_eq!(p.sent.as_deref(), Some("54.44 MiB"));
        assert_eq!(p.persistent_keepalive.as_deref(), Some("every 25 seconds"));

        let avaron: Identity = "gnH2O6at5ezSKaUezd/c1FpeO8gtYdRXtpo1Km/nxXg=".parse().unwrap();
        assert!(tunnels[&avaron].peers.is_empty());
    }

    #[test]
    fn test_parse_wg_show_rejects_garbage() {
        assert!(parse_wg_show("interface wg0\n").is_err());
        assert!(parse_wg_show("peer: h7HfpSlMu/99KnouS6s8Ugcmemmw2rvND9jrwTvv7UE=\n").is_err());
        assert!(parse_wg_show("interface: wg0\n  public key: short\n").is_err());
    }

    #[test]
    fn test_parse_proc_routes() {
        let routes = parse_proc_routes(PROC_ROUTE).unwrap();
        assert_eq!(routes.len(), 2);

        assert_eq!(routes[0].destination, "0.0.0.0/0".parse::<Ipv4Net>().unwrap());
        assert_eq!(routes[0].gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(routes[0].flags, 3);
        assert_eq!(routes[0].metric, 100);

        assert_eq!(routes[1].destination, "10.0.0.0/24".parse::<Ipv4Net>().unwrap());
        assert_eq!(routes[1].gateway, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_non_contiguous_mask_rejected() {
        let text = "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask
eth0\t0000000A\t00000000\t0001\t0\t0\t0\t00FF00FF
";
        assert!(matches!(parse_proc_routes(text), Err(ProbeError::Parse { .. })));
    }

    #[test]
    fn test_parse_ethtool() {
        let output = br#"[{"ifname":"eth0","speed":1000,"duplex":"Full","link-detected":true}]"#;
        assert_eq!(parse_ethtool(output).unwrap(), (Some(1000), Some(true)));
        assert_eq!(parse_ethtool(b"[]").unwrap(), (None, None));
        assert!(parse_ethtool(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_local_probe_snapshot() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("route"), PROC_ROUTE).unwrap();
        std::fs::write(dir.path().join("hostname"), "branch-a\n").unwrap();

        let runner = FakeRunner::default()
            .with(
                "ip -json -s -d address show",
                r#"[{"ifindex":1,"ifname":"lo","operstate":"UNKNOWN","link_type":"loopback"},
                    {"ifindex":2,"ifname":"eth0","operstate":"UP","link_type":"ether"}]"#,
            )
            .with("ethtool --json eth0", r#"[{"speed":100,"link-detected":true}]"#)
            .with("ip -json tcpmetrics", r#"[{"dst":"10.0.0.1","rtt":0.01}]"#)
            .with("wg show", WG_SHOW);

        let probe = LocalProbe::new(Arc::new(runner))
            .with_paths(dir.path().join("route"), dir.path().join("hostname"));
        let snapshot = probe.snapshot().await;

        assert_eq!(snapshot.name, "branch-a");
        assert_eq!(snapshot.interfaces.len(), 2);
        assert_eq!(snapshot.interfaces["eth0"].speed, Some(100));
        assert_eq!(snapshot.interfaces["lo"].speed, None);
        assert_eq!(snapshot.metrics[0].destination, "10.0.0.1");
        assert_eq!(snapshot.tunnels.len(), 2);
        assert_eq!(snapshot.routes.len(), 2);
    }

    #[tokio::test]
    async fn test_failing_tools_degrade_to_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("hostname"), "branch-b").unwrap();

        let probe = LocalProbe::new(Arc::new(FakeRunner::default()))
            .with_paths(dir.path().join("missing"), dir.path().join("hostname"))
            .with_location(Some(Location {
                city: "Lisbon".into(),
                ..Default::default()
            }));
        let snapshot = probe.snapshot().await;

        assert_eq!(snapshot.name, "branch-b");
        assert!(snapshot.interfaces.is_empty());
        assert!(snapshot.tunnels.is_empty());
        assert!(snapshot.routes.is_empty());
        assert_eq!(snapshot.location.unwrap().city, "Lisbon");
    }
}
