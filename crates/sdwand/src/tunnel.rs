//! Tunnel configuration plan
//!
//! Renders the `ip`/`wg` commands that bring the mesh interface up and wire
//! one point-to-point tunnel per known peer. Rendering is pure; applying the
//! plan is left to the operator or provisioning tooling.

use crate::peer_store::PeerRecord;
use sdwan_core::{global_address, link_local_pair, mesh_network, AddressError, Identity};
use std::path::PathBuf;

/// Local interface parameters
#[derive(Clone, Debug)]
pub struct TunnelSettings {
    pub interface: String,
    /// WireGuard port, assumed identical on every branch
    pub listen_port: u16,
    pub private_key: PathBuf,
}

/// Render the configuration commands for `local` and its peers.
///
/// `interface_exists` skips the `ip link add` step on a node that already
/// has the interface.
pub fn render_plan(
    local: &Identity,
    settings: &TunnelSettings,
    peers: &[PeerRecord],
    interface_exists: bool,
) -> Result<Vec<String>, AddressError> {
    let iface = &settings.interface;
    let global = global_address(local);
    let mut plan = Vec::new();

    if !interface_exists {
        plan.push(format!("ip link add dev {} type wireguard", iface));
    }
    plan.push(format!("ip address replace dev {} {}", iface, global));
    plan.push(format!(
        "wg set {} listen-port {} private-key {}",
        iface,
        settings.listen_port,
        settings.private_key.display()
    ));
    plan.push(format!("ip link set up dev {}", iface));
    plan.push(format!(
        "ip route replace {} dev {} src {}",
        mesh_network(),
        iface,
        global.addr()
    ));

    for peer in peers {
        let pair = link_local_pair(local, &peer.identity)?;
        let remote_global = global_address(&peer.identity);

        let mut wg = format!("wg set {} peer {}", iface, peer.identity);
        if let Some(endpoint) = peer.endpoint_with_port(settings.listen_port) {
            wg.push_str(&format!(" endpoint {}", endpoint));
        }
        wg.push_str(&format!(
            " allowed-ips {},{}/128",
            remote_global,
            pair.remote.addr()
        ));
        plan.push(wg);

        plan.push(format!("ip address replace dev {} {}", iface, pair.local));
        plan.push(format!(
            "ip route replace {} via {} dev {}",
            remote_global,
            pair.remote.addr(),
            iface
        ));
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TunnelSettings {
        TunnelSettings {
            interface: "avaron".into(),
            listen_port: 51820,
            private_key: PathBuf::from("wireguard/private"),
        }
    }

    fn record(identity: Identity, endpoint: Option<&str>) -> PeerRecord {
        PeerRecord {
            identity,
            endpoint: endpoint.map(str::to_string),
            ssh_keys: None,
            snapshot: None,
        }
    }

    #[test]
    fn test_plan_without_peers() {
        let local = Identity::from_bytes([0x11; 32]);
        let plan = render_plan(&local, &settings(), &[], false).unwrap();
        assert_eq!(
            plan,
            vec![
                "ip link add dev avaron type wireguard".to_string(),
                "ip address replace dev avaron fc00:a7a0:1111:1111:1111:1111:1111:1111/128".into(),
                "wg set avaron listen-port 51820 private-key wireguard/private".into(),
                "ip link set up dev avaron".into(),
                "ip route replace fc00:a7a0::/32 dev avaron src fc00:a7a0:1111:1111:1111:1111:1111:1111"
                    .into(),
            ]
        );

        let plan = render_plan(&local, &settings(), &[], true).unwrap();
        assert_eq!(plan.len(), 4);
        assert!(!plan[0].contains("link add"));
    }

    #[test]
    fn test_plan_per_peer_commands() {
        let local = Identity::from_bytes([0x00; 32]);
        let remote = Identity::from_bytes([0xff; 32]);
        let peers = vec![record(remote, Some("2001:db8::7"))];

        let plan = render_plan(&local, &settings(), &peers, true).unwrap();
        let tail = &plan[plan.len() - 3..];
        assert_eq!(
            tail[0],
            format!(
                "wg set avaron peer {} endpoint [2001:db8::7]:51820 \
                 allowed-ips fc00:a7a0:ffff:ffff:ffff:ffff:ffff:ffff/128,fe80:ffff:ffff:ffff:ffff:ffff:ffff:fffe/128",
                remote
            )
        );
        // the smaller identity takes the 01 selector
        assert_eq!(
            tail[1],
            "ip address replace dev avaron fe80:ffff:ffff:ffff:ffff:ffff:ffff:fffd/126"
        );
        assert_eq!(
            tail[2],
            "ip route replace fc00:a7a0:ffff:ffff:ffff:ffff:ffff:ffff/128 \
             via fe80:ffff:ffff:ffff:ffff:ffff:ffff:fffe dev avaron"
        );
    }

    #[test]
    fn test_peer_without_endpoint() {
        let local = Identity::from_bytes([0x01; 32]);
        let peers = vec![record(Identity::from_bytes([0x02; 32]), None)];
        let plan = render_plan(&local, &settings(), &peers, true).unwrap();
        let wg = plan.iter().find(|line| line.contains(" peer ")).unwrap();
        assert!(!wg.contains("endpoint"));
        assert!(wg.contains("allowed-ips "));
    }

    #[test]
    fn test_self_peer_is_an_error() {
        let local = Identity::from_bytes([0x05; 32]);
        let peers = vec![record(local, None)];
        assert_eq!(
            render_plan(&local, &settings(), &peers, true),
            Err(AddressError::SelfPair(local))
        );
    }
}
