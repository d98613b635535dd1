//! Deterministic tunnel addressing derived from node identities
//!
//! No allocator is involved: any two nodes that know each other's identity
//! compute the same point-to-point pair independently.

use crate::identity::Identity;
use ipnet::Ipv6Net;
use std::cmp::Ordering;
use std::net::Ipv6Addr;
use thiserror::Error;

/// Mesh-wide ULA prefix (`fc00:a7a0::/32`)
pub const MESH_PREFIX: [u8; 4] = [0xfc, 0x00, 0xa7, 0xa0];

/// Prefix length of the mesh ULA network
pub const MESH_PREFIX_LEN: u8 = 32;

/// Link-local prefix bytes (`fe80::`)
pub const LINK_LOCAL_PREFIX: [u8; 2] = [0xfe, 0x80];

/// Prefix length of a point-to-point tunnel network
pub const PEER_TO_PEER_PREFIX_LEN: u8 = 126;

/// Low-order selector given to the lexicographically smaller identity
pub const LOWER_SELECTOR: u8 = 0b01;

/// Low-order selector given to the lexicographically larger identity
pub const UPPER_SELECTOR: u8 = 0b10;

const SELECTOR_MASK: u8 = 0b11;

/// Addressing errors
///
/// These are caller defects, not runtime conditions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("refusing to derive a link-local pair for identity {0} with itself")]
    SelfPair(Identity),
}

/// Network holding every global address (`fc00:a7a0::/32`)
pub fn mesh_network() -> Ipv6Net {
    let mut octets = [0u8; 16];
    octets[..MESH_PREFIX.len()].copy_from_slice(&MESH_PREFIX);
    network(Ipv6Addr::from(octets), MESH_PREFIX_LEN)
}

// Prefix lengths used here are constants no larger than 128.
fn network(addr: Ipv6Addr, prefix_len: u8) -> Ipv6Net {
    Ipv6Net::new(addr, prefix_len).unwrap_or_else(|_| Ipv6Net::from(addr))
}

/// Derive a node's /128 global address inside the mesh ULA prefix.
///
/// The host part is the first 12 bytes of the identity.
pub fn global_address(id: &Identity) -> Ipv6Net {
    let mut octets = [0u8; 16];
    octets[..MESH_PREFIX.len()].copy_from_slice(&MESH_PREFIX);
    octets[MESH_PREFIX.len()..].copy_from_slice(&id.as_bytes()[..16 - MESH_PREFIX.len()]);
    Ipv6Net::from(Ipv6Addr::from(octets))
}

/// Link-local addresses for the two ends of one tunnel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkLocalPair {
    /// Address of the first identity passed to [`link_local_pair`]
    pub local: Ipv6Net,
    /// Address of the second identity passed to [`link_local_pair`]
    pub remote: Ipv6Net,
}

impl LinkLocalPair {
    /// The shared /126 network both addresses live in
    pub fn network(&self) -> Ipv6Net {
        self.local.trunc()
    }

    /// Same pair seen from the other side
    pub fn swapped(self) -> Self {
        Self {
            local: self.remote,
            remote: self.local,
        }
    }
}

/// Derive the link-local pair for the tunnel between `a` and `b`.
///
/// The shared bits are the byte-wise XOR of both identities, so each side
/// computes the same value. The lowest two bits select the side: the smaller
/// identity gets `01`, the larger `10`. Swapping the arguments swaps the
/// returned addresses and nothing else.
pub fn link_local_pair(a: &Identity, b: &Identity) -> Result<LinkLocalPair, AddressError> {
    let (a_selector, b_selector) = match a.cmp(b) {
        Ordering::Less => (LOWER_SELECTOR, UPPER_SELECTOR),
        Ordering::Greater => (UPPER_SELECTOR, LOWER_SELECTOR),
        Ordering::Equal => return Err(AddressError::SelfPair(*a)),
    };

    let mut shared = [0u8; 16];
    shared[..LINK_LOCAL_PREFIX.len()].copy_from_slice(&LINK_LOCAL_PREFIX);
    let window = 16 - LINK_LOCAL_PREFIX.len();
    for (i, (x, y)) in a.as_bytes()[..window]
        .iter()
        .zip(&b.as_bytes()[..window])
        .enumerate()
    {
        shared[i + LINK_LOCAL_PREFIX.len()] = x ^ y;
    }

    let with_selector = |selector: u8| {
        let mut octets = shared;
        octets[15] = (octets[15] & !SELECTOR_MASK) | selector;
        network(Ipv6Addr::from(octets), PEER_TO_PEER_PREFIX_LEN)
    };

    Ok(LinkLocalPair {
        local: with_selector(a_selector),
        remote: with_selector(b_selector),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u8) -> Identity {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = seed.wrapping_mul(31).wrapping_add(i as u8);
        }
        Identity(bytes)
    }

    #[test]
    fn test_global_address_in_mesh_prefix() {
        let a = id(1);
        let addr = global_address(&a);
        assert_eq!(addr.prefix_len(), 128);
        assert!(mesh_network().contains(&addr));
        assert_eq!(&addr.addr().octets()[4..], &a.as_bytes()[..12]);
        assert_eq!(global_address(&a), addr);
    }

    #[test]
    fn test_pair_symmetric() {
        for seed in 0..32u8 {
            let a = id(seed);
            let b = id(seed.wrapping_add(101));
            let ab = link_local_pair(&a, &b).unwrap();
            let ba = link_local_pair(&b, &a).unwrap();
            assert_eq!(ab, ba.swapped());
            assert_ne!(ab.local.addr(), ab.remote.addr());
            assert_eq!(ab.network(), ab.remote.trunc());
        }
    }

    #[test]
    fn test_pair_rejects_self() {
        let a = id(9);
        assert_eq!(link_local_pair(&a, &a), Err(AddressError::SelfPair(a)));
    }

    #[test]
    fn test_smaller_identity_gets_lower_selector() {
        let mut low = [0u8; 32];
        let mut high = [0u8; 32];
        low[20] = 1;
        high[20] = 2;
        // identical inside the address window, differ only past it
        let pair = link_local_pair(&Identity(high), &Identity(low)).unwrap();
        assert_eq!(pair.remote.addr().octets()[15] & 0b11, LOWER_SELECTOR);
        assert_eq!(pair.local.addr().octets()[15] & 0b11, UPPER_SELECTOR);
    }

    #[test]
    fn test_pair_is_link_local() {
        let pair = link_local_pair(&id(4), &id(5)).unwrap();
        let link_local: Ipv6Net = "fe80::/10".parse().unwrap();
        assert!(link_local.contains(&pair.local.addr()));
        assert_eq!(pair.local.prefix_len(), PEER_TO_PEER_PREFIX_LEN);
    }
}
