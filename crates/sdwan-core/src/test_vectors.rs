//! Fixed addressing vectors
//!
//! Every branch derives tunnel addresses on its own, so these outputs must
//! never change between releases.

use crate::address::*;
use crate::identity::Identity;
use std::net::Ipv6Addr;

const ZERO: Identity = Identity::from_bytes([0x00; 32]);
const ONES: Identity = Identity::from_bytes([0xff; 32]);

#[test]
fn vector_extreme_identities() {
    let pair = link_local_pair(&ZERO, &ONES).unwrap();

    let expected_low: Ipv6Addr = "fe80:ffff:ffff:ffff:ffff:ffff:ffff:fffd".parse().unwrap();
    let expected_high: Ipv6Addr = "fe80:ffff:ffff:ffff:ffff:ffff:ffff:fffe".parse().unwrap();

    assert_eq!(pair.local.addr(), expected_low);
    assert_eq!(pair.remote.addr(), expected_high);
    assert_eq!(pair.local.prefix_len(), 126);

    // only the selector bits differ
    let low = pair.local.addr().octets();
    let high = pair.remote.addr().octets();
    assert_eq!(low[..15], high[..15]);
    assert_eq!(low[15] & !0b11, high[15] & !0b11);
    assert_eq!(low[15] & 0b11, 0b01);
    assert_eq!(high[15] & 0b11, 0b10);
}

#[test]
fn vector_extreme_identities_reversed() {
    let pair = link_local_pair(&ONES, &ZERO).unwrap();
    assert_eq!(pair.local.addr().octets()[15] & 0b11, 0b10);
    assert_eq!(pair.remote.addr().octets()[15] & 0b11, 0b01);
}

#[test]
fn vector_global_addresses() {
    assert_eq!(
        global_address(&ZERO).addr(),
        "fc00:a7a0::".parse::<Ipv6Addr>().unwrap()
    );
    assert_eq!(
        global_address(&ONES).addr(),
        "fc00:a7a0:ffff:ffff:ffff:ffff:ffff:ffff".parse::<Ipv6Addr>().unwrap()
    );

    let mut counting = [0u8; 32];
    for (i, b) in counting.iter_mut().enumerate() {
        *b = i as u8 + 1;
    }
    assert_eq!(
        global_address(&Identity(counting)).addr(),
        "fc00:a7a0:102:304:506:708:90a:b0c".parse::<Ipv6Addr>().unwrap()
    );
}

#[test]
fn vector_network_of_pair() {
    let pair = link_local_pair(&ZERO, &ONES).unwrap();
    assert_eq!(
        pair.network().to_string(),
        "fe80:ffff:ffff:ffff:ffff:ffff:ffff:fffc/126"
    );
}
