use std::net::{IpAddr, Ipv4Addr};

use ipset_core::helpers::{block_last, canonical};
use ipset_core::{InCoreFormat, IpSet, V6Policy};
use proptest::collection::vec as pvec;
use proptest::prelude::*;

const BASE: u32 = 0xC0A8_0000; // 192.168.0.0/20
const WINDOW: u32 = 4096;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn build(format: InCoreFormat, blocks: &[(u32, u32)]) -> (IpSet, Vec<bool>) {
    let mut s = IpSet::create_with_format(false, format);
    let mut model = vec![false; WINDOW as usize];
    for &(off, prefix) in blocks {
        let start = canonical((BASE + off) as u128, prefix, 32) as u32;
        s.insert_addr(IpAddr::V4(Ipv4Addr::from(start)), prefix).unwrap();
        let last = block_last(start as u128, prefix, 32) as u32;
        for a in start..=last {
            model[(a - BASE) as usize] = true;
        }
    }
    s.clean().unwrap();
    (s, model)
}

fn check(s: &IpSet, model: &[bool]) -> Result<(), TestCaseError> {
    for (i, want) in model.iter().enumerate() {
        let a = IpAddr::V4(Ipv4Addr::from(BASE + i as u32));
        prop_assert_eq!(s.contains_addr(a), *want, "address {}", a);
    }
    prop_assert_eq!(s.count_addresses(), model.iter().filter(|b| **b).count() as u128);
    Ok(())
}

fn formats() -> impl Strategy<Value = InCoreFormat> {
    prop_oneof![Just(InCoreFormat::IpTree), Just(InCoreFormat::Radix)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10))]

    #[test]
    fn algebra_matches_model(
        fa in formats(),
        fb in formats(),
        a in pvec((0u32..WINDOW, 22u32..=32), 0..24),
        b in pvec((0u32..WINDOW, 22u32..=32), 0..24),
    ) {
        let (sa, ma) = build(fa, &a);
        let (sb, mb) = build(fb, &b);

        let mut u = sa.clone();
        u.union_with(&sb).unwrap();
        u.clean().unwrap();
        let mu: Vec<bool> = ma.iter().zip(&mb).map(|(x, y)| *x || *y).collect();
        check(&u, &mu)?;

        let mut i = sa.clone();
        i.intersect_with(&sb).unwrap();
        i.clean().unwrap();
        let mi: Vec<bool> = ma.iter().zip(&mb).map(|(x, y)| *x && *y).collect();
        check(&i, &mi)?;

        let mut d = sa.clone();
        d.subtract(&sb).unwrap();
        d.clean().unwrap();
        let md: Vec<bool> = ma.iter().zip(&mb).map(|(x, y)| *x && !*y).collect();
        check(&d, &md)?;

        prop_assert_eq!(sa.intersects(&sb), mi.iter().any(|b| *b));
    }
}

#[test]
fn mixed_families() {
    let mut v4 = IpSet::create(false);
    v4.insert_addr(ip("10.0.0.0"), 8).unwrap();
    v4.clean().unwrap();

    let mut v6 = IpSet::create(true);
    v6.insert_addr(ip("::ffff:10.20.0.0"), 112).unwrap();
    v6.insert_addr(ip("2001:db8::"), 48).unwrap();
    v6.clean().unwrap();

    // v6 minus v4 leaves only the true IPv6 part
    let mut d = v6.clone();
    d.subtract(&v4).unwrap();
    d.clean().unwrap();
    assert_eq!(d.to_string(), "2001:db8::/48\n");

    // v4 union v6 promotes and keeps both
    let mut u = v4.clone();
    u.union_with(&v6).unwrap();
    u.clean().unwrap();
    assert!(u.is_v6());
    assert!(u.contains_addr(ip("10.1.2.3")));
    assert!(u.contains_addr(ip("2001:db8::42")));

    // the mapped view of the union is the IPv4 content
    let as_v4: Vec<_> = u.iter(true, V6Policy::AsV4).unwrap().collect();
    assert_eq!(as_v4, vec![(ip("10.0.0.0"), 8)]);
}

#[test]
fn promotion_can_be_refused() {
    let mut v4 = IpSet::create(false);
    v4.set_auto_convert(false);
    let err = v4.insert_addr(ip("2001:db8::1"), 128).unwrap_err();
    assert_eq!(err.code(), ipset_core::ErrorCode::Ipv6);
    // mapped addresses still fit
    v4.insert_addr(ip("::ffff:1.2.3.4"), 128).unwrap();
    assert!(v4.contains_addr(ip("1.2.3.4")));
}

#[test]
fn masking() {
    let mut s = IpSet::create_with_format(false, InCoreFormat::Radix);
    s.insert_addr(ip("10.0.0.1"), 32).unwrap();
    s.insert_addr(ip("10.0.3.200"), 32).unwrap();
    s.insert_addr(ip("10.9.0.0"), 16).unwrap();

    let mut filled = s.clone();
    filled.mask_and_fill(24).unwrap();
    assert_eq!(filled.to_string(), "10.0.0.0/24\n10.0.3.0/24\n10.9.0.0/16\n");

    // one address per /24 that met the set; the /16 spans 256 of them
    s.mask(24).unwrap();
    assert_eq!(s.count_addresses(), 2 + 256);
    assert!(s.contains_addr(ip("10.0.3.0")));
    assert!(s.contains_addr(ip("10.9.5.0")));
    assert!(!s.contains_addr(ip("10.9.5.1")));
    assert!(s.mask(33).is_err());
}
