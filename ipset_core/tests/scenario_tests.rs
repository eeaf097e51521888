use std::net::IpAddr;
use std::ops::ControlFlow;

use ipset_core::{
    process_stream, CompMethod, InCoreFormat, IpSet, IpSetOptions, ProcessParams, RecordVersion,
    V6Policy,
};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn radix_v4(blocks: &[(&str, u32)]) -> IpSet {
    let mut s = IpSet::create_with_format(false, InCoreFormat::Radix);
    for &(a, p) in blocks {
        s.insert_addr(ip(a), p).unwrap();
    }
    s
}

fn leaves(s: &IpSet) -> Vec<(IpAddr, u32)> {
    s.iter(true, V6Policy::Mix).unwrap().collect()
}

#[test]
fn covered_blocks_fold_into_their_parent() {
    let mut s = radix_v4(&[("10.0.0.0", 8), ("10.0.0.0", 24), ("11.0.0.0", 8)]);
    s.clean().unwrap();
    assert_eq!(leaves(&s), vec![(ip("10.0.0.0"), 8), (ip("11.0.0.0"), 8)]);
}

#[test]
fn removing_the_upper_half() {
    let mut s = radix_v4(&[("192.168.1.0", 24)]);
    s.remove_addr(ip("192.168.1.128"), 25).unwrap();
    s.clean().unwrap();
    assert_eq!(leaves(&s), vec![(ip("192.168.1.0"), 25)]);
}

#[test]
fn everything_stays_as_two_halves() {
    for format in [InCoreFormat::Radix, InCoreFormat::IpTree] {
        let mut s = IpSet::create_with_format(false, format);
        s.insert_addr(ip("0.0.0.0"), 1).unwrap();
        s.insert_addr(ip("128.0.0.0"), 1).unwrap();
        s.clean().unwrap();
        assert_eq!(leaves(&s), vec![(ip("0.0.0.0"), 1), (ip("128.0.0.0"), 1)]);
        assert_eq!(s.count_addresses(), 1u128 << 32);
    }

    // the wildcard spelling of "everything" lands on the same two blocks
    let mut w = IpSet::create_with_format(false, InCoreFormat::Radix);
    w.insert_wildcard([(ip("0.0.0.0"), 0)]).unwrap();
    w.clean().unwrap();
    assert_eq!(leaves(&w).len(), 2);
    assert!(w.insert_addr(ip("0.0.0.0"), 0).is_err());
}

#[test]
fn four_hosts_make_a_slash_30() {
    let mut s = radix_v4(&[
        ("1.0.0.0", 32),
        ("1.0.0.1", 32),
        ("1.0.0.2", 32),
        ("1.0.0.3", 32),
    ]);
    s.clean().unwrap();
    assert_eq!(leaves(&s), vec![(ip("1.0.0.0"), 30)]);
}

#[test]
fn union_and_intersection_of_slash_8s() {
    let a = radix_v4(&[("10.0.0.0", 8)]);
    let b = radix_v4(&[("11.0.0.0", 8)]);
    let mut u = a.clone();
    u.union_with(&b).unwrap();
    u.clean().unwrap();
    assert_eq!(u.count_addresses(), (1u128 << 24) * 2);

    let mut ba = b.clone();
    ba.union_with(&a).unwrap();
    ba.clean().unwrap();
    assert_eq!(ba.to_string(), u.to_string());

    let mut i = a.clone();
    i.intersect_with(&radix_v4(&[("10.0.0.0", 16), ("10.1.0.0", 16)])).unwrap();
    i.clean().unwrap();
    assert_eq!(leaves(&i), vec![(ip("10.0.0.0"), 15)]);
}

#[test]
fn one_slash_24_in_three_layouts() {
    let mut a = radix_v4(&[("10.0.0.0", 24)]);
    a.clean().unwrap();
    let mut read_back = Vec::new();
    for v in [RecordVersion::ClassC, RecordVersion::Radix, RecordVersion::CidrBmap] {
        a.bind_options(IpSetOptions::default().with_record_version(v));
        let mut buf = Vec::new();
        a.write(&mut buf).unwrap();
        read_back.push(IpSet::read(&mut &buf[..]).unwrap().to_string());
    }
    assert!(read_back.iter().all(|s| *s == a.to_string()), "{:?}", read_back);
}

#[test]
fn streaming_a_classc_slash_24() {
    let mut a = radix_v4(&[("10.0.0.0", 24)]);
    a.clean().unwrap();
    a.bind_options(
        IpSetOptions::default()
            .with_record_version(RecordVersion::ClassC)
            .with_compression(CompMethod::None),
    );
    let mut buf = Vec::new();
    a.write(&mut buf).unwrap();

    let mut seen = Vec::new();
    let params = ProcessParams {
        visit_cidr: true,
        v6_policy: V6Policy::Mix,
    };
    process_stream::<_, (), _>(&mut &buf[..], params, |addr, p| {
        seen.push((addr, p));
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(seen, vec![(ip("10.0.0.0"), 24)]);

    let mut hosts = 0;
    let params = ProcessParams {
        visit_cidr: false,
        v6_policy: V6Policy::Mix,
    };
    process_stream::<_, (), _>(&mut &buf[..], params, |_, p| {
        assert_eq!(p, 32);
        hosts += 1;
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(hosts, 256);
}

#[test]
fn one_host_out_of_a_slash_16() {
    let mut s = radix_v4(&[("172.20.0.0", 16)]);
    s.remove_addr(ip("172.20.77.5"), 32).unwrap();
    s.clean().unwrap();
    let l = leaves(&s);
    assert_eq!(l.len(), 16);
    assert_eq!(s.count_addresses(), 65535);
    assert!(!s.contains_addr(ip("172.20.77.5")));
    assert!(s.contains_addr(ip("172.20.77.4")));
}

#[test]
fn repeated_operations_settle() {
    let mut once = radix_v4(&[("10.1.0.0", 16)]);
    once.clean().unwrap();
    let mut twice = radix_v4(&[("10.1.0.0", 16), ("10.1.0.0", 16)]);
    twice.clean().unwrap();
    assert_eq!(once.to_string(), twice.to_string());

    // a host inside a stored block changes nothing
    twice.insert_addr(ip("10.1.2.3"), 32).unwrap();
    twice.clean().unwrap();
    twice.clean().unwrap();
    assert_eq!(once.to_string(), twice.to_string());

    twice.remove_addr(ip("10.1.2.0"), 24).unwrap();
    twice.remove_addr(ip("10.1.2.0"), 24).unwrap();
    twice.clean().unwrap();
    assert_eq!(twice.count_addresses(), 65536 - 256);

    let mut self_union = once.clone();
    self_union.union_with(&once).unwrap();
    self_union.clean().unwrap();
    assert_eq!(self_union.to_string(), once.to_string());
}

#[test]
fn wide_insert_and_remove_clear_what_they_cover() {
    let mut s = radix_v4(&[("10.0.1.0", 24), ("10.0.9.9", 32), ("11.0.0.1", 32)]);
    s.insert_addr(ip("10.0.0.0"), 16).unwrap();
    s.clean().unwrap();
    assert_eq!(leaves(&s), vec![(ip("10.0.0.0"), 16), (ip("11.0.0.1"), 32)]);

    s.remove_addr(ip("10.0.0.0"), 8).unwrap();
    s.clean().unwrap();
    assert_eq!(leaves(&s), vec![(ip("11.0.0.1"), 32)]);
}

#[test]
fn v4_to_v6_and_back() {
    for format in [InCoreFormat::Radix, InCoreFormat::IpTree] {
        let mut s = IpSet::create_with_format(false, format);
        s.insert_addr(ip("10.0.0.0"), 8).unwrap();
        s.insert_addr(ip("192.168.4.7"), 32).unwrap();
        s.clean().unwrap();
        let before = s.to_string();

        s.convert(6).unwrap();
        assert!(s.is_v6());
        assert!(s.contains_addr(ip("::ffff:10.3.3.3")));
        s.convert(4).unwrap();
        assert!(!s.is_v6());
        assert!(!s.is_dirty());
        assert_eq!(s.to_string(), before);
    }

    let mut v6 = IpSet::create(true);
    v6.insert_addr(ip("2001:db8::1"), 128).unwrap();
    v6.clean().unwrap();
    assert!(v6.convert(4).is_err());
}

#[test]
fn cidr_and_host_walk_counts() {
    let mut s = radix_v4(&[("10.0.0.0", 30), ("10.0.1.0", 29), ("10.9.9.9", 32)]);
    s.clean().unwrap();
    assert_eq!(s.iter(true, V6Policy::Mix).unwrap().count(), 3);
    assert_eq!(s.iter(false, V6Policy::Mix).unwrap().count(), 4 + 8 + 1);
}
