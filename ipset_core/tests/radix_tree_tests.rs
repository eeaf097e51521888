use std::collections::BTreeSet;

use ipset_core::helpers::{block_last, canonical};
use ipset_core::radix::{RadixV4, RadixV6};
use proptest::collection::vec as pvec;
use proptest::prelude::*;

const BASE: u32 = 0x0A00_0000; // 10.0.0.0/20
const WINDOW: u32 = 4096;

fn apply(model: &mut [bool], ip: u32, prefix: u32, on: bool) {
    let last = block_last(ip as u128, prefix, 32) as u32;
    for a in ip..=last {
        model[(a - BASE) as usize] = on;
    }
}

#[test]
fn insert_lookup_remove() {
    let mut t = RadixV4::new();
    t.insert(0xC0A8_0000, 16).unwrap();
    t.insert(0x0A01_0203, 32).unwrap();
    assert!(t.contains(0xC0A8_FFFF));
    assert!(t.contains(0x0A01_0203));
    assert!(!t.contains(0x0A01_0204));

    // carve a hole out of the /16
    t.remove(0xC0A8_0100, 24).unwrap();
    assert!(!t.contains(0xC0A8_0101));
    assert!(t.contains(0xC0A8_0001));
    assert!(t.contains(0xC0A8_0201));
    t.clean().unwrap();
    t.verify().unwrap();

    let total: u128 = t.blocks().map(|(_, p)| 1u128 << (32 - p)).sum();
    assert_eq!(total, 65536 - 256 + 1);
}

#[test]
fn prefix_bounds() {
    let mut t = RadixV4::new();
    assert!(t.insert(0, 0).is_err());
    assert!(t.insert(0, 33).is_err());
    let mut t6 = RadixV6::new();
    assert!(t6.insert(0, 129).is_err());
    t6.insert(1, 128).unwrap();
    assert!(t6.contains(1));
}

#[test]
fn cleaned_tree_is_minimal_and_ordered() {
    let mut t = RadixV4::new();
    for i in (0..256u128).rev() {
        t.insert(0x0A00_0000 + i, 32).unwrap();
    }
    t.clean().unwrap();
    let blocks: Vec<_> = t.blocks().collect();
    assert_eq!(blocks, vec![(0x0A00_0000, 24)]);
    // sentinel plus one leaf
    assert_eq!(t.leaf_count(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10))]

    #[test]
    fn tree_matches_address_model(
        ops in pvec((0u32..WINDOW, 20u32..=32, any::<bool>()), 1..64)
    ) {
        let mut t = RadixV4::new();
        let mut model = vec![false; WINDOW as usize];
        for (off, prefix, insert) in ops {
            let ip = canonical((BASE + off) as u128, prefix, 32) as u32;
            if insert {
                t.insert(ip as u128, prefix).unwrap();
            } else {
                t.remove(ip as u128, prefix).unwrap();
            }
            apply(&mut model, ip, prefix, insert);
        }
        t.clean().unwrap();
        t.verify().unwrap();

        for (i, want) in model.iter().enumerate() {
            prop_assert_eq!(t.contains((BASE + i as u32) as u128), *want);
        }

        let blocks: Vec<_> = t.blocks().collect();
        let mut prev_last: Option<u128> = None;
        for &(ip, p) in &blocks {
            if let Some(l) = prev_last {
                prop_assert!(ip > l, "blocks overlap or are out of order");
            }
            prev_last = Some(block_last(ip, p, 32));
        }
        let total: u128 = blocks.iter().map(|&(_, p)| 1u128 << (32 - p)).sum();
        prop_assert_eq!(total, model.iter().filter(|b| **b).count() as u128);
    }
}

#[test]
fn random_v6_hosts_stress() {
    let base: u128 = 0x2001_0db8 << 96;
    let mut t = RadixV6::new();
    let mut model = BTreeSet::new();
    for _ in 0..3000 {
        let ip = base | rand::random::<u16>() as u128;
        if rand::random::<u8>() < 200 {
            t.insert(ip, 128).unwrap();
            model.insert(ip);
        } else {
            t.remove(ip, 128).unwrap();
            model.remove(&ip);
        }
    }
    t.clean().unwrap();
    t.verify().unwrap();

    let mut expanded = Vec::new();
    for (ip, p) in t.blocks() {
        let last = block_last(ip, p, 128);
        let mut a = ip;
        loop {
            expanded.push(a);
            if a == last {
                break;
            }
            a += 1;
        }
    }
    assert_eq!(expanded, model.into_iter().collect::<Vec<_>>());
}
