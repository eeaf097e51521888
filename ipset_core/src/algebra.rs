//! Union, intersection and difference of sets.
//!
//! Two dense bitmaps combine word by word. Every other pairing walks the
//! source as CIDR blocks and feeds them to the destination's insert or
//! remove path, after moving the blocks into the destination's family.

use std::net::IpAddr;

use log::debug;

use crate::constants::{V4_MAPPED_BITS, V4_MAPPED_PREFIX};
use crate::errors::Result;
use crate::helpers::{block_contains, block_last, is_v4_mapped, v4_plen, v4_to_v6};
use crate::ipset::{halves, IpSet, Repr};

/// Blocks of `src` expressed in the family of a set whose IPv6 flag is
/// `dst_v6`. IPv6 content outside the mapped range is dropped when the
/// destination is IPv4. Ascending.
pub(crate) fn blocks_for(dst_v6: bool, src: &IpSet) -> Box<dyn Iterator<Item = (u128, u32)> + '_> {
    match (dst_v6, src.is_v6()) {
        (true, true) | (false, false) => src.native_blocks(),
        (true, false) => Box::new(
            src.native_blocks()
                .map(|(ip, p)| (v4_to_v6(ip as u32), v4_plen(p))),
        ),
        (false, true) => Box::new(src.native_blocks().flat_map(|(ip, p)| {
            let mapped: Vec<(u128, u32)> = if p > V4_MAPPED_BITS && is_v4_mapped(ip) {
                vec![(ip & 0xFFFF_FFFF, p - V4_MAPPED_BITS)]
            } else if block_contains(ip, p, V4_MAPPED_PREFIX, V4_MAPPED_BITS, 128) {
                vec![(0, 1), (0x8000_0000, 1)]
            } else {
                Vec::new()
            };
            mapped
        })),
    }
}

fn as_range(bits: u32) -> impl Fn((u128, u32)) -> (u128, u128) {
    move |(ip, p)| (ip, block_last(ip, p, bits))
}

/// `dst |= src`. A destination holding IPv4 is promoted when `src` has
/// true IPv6 content.
pub fn union_into(dst: &mut IpSet, src: &IpSet) -> Result<()> {
    if let (Repr::Bitmap(d), Repr::Bitmap(s)) = (&mut dst.repr, &src.repr) {
        return d.union_with(s);
    }
    if !dst.is_v6() && src.contains_v6() {
        dst.promote()?;
    }
    dst.ensure_owned()?;
    let dst_v6 = dst.is_v6();
    for (ip, p) in blocks_for(dst_v6, src) {
        dst.insert_native(ip, p)?;
    }
    debug!("[UNION] done, dst dirty={}", dst.dirty);
    Ok(())
}

/// `dst &= src`
pub fn intersect_into(dst: &mut IpSet, src: &IpSet) -> Result<()> {
    if let (Repr::Bitmap(d), Repr::Bitmap(s)) = (&mut dst.repr, &src.repr) {
        d.intersect_with(s);
        return Ok(());
    }
    let bits = dst.max_bits();
    let a: Vec<(u128, u128)> = dst.native_blocks().map(as_range(bits)).collect();
    let b: Vec<(u128, u128)> = blocks_for(dst.is_v6(), src).map(as_range(bits)).collect();

    let mut out: Vec<(u128, u128)> = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        let lo = a[i].0.max(b[j].0);
        let hi = a[i].1.min(b[j].1);
        if lo <= hi {
            out.push((lo, hi));
        }
        if a[i].1 < b[j].1 {
            i += 1;
        } else {
            j += 1;
        }
    }
    debug!("[INTERSECT] {} x {} blocks -> {}", a.len(), b.len(), out.len());

    let mut result = dst.empty_like();
    for (lo, hi) in out {
        result.insert_native_range(lo, hi)?;
    }
    dst.adopt(result);
    Ok(())
}

/// `dst -= src`
pub fn subtract_from(dst: &mut IpSet, src: &IpSet) -> Result<()> {
    if let (Repr::Bitmap(d), Repr::Bitmap(s)) = (&mut dst.repr, &src.repr) {
        d.subtract(s);
        return Ok(());
    }
    dst.ensure_owned()?;
    let dst_v6 = dst.is_v6();
    for (ip, p) in blocks_for(dst_v6, src) {
        dst.remove_native(ip, p)?;
    }
    Ok(())
}

/// Whether the two sets share an address.
pub fn intersects_set(a: &IpSet, b: &IpSet) -> bool {
    if let (Repr::Bitmap(x), Repr::Bitmap(y)) = (&a.repr, &b.repr) {
        return x.intersects(y);
    }
    let bits = a.max_bits();
    let mut x = a.native_blocks().map(as_range(bits)).peekable();
    let mut y = blocks_for(a.is_v6(), b).map(as_range(bits)).peekable();
    while let (Some(&p), Some(&q)) = (x.peek(), y.peek()) {
        if p.0.max(q.0) <= p.1.min(q.1) {
            return true;
        }
        if p.1 < q.1 {
            x.next();
        } else {
            y.next();
        }
    }
    false
}

/// Whether any `(ip, prefix)` pair meets the set; prefix 0 stands for the
/// whole space of the pair's family.
pub fn intersects_wildcard<I>(set: &IpSet, blocks: I) -> bool
where
    I: IntoIterator<Item = (IpAddr, u32)>,
{
    blocks.into_iter().any(|(ip, prefix)| {
        if prefix == 0 {
            halves(ip.is_ipv6())
                .iter()
                .any(|&(h, p)| set.intersects_block(h, p))
        } else {
            set.intersects_block(ip, prefix)
        }
    })
}

impl IpSet {
    /// `self |= other`
    pub fn union_with(&mut self, other: &IpSet) -> Result<()> {
        union_into(self, other)
    }

    /// `self &= other`
    pub fn intersect_with(&mut self, other: &IpSet) -> Result<()> {
        intersect_into(self, other)
    }

    /// `self -= other`
    pub fn subtract(&mut self, other: &IpSet) -> Result<()> {
        subtract_from(self, other)
    }

    pub fn intersects(&self, other: &IpSet) -> bool {
        intersects_set(self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InCoreFormat, IpSetOptions, RecordVersion};

    fn set(format: InCoreFormat, blocks: &[(&str, u32)]) -> IpSet {
        let mut s = IpSet::create_with_format(false, format);
        for (ip, p) in blocks {
            s.insert_addr(ip.parse().unwrap(), *p).unwrap();
        }
        s.clean().unwrap();
        s
    }

    const FORMATS: [InCoreFormat; 2] = [InCoreFormat::IpTree, InCoreFormat::Radix];

    #[test]
    fn algebra_over_every_pairing() {
        for fa in FORMATS {
            for fb in FORMATS {
                let a = set(fa, &[("10.0.0.0", 24), ("10.0.2.0", 24)]);
                let b = set(fb, &[("10.0.0.128", 25), ("10.0.1.0", 24)]);

                let mut u = a.clone();
                union_into(&mut u, &b).unwrap();
                u.clean().unwrap();
                assert_eq!(u.to_string(), "10.0.0.0/23\n10.0.2.0/24\n", "{:?} {:?}", fa, fb);

                let mut i = a.clone();
                intersect_into(&mut i, &b).unwrap();
                i.clean().unwrap();
                assert_eq!(i.to_string(), "10.0.0.128/25\n");

                let mut d = a.clone();
                subtract_from(&mut d, &b).unwrap();
                d.clean().unwrap();
                assert_eq!(d.to_string(), "10.0.0.0/25\n10.0.2.0/24\n");

                assert!(intersects_set(&a, &b));
                assert!(!intersects_set(&d, &b));
            }
        }
    }

    #[test]
    fn dense_intersect_radix_keeps_dst_settings() {
        let mut a = set(InCoreFormat::IpTree, &[("10.0.0.0", 16), ("10.2.0.0", 24)]);
        let opts = IpSetOptions::default().with_record_version(RecordVersion::CidrBmap);
        a.bind_options(opts.clone());
        a.set_auto_convert(false);
        let b = set(InCoreFormat::Radix, &[("10.0.5.0", 24), ("10.2.0.128", 25), ("11.0.0.0", 8)]);

        intersect_into(&mut a, &b).unwrap();
        a.clean().unwrap();
        assert_eq!(a.to_string(), "10.0.5.0/24\n10.2.0.128/25\n");
        assert_eq!(a.incore_format(), InCoreFormat::IpTree);
        assert_eq!(a.options(), &opts);
        assert!(!a.auto_convert_is_enabled());

        intersect_into(&mut a, &set(InCoreFormat::Radix, &[("12.0.0.0", 8)])).unwrap();
        assert!(a.is_empty());
        assert_eq!(a.incore_format(), InCoreFormat::IpTree);
    }

    #[test]
    fn union_with_v6_promotes() {
        let mut a = set(InCoreFormat::IpTree, &[("10.0.0.0", 8)]);
        let mut b = IpSet::create(true);
        b.insert_addr("2001:db8::".parse().unwrap(), 32).unwrap();
        b.clean().unwrap();
        union_into(&mut a, &b).unwrap();
        assert!(a.is_v6());
        assert!(a.contains_addr("10.9.9.9".parse().unwrap()));
        assert!(a.contains_addr("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn v4_meets_only_mapped_part_of_v6() {
        let mut a = set(InCoreFormat::Radix, &[("10.0.0.0", 8)]);
        let mut b = IpSet::create(true);
        b.insert_addr("::ffff:10.1.0.0".parse().unwrap(), 112).unwrap();
        b.insert_addr("2001:db8::".parse().unwrap(), 32).unwrap();
        b.clean().unwrap();
        assert!(intersects_set(&a, &b));
        intersect_into(&mut a, &b).unwrap();
        a.clean().unwrap();
        assert!(!a.is_v6());
        assert_eq!(a.to_string(), "10.1.0.0/16\n");
    }

    #[test]
    fn wildcard_queries() {
        let a = set(InCoreFormat::Radix, &[("192.168.0.0", 16)]);
        let ip = |s: &str| s.parse::<IpAddr>().unwrap();
        assert!(intersects_wildcard(&a, [(ip("10.0.0.0"), 8), (ip("192.168.3.0"), 24)]));
        assert!(!intersects_wildcard(&a, [(ip("10.0.0.0"), 8)]));
        assert!(intersects_wildcard(&a, [(ip("0.0.0.0"), 0)]));
    }
}
