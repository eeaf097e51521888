//! Helper functions for bit manipulation on right-aligned addresses.
//!
//! Every address is carried in a `u128`. IPv4 values occupy the low 32
//! bits and are interpreted with `max_bits == 32`; IPv6 values use all
//! 128 bits. Bit 0 is the most significant bit of the address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::constants::{CHILD_MASK, NUM_BITS, V4_MAPPED_BITS, V4_MAPPED_MASK, V4_MAPPED_PREFIX};

/// All address bits set.
#[inline]
pub fn full(max_bits: u32) -> u128 {
    if max_bits >= 128 {
        !0u128
    } else {
        (1u128 << max_bits) - 1
    }
}

/// Network mask for `prefix` leading bits.
#[inline]
pub fn mask(prefix: u32, max_bits: u32) -> u128 {
    if prefix == 0 {
        0
    } else if prefix >= max_bits {
        full(max_bits)
    } else {
        (full(max_bits) << (max_bits - prefix)) & full(max_bits)
    }
}

/// Host bits below `prefix`.
#[inline]
pub fn host_mask(prefix: u32, max_bits: u32) -> u128 {
    full(max_bits) & !mask(prefix, max_bits)
}

// Canonicalise a key: zero host bits beyond `prefix`.
#[inline(always)]
pub fn canonical(ip: u128, prefix: u32, max_bits: u32) -> u128 {
    ip & mask(prefix, max_bits)
}

/// Number of leading bits on which `a` and `b` agree.
pub fn common_prefix_len(a: u128, b: u128, max_bits: u32) -> u32 {
    let diff = (a ^ b) & full(max_bits);
    if diff == 0 {
        return max_bits;
    }
    diff.leading_zeros() - (128 - max_bits)
}

/// Value of bit `index` (0 = most significant).
#[inline]
pub fn bit_is_set(ip: u128, index: u32, max_bits: u32) -> bool {
    debug_assert!(index < max_bits);
    (ip >> (max_bits - 1 - index)) & 1 == 1
}

/// Child slot selected by `ip` in a node whose prefix is `node_prefix`.
#[inline]
pub fn child_slot(ip: u128, node_prefix: u32, max_bits: u32) -> usize {
    debug_assert!(node_prefix + NUM_BITS <= max_bits);
    ((ip >> (max_bits - node_prefix - NUM_BITS)) & CHILD_MASK) as usize
}

/// Number of slots a leaf with `leaf_prefix` spans inside a node with
/// `node_prefix`.
#[inline]
pub fn slot_span(leaf_prefix: u32, node_prefix: u32) -> usize {
    if leaf_prefix >= node_prefix + NUM_BITS {
        1
    } else {
        1 << (node_prefix + NUM_BITS - leaf_prefix)
    }
}

/// Count of addresses in a block; saturates for the whole IPv6 space.
#[inline]
pub fn block_count(prefix: u32, max_bits: u32) -> u128 {
    let host = max_bits - prefix;
    if host >= 128 {
        u128::MAX
    } else {
        1u128 << host
    }
}

/// Whether `outer/outer_prefix` contains `inner/inner_prefix`.
#[inline]
pub fn block_contains(outer: u128, outer_prefix: u32, inner: u128, inner_prefix: u32, max_bits: u32) -> bool {
    outer_prefix <= inner_prefix && (inner & mask(outer_prefix, max_bits)) == outer
}

/// Whether two canonical blocks share any address.
#[inline]
pub fn blocks_overlap(a: u128, a_prefix: u32, b: u128, b_prefix: u32, max_bits: u32) -> bool {
    let p = a_prefix.min(b_prefix);
    (a & mask(p, max_bits)) == (b & mask(p, max_bits))
}

/// Last address of a block.
#[inline]
pub fn block_last(ip: u128, prefix: u32, max_bits: u32) -> u128 {
    ip | host_mask(prefix, max_bits)
}

/// Prefix of the largest CIDR block that starts at `lo` and ends at or
/// before `hi`. Never returns 0; the whole space splits into two halves.
pub fn largest_block(lo: u128, hi: u128, max_bits: u32) -> u32 {
    debug_assert!(lo <= hi);
    let align = if lo == 0 { max_bits } else { lo.trailing_zeros().min(max_bits) };
    let span = hi - lo;
    let len_bits = if span == full(max_bits) {
        max_bits
    } else {
        127 - (span + 1).leading_zeros()
    };
    let k = align.min(len_bits).min(max_bits - 1);
    max_bits - k
}

// ---- IPv4 <-> IPv6 ----------------------------------------------------------

#[inline]
pub fn is_v4_mapped(ip: u128) -> bool {
    ip & V4_MAPPED_MASK == V4_MAPPED_PREFIX
}

#[inline]
pub fn v4_to_v6(ip: u32) -> u128 {
    V4_MAPPED_PREFIX | ip as u128
}

#[inline]
pub fn v6_to_v4(ip: u128) -> Option<u32> {
    is_v4_mapped(ip).then_some(ip as u32)
}

/// Shift an IPv4 prefix into the mapped IPv6 range.
#[inline]
pub fn v4_plen(prefix: u32) -> u32 {
    prefix + V4_MAPPED_BITS
}

/// Split an `IpAddr` into its right-aligned value and a v6 flag.
pub fn ip_to_u128(ip: IpAddr) -> (u128, bool) {
    match ip {
        IpAddr::V4(v4) => (u32::from(v4) as u128, false),
        IpAddr::V6(v6) => (u128::from(v6), true),
    }
}

pub fn u128_to_ip(ip: u128, is_v6: bool) -> IpAddr {
    if is_v6 {
        IpAddr::V6(Ipv6Addr::from(ip))
    } else {
        IpAddr::V4(Ipv4Addr::from(ip as u32))
    }
}

#[inline(always)]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks() {
        assert_eq!(mask(8, 32), 0xFF00_0000);
        assert_eq!(mask(32, 32), 0xFFFF_FFFF);
        assert_eq!(mask(0, 32), 0);
        assert_eq!(mask(1, 128), 1u128 << 127);
        assert_eq!(host_mask(24, 32), 0xFF);
    }

    #[test]
    fn common_prefix() {
        assert_eq!(common_prefix_len(0x0A00_0000, 0x0B00_0000, 32), 7);
        assert_eq!(common_prefix_len(5, 5, 32), 32);
        assert_eq!(common_prefix_len(0, 1u128 << 127, 128), 0);
    }

    #[test]
    fn slots() {
        assert_eq!(child_slot(0xA000_0000, 0, 32), 0xA);
        assert_eq!(child_slot(0x0A01_0000, 12, 32), 1);
        assert_eq!(slot_span(1, 0), 8);
        assert_eq!(slot_span(4, 0), 1);
        assert_eq!(slot_span(30, 28), 4);
    }

    #[test]
    fn largest_blocks() {
        assert_eq!(largest_block(0, 0xFFFF_FFFF, 32), 1);
        assert_eq!(largest_block(0x0A00_0000, 0x0AFF_FFFF, 32), 8);
        assert_eq!(largest_block(1, 10, 32), 32);
        assert_eq!(largest_block(8, 20, 32), 29);
    }

    #[test]
    fn mapping() {
        let m = v4_to_v6(0x0A00_0001);
        assert!(is_v4_mapped(m));
        assert_eq!(v6_to_v4(m), Some(0x0A00_0001));
        assert_eq!(v6_to_v4(1), None);
        assert_eq!(v4_plen(24), 120);
    }
}
