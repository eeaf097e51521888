//! Node and leaf records for both address families.
//!
//! Records are plain old data so a RADIX payload is their byte image and
//! a mapped file can be viewed as a slice of them. Every record is padded
//! explicitly; there are no implicit holes.

use bytemuck::{Pod, Zeroable};

use crate::arena::ArenaRecord;
use crate::bitmap::ChildBitmap;
use crate::constants::NUM_CHILDREN;

/// Accessors shared by the node records of both families.
pub trait NodeRecord: ArenaRecord {
    fn child(&self, slot: usize) -> u32;
    fn set_child(&mut self, slot: usize, idx: u32);
    fn is_leaf(&self) -> ChildBitmap;
    fn is_leaf_mut(&mut self) -> &mut ChildBitmap;
    fn repeated(&self) -> ChildBitmap;
    fn repeated_mut(&mut self) -> &mut ChildBitmap;
    fn prefix(&self) -> u32;
    fn set_prefix(&mut self, prefix: u32);
    fn ip(&self) -> u128;
    fn set_ip(&mut self, ip: u128);
    /// Reverse the byte order of every multi-byte field.
    fn swap_bytes(&mut self);

    /// Slot is empty.
    #[inline]
    fn is_vacant(&self, slot: usize) -> bool {
        self.child(slot) == 0
    }

    /// Number of distinct children (repeat slots not counted).
    fn child_count(&self) -> usize {
        let rep = self.repeated();
        (0..NUM_CHILDREN)
            .filter(|&i| self.child(i) != 0 && !rep.get(i))
            .count()
    }

    /// Empty every slot in `[first, last]`.
    fn clear_slots(&mut self, first: usize, last: usize) {
        for i in first..=last {
            self.set_child(i, 0);
        }
        self.is_leaf_mut().clear_range(first, last);
        self.repeated_mut().clear_range(first, last);
    }
}

/// Accessors shared by the leaf records of both families.
pub trait LeafRecord: ArenaRecord {
    fn prefix(&self) -> u32;
    fn set_prefix(&mut self, prefix: u32);
    fn ip(&self) -> u128;
    fn set_ip(&mut self, ip: u128);
    fn swap_bytes(&mut self);
}

/// One address family: its width and its record types.
pub trait Family: 'static + Send + Sync {
    const MAX_BITS: u32;
    const IS_V6: bool;
    type Node: NodeRecord;
    type Leaf: LeafRecord;
}

#[derive(Debug, Clone, Copy)]
pub struct V4;

#[derive(Debug, Clone, Copy)]
pub struct V6;

impl Family for V4 {
    const MAX_BITS: u32 = 32;
    const IS_V6: bool = false;
    type Node = NodeV4;
    type Leaf = LeafV4;
}

impl Family for V6 {
    const MAX_BITS: u32 = 128;
    const IS_V6: bool = true;
    type Node = NodeV6;
    type Leaf = LeafV6;
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct NodeV4 {
    pub child: [u32; NUM_CHILDREN],
    pub child_is_leaf: ChildBitmap,
    pub child_repeated: ChildBitmap,
    pub prefix: u8,
    pub pad: [u8; 3],
    pub ip: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct NodeV6 {
    pub child: [u32; NUM_CHILDREN],
    pub child_is_leaf: ChildBitmap,
    pub child_repeated: ChildBitmap,
    pub prefix: u8,
    pub pad: [u8; 7],
    /// Upper and lower 64 bits, each in host order.
    pub ip: [u64; 2],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct LeafV4 {
    pub prefix: u8,
    pub pad: [u8; 3],
    pub ip: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct LeafV6 {
    pub prefix: u8,
    pub pad: [u8; 7],
    pub ip: [u64; 2],
}

const _: () = assert!(std::mem::size_of::<NodeV4>() == 80);
const _: () = assert!(std::mem::size_of::<NodeV6>() == 96);
const _: () = assert!(std::mem::size_of::<LeafV4>() == 8);
const _: () = assert!(std::mem::size_of::<LeafV6>() == 24);

#[inline]
fn split_v6(ip: u128) -> [u64; 2] {
    [(ip >> 64) as u64, ip as u64]
}

#[inline]
fn join_v6(ip: [u64; 2]) -> u128 {
    ((ip[0] as u128) << 64) | ip[1] as u128
}

macro_rules! node_common {
    () => {
        #[inline]
        fn child(&self, slot: usize) -> u32 {
            self.child[slot]
        }
        #[inline]
        fn set_child(&mut self, slot: usize, idx: u32) {
            self.child[slot] = idx;
        }
        #[inline]
        fn is_leaf(&self) -> ChildBitmap {
            self.child_is_leaf
        }
        #[inline]
        fn is_leaf_mut(&mut self) -> &mut ChildBitmap {
            &mut self.child_is_leaf
        }
        #[inline]
        fn repeated(&self) -> ChildBitmap {
            self.child_repeated
        }
        #[inline]
        fn repeated_mut(&mut self) -> &mut ChildBitmap {
            &mut self.child_repeated
        }
        #[inline]
        fn prefix(&self) -> u32 {
            self.prefix as u32
        }
        #[inline]
        fn set_prefix(&mut self, prefix: u32) {
            self.prefix = prefix as u8;
        }
    };
}

// Free nodes keep the next free index in child[0].
impl ArenaRecord for NodeV4 {
    const KIND: &'static str = "node";
    fn free_link(&self) -> u32 {
        self.child[0]
    }
    fn set_free_link(&mut self, next: u32) {
        self.child[0] = next;
    }
}

impl ArenaRecord for NodeV6 {
    const KIND: &'static str = "node";
    fn free_link(&self) -> u32 {
        self.child[0]
    }
    fn set_free_link(&mut self, next: u32) {
        self.child[0] = next;
    }
}

// Free leaves keep it in the (low word of the) address.
impl ArenaRecord for LeafV4 {
    const KIND: &'static str = "leaf";
    fn free_link(&self) -> u32 {
        self.ip
    }
    fn set_free_link(&mut self, next: u32) {
        self.ip = next;
    }
}

impl ArenaRecord for LeafV6 {
    const KIND: &'static str = "leaf";
    fn free_link(&self) -> u32 {
        self.ip[1] as u32
    }
    fn set_free_link(&mut self, next: u32) {
        self.ip[1] = next as u64;
    }
}

impl NodeRecord for NodeV4 {
    node_common!();

    #[inline]
    fn ip(&self) -> u128 {
        self.ip as u128
    }
    #[inline]
    fn set_ip(&mut self, ip: u128) {
        self.ip = ip as u32;
    }
    fn swap_bytes(&mut self) {
        for c in self.child.iter_mut() {
            *c = c.swap_bytes();
        }
        self.child_is_leaf.swap_bytes();
        self.child_repeated.swap_bytes();
        self.ip = self.ip.swap_bytes();
    }
}

impl NodeRecord for NodeV6 {
    node_common!();

    #[inline]
    fn ip(&self) -> u128 {
        join_v6(self.ip)
    }
    #[inline]
    fn set_ip(&mut self, ip: u128) {
        self.ip = split_v6(ip);
    }
    fn swap_bytes(&mut self) {
        for c in self.child.iter_mut() {
            *c = c.swap_bytes();
        }
        self.child_is_leaf.swap_bytes();
        self.child_repeated.swap_bytes();
        self.ip = [self.ip[0].swap_bytes(), self.ip[1].swap_bytes()];
    }
}

impl LeafRecord for LeafV4 {
    #[inline]
    fn prefix(&self) -> u32 {
        self.prefix as u32
    }
    #[inline]
    fn set_prefix(&mut self, prefix: u32) {
        self.prefix = prefix as u8;
    }
    #[inline]
    fn ip(&self) -> u128 {
        self.ip as u128
    }
    #[inline]
    fn set_ip(&mut self, ip: u128) {
        self.ip = ip as u32;
    }
    fn swap_bytes(&mut self) {
        self.ip = self.ip.swap_bytes();
    }
}

impl LeafRecord for LeafV6 {
    #[inline]
    fn prefix(&self) -> u32 {
        self.prefix as u32
    }
    #[inline]
    fn set_prefix(&mut self, prefix: u32) {
        self.prefix = prefix as u8;
    }
    #[inline]
    fn ip(&self) -> u128 {
        join_v6(self.ip)
    }
    #[inline]
    fn set_ip(&mut self, ip: u128) {
        self.ip = split_v6(ip);
    }
    fn swap_bytes(&mut self) {
        self.ip = [self.ip[0].swap_bytes(), self.ip[1].swap_bytes()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v6_halves() {
        let mut l = LeafV6::zeroed();
        l.set_ip(0x2001_0db8_0000_0000_0000_0000_0000_0001);
        assert_eq!(l.ip, [0x2001_0db8_0000_0000, 1]);
        assert_eq!(l.ip(), 0x2001_0db8_0000_0000_0000_0000_0000_0001);
    }

    #[test]
    fn swap_twice_is_identity() {
        let mut n = NodeV4::zeroed();
        n.set_child(3, 0x0102_0304);
        n.is_leaf_mut().set(3);
        n.set_ip(0x0A00_0000);
        n.set_prefix(8);
        let before = n;
        n.swap_bytes();
        assert_eq!(n.child[3], 0x0403_0201);
        assert_eq!(n.prefix, 8);
        n.swap_bytes();
        assert_eq!(n, before);
    }

    #[test]
    fn child_count_skips_repeats() {
        let mut n = NodeV4::zeroed();
        for s in 0..4 {
            n.set_child(s, 7);
        }
        n.is_leaf_mut().set_range(0, 3);
        n.repeated_mut().set_range(1, 3);
        n.set_child(9, 2);
        assert_eq!(n.child_count(), 2);
        n.clear_slots(0, 3);
        assert_eq!(n.child_count(), 1);
        assert!(n.is_leaf().is_empty());
    }
}
