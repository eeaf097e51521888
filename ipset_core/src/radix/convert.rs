//! Moving a tree between address families.
//!
//! An IPv4 tree and an IPv6 tree restricted to `::ffff:0:0/96` have the
//! same shape, so conversion rewrites each record in place of its index:
//! prefixes move by 96 and addresses move into or out of the mapped range.

use bytemuck::Zeroable;
use log::debug;

use super::records::{LeafV4, LeafV6, NodeV4, NodeV6};
use super::{Entry, Family, LeafRecord, NodeRecord, RadixTree, RadixV4, RadixV6};
use crate::constants::{NUM_CHILDREN, V4_MAPPED_BITS};
use crate::errors::{Error, Result};
use crate::helpers::{is_v4_mapped, v4_to_v6};

impl<F: Family> RadixTree<F> {
    /// Build a tree from `(ip, prefix)` blocks.
    pub fn from_blocks<I>(blocks: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u128, u32)>,
    {
        let mut t = RadixTree::new();
        for (ip, prefix) in blocks {
            t.insert(ip, prefix)?;
        }
        Ok(t)
    }
}

impl RadixV4 {
    /// Same content as an IPv6 tree inside `::ffff:0:0/96`.
    pub fn to_v6(&self) -> Result<RadixV6> {
        let nodes = self.nodes.map_into(|n: &NodeV4| {
            let mut out = NodeV6::zeroed();
            out.child = n.child;
            out.child_is_leaf = n.child_is_leaf;
            out.child_repeated = n.child_repeated;
            out.set_prefix(n.prefix() + V4_MAPPED_BITS);
            out.set_ip(v4_to_v6(n.ip));
            out
        })?;
        let leaves = self.leaves.map_into(|l: &LeafV4| {
            let mut out = LeafV6::zeroed();
            out.set_prefix(l.prefix() + V4_MAPPED_BITS);
            out.set_ip(v4_to_v6(l.ip));
            out
        })?;
        debug!(
            "[CONVERT] v4 -> v6: {} nodes, {} leaves",
            nodes.count(),
            leaves.count()
        );
        Ok(RadixTree {
            nodes,
            leaves,
            root: self.root,
        })
    }
}

impl RadixV6 {
    /// Whether any address lies outside `::ffff:0:0/96`.
    pub fn has_non_mapped(&self) -> bool {
        self.blocks()
            .any(|(ip, prefix)| prefix < V4_MAPPED_BITS || !is_v4_mapped(ip))
    }

    /// Same content as an IPv4 tree. Fails `Ipv6` if anything lies outside
    /// the mapped range.
    pub fn to_v4(&self) -> Result<RadixV4> {
        if self.has_non_mapped() {
            return Err(Error::Ipv6);
        }
        if self.root.is_none() {
            return Ok(RadixV4::new());
        }

        // Records can be rewritten one-for-one only when every live entry
        // sits strictly below the /96; a /96 leaf or a node above it has
        // no IPv4 counterpart and forces a rebuild.
        let mut in_place = true;
        let mut stack: Vec<Entry> = self.root.into_iter().collect();
        while let Some(e) = stack.pop() {
            match e {
                Entry::Leaf(l) => {
                    if self.leaves.get(l).prefix() <= V4_MAPPED_BITS {
                        in_place = false;
                        break;
                    }
                }
                Entry::Node(n) => {
                    if self.nodes.get(n).prefix() < V4_MAPPED_BITS {
                        in_place = false;
                        break;
                    }
                    for s in 0..NUM_CHILDREN {
                        if !self.nodes.get(n).repeated().get(s) {
                            if let Some(c) = self.entry_at(n, s) {
                                stack.push(c);
                            }
                        }
                    }
                }
            }
        }

        if !in_place {
            debug!("[CONVERT] v6 -> v4 by rebuilding");
            return RadixV4::from_blocks(self.blocks().flat_map(|(ip, prefix)| {
                let p4 = prefix.saturating_sub(V4_MAPPED_BITS);
                let ip4 = ip & 0xFFFF_FFFF;
                if p4 == 0 {
                    vec![(0, 1), (0x8000_0000, 1)]
                } else {
                    vec![(ip4, p4)]
                }
            }));
        }

        let nodes = self.nodes.map_into(|n: &NodeV6| {
            let mut out = NodeV4::zeroed();
            out.child = n.child;
            out.child_is_leaf = n.child_is_leaf;
            out.child_repeated = n.child_repeated;
            out.set_prefix(n.prefix().saturating_sub(V4_MAPPED_BITS));
            out.set_ip(n.ip() & 0xFFFF_FFFF);
            out
        })?;
        let leaves = self.leaves.map_into(|l: &LeafV6| {
            let mut out = LeafV4::zeroed();
            out.set_prefix(l.prefix().saturating_sub(V4_MAPPED_BITS));
            out.set_ip(l.ip() & 0xFFFF_FFFF);
            out
        })?;
        debug!(
            "[CONVERT] v6 -> v4: {} nodes, {} leaves",
            nodes.count(),
            leaves.count()
        );
        Ok(RadixTree {
            nodes,
            leaves,
            root: self.root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_v6() {
        let mut t = RadixV4::new();
        t.insert(0x0A00_0000, 8).unwrap();
        t.insert(0xC0A8_0100, 24).unwrap();
        t.insert(0x0B00_0001, 32).unwrap();
        let before: Vec<_> = t.blocks().collect();

        let v6 = t.to_v6().unwrap();
        v6.verify().unwrap();
        assert!(!v6.has_non_mapped());
        assert!(v6.contains(v4_to_v6(0x0A01_0203)));
        assert_eq!(v6.blocks().next(), Some((v4_to_v6(0x0A00_0000), 104)));

        let back = v6.to_v4().unwrap();
        back.verify().unwrap();
        assert_eq!(back.blocks().collect::<Vec<_>>(), before);
    }

    #[test]
    fn whole_mapped_range_becomes_two_halves() {
        let mut t = RadixV6::new();
        t.insert(v4_to_v6(0), 96).unwrap();
        let v4 = t.to_v4().unwrap();
        assert_eq!(v4.blocks().collect::<Vec<_>>(), vec![(0, 1), (0x8000_0000, 1)]);
    }

    #[test]
    fn refuses_true_v6_content() {
        let mut t = RadixV6::new();
        t.insert(0x2001_0db8u128 << 96, 32).unwrap();
        assert!(matches!(t.to_v4(), Err(Error::Ipv6)));
    }
}
