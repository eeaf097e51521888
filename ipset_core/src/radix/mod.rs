//! 16-way radix tree holding CIDR blocks as leaves.
//!
//! Nodes and leaves live in two [`Arena`]s and reference each other by
//! index. A node with prefix `p` branches on address bits `[p, p + 4)`.
//! A leaf whose prefix is shorter than `p + 4` occupies a run of slots;
//! the first slot of the run is a plain leaf slot and the rest carry the
//! repeat bit.
//!
//! Mutations may leave the tree "dirty": leaves out of address order,
//! holes in the arenas, mergeable siblings. [`RadixTree::clean`] restores
//! the canonical layout.

mod convert;
mod iter;
mod maintain;
pub mod records;

use std::fmt;

use log::trace;

use crate::arena::Arena;
use crate::constants::{MAX_DEPTH, NUM_BITS, NUM_CHILDREN};
use crate::errors::{Error, Result};
use crate::helpers::{canonical, child_slot, common_prefix_len, slot_span};

pub use iter::Blocks;
pub use records::{Family, LeafRecord, NodeRecord, V4, V6};

/// Reference to a tree entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Entry {
    Node(u32),
    Leaf(u32),
}

/// Nodes visited from the root down to the point where a search stopped.
#[derive(Debug, Clone)]
pub(crate) struct Path {
    nodes: [u32; MAX_DEPTH],
    len: usize,
}

impl Path {
    fn new() -> Self {
        Path {
            nodes: [0; MAX_DEPTH],
            len: 0,
        }
    }

    fn push(&mut self, n: u32) {
        self.nodes[self.len] = n;
        self.len += 1;
    }

    /// Deepest node on the path; `None` means the root slot itself.
    pub(crate) fn last(&self) -> Option<u32> {
        self.len.checked_sub(1).map(|i| self.nodes[i])
    }

    fn as_slice(&self) -> &[u32] {
        &self.nodes[..self.len]
    }
}

/// Outcome of [`RadixTree::find`]. Slot ranges refer to the last node of
/// the returned path, or to the root when the path is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Find {
    /// The tree has no entries.
    Empty,
    /// `leaf` equals or covers the searched block.
    Found { leaf: u32 },
    /// The searched block covers every entry in slots `[first, last]`,
    /// and at least one of them is present.
    Subset { first: usize, last: usize },
    /// Slots `[first, last]` are all vacant.
    MultiLeaf { first: usize, last: usize },
    /// The entry in `slot` differs from the searched block at `bitpos`,
    /// above both prefixes.
    NotFound { slot: usize, bitpos: u32 },
}

#[derive(Clone)]
pub struct RadixTree<F: Family> {
    pub(crate) nodes: Arena<F::Node>,
    pub(crate) leaves: Arena<F::Leaf>,
    pub(crate) root: Option<Entry>,
}

pub type RadixV4 = RadixTree<V4>;
pub type RadixV6 = RadixTree<V6>;

impl<F: Family> Default for RadixTree<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Family> RadixTree<F> {
    pub fn new() -> Self {
        RadixTree {
            nodes: Arena::new(),
            leaves: Arena::new(),
            root: None,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Leaves issued, sentinel included.
    pub fn leaf_count(&self) -> usize {
        self.leaves.count()
    }

    /// Nodes issued, sentinel included.
    pub fn node_count(&self) -> usize {
        self.nodes.count()
    }

    pub fn root(&self) -> Option<Entry> {
        self.root
    }

    pub fn is_mapped(&self) -> bool {
        self.nodes.is_mapped() || self.leaves.is_mapped()
    }

    /// Drop every entry and release both arenas (and any mapping).
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.leaves.clear();
        self.root = None;
    }

    /// Copy any mapped arena into owned memory. Returns whether a copy
    /// happened.
    pub fn make_owned(&mut self) -> Result<bool> {
        let n = self.nodes.make_owned()?;
        let l = self.leaves.make_owned()?;
        Ok(n || l)
    }

    // ---- entry helpers ---------------------------------------------------

    #[inline]
    pub(crate) fn entry_at(&self, node: u32, slot: usize) -> Option<Entry> {
        let n = self.nodes.get(node);
        match n.child(slot) {
            0 => None,
            c if n.is_leaf().get(slot) => Some(Entry::Leaf(c)),
            c => Some(Entry::Node(c)),
        }
    }

    #[inline]
    pub(crate) fn entry_block(&self, e: Entry) -> (u128, u32) {
        match e {
            Entry::Node(n) => {
                let r = self.nodes.get(n);
                (r.ip(), r.prefix())
            }
            Entry::Leaf(l) => {
                let r = self.leaves.get(l);
                (r.ip(), r.prefix())
            }
        }
    }

    /// Point slots `[first, last]` of `node` at `e`.
    pub(crate) fn set_slots(&mut self, node: u32, first: usize, last: usize, e: Entry) {
        let n = self.nodes.get_mut(node);
        match e {
            Entry::Leaf(l) => {
                for s in first..=last {
                    n.set_child(s, l);
                }
                n.is_leaf_mut().set_range(first, last);
                n.repeated_mut().clear(first);
                if last > first {
                    n.repeated_mut().set_range(first + 1, last);
                }
            }
            Entry::Node(c) => {
                debug_assert_eq!(first, last);
                n.set_child(first, c);
                n.is_leaf_mut().clear(first);
                n.repeated_mut().clear(first);
            }
        }
    }

    /// Slots of `node` that `e` occupies according to its block.
    pub(crate) fn slots_for(&self, node: u32, e: Entry) -> (usize, usize) {
        let np = self.nodes.get(node).prefix();
        let (ip, prefix) = self.entry_block(e);
        let first = child_slot(ip, np, F::MAX_BITS);
        match e {
            Entry::Leaf(_) => (first, first + slot_span(prefix, np) - 1),
            Entry::Node(_) => (first, first),
        }
    }

    /// Hang `e` under `node` at the slots its block selects.
    fn attach(&mut self, node: u32, e: Entry) {
        let (first, last) = self.slots_for(node, e);
        self.set_slots(node, first, last, e);
    }

    /// Put `e` into a single slot of `parent`, or make it the root.
    pub(crate) fn place(&mut self, parent: Option<u32>, slot: usize, e: Entry) {
        match parent {
            None => self.root = Some(e),
            Some(p) => self.set_slots(p, slot, slot, e),
        }
    }

    fn new_leaf(&mut self, ip: u128, prefix: u32) -> Result<u32> {
        let idx = self.leaves.alloc()?;
        let leaf = self.leaves.get_mut(idx);
        leaf.set_prefix(prefix);
        leaf.set_ip(ip);
        Ok(idx)
    }

    fn check_prefix(prefix: u32) -> Result<()> {
        if prefix == 0 {
            return Err(Error::BadInput("prefix 0 must be split into two halves"));
        }
        if prefix > F::MAX_BITS {
            return Err(Error::Prefix {
                prefix,
                bits: F::MAX_BITS,
            });
        }
        Ok(())
    }

    // ---- search ------------------------------------------------------------

    /// Locate `ip/prefix`; `ip` must already be canonical.
    pub(crate) fn find(&self, ip: u128, prefix: u32) -> (Find, Path) {
        let max = F::MAX_BITS;
        let mut path = Path::new();
        let mut cur = match self.root {
            None => return (Find::Empty, path),
            Some(e) => e,
        };
        let mut slot = 0usize;

        loop {
            match cur {
                Entry::Leaf(l) => {
                    let leaf = self.leaves.get(l);
                    let (lp, lip) = (leaf.prefix(), leaf.ip());
                    let cpl = common_prefix_len(ip, lip, max);
                    let res = if lp <= prefix && cpl >= lp {
                        Find::Found { leaf: l }
                    } else if prefix < lp && cpl >= prefix {
                        Find::Subset {
                            first: slot,
                            last: slot,
                        }
                    } else {
                        Find::NotFound { slot, bitpos: cpl }
                    };
                    return (res, path);
                }
                Entry::Node(n) => {
                    let node = self.nodes.get(n);
                    let (np, nip) = (node.prefix(), node.ip());
                    let cpl = common_prefix_len(ip, nip, max);
                    if prefix <= np {
                        let res = if cpl >= prefix {
                            Find::Subset {
                                first: slot,
                                last: slot,
                            }
                        } else {
                            Find::NotFound { slot, bitpos: cpl }
                        };
                        return (res, path);
                    }
                    if cpl < np {
                        return (Find::NotFound { slot, bitpos: cpl }, path);
                    }
                    path.push(n);

                    let first = child_slot(ip, np, max);
                    if prefix >= np + NUM_BITS {
                        match self.entry_at(n, first) {
                            None => {
                                return (Find::MultiLeaf { first, last: first }, path);
                            }
                            Some(e) => {
                                cur = e;
                                slot = first;
                                continue;
                            }
                        }
                    }

                    // the block spans several slots of this node
                    let last = first + slot_span(prefix, np) - 1;
                    if let Some(Entry::Leaf(l)) = self.entry_at(n, first) {
                        if self.leaves.get(l).prefix() <= prefix {
                            return (Find::Found { leaf: l }, path);
                        }
                    }
                    let res = if (first..=last).all(|s| node.is_vacant(s)) {
                        Find::MultiLeaf { first, last }
                    } else {
                        Find::Subset { first, last }
                    };
                    return (res, path);
                }
            }
        }
    }

    /// Whether the whole block `ip/prefix` is in the tree.
    pub fn contains_block(&self, ip: u128, prefix: u32) -> bool {
        if prefix == 0 || prefix > F::MAX_BITS {
            return false;
        }
        let ip = canonical(ip, prefix, F::MAX_BITS);
        matches!(self.find(ip, prefix).0, Find::Found { .. })
    }

    #[inline]
    pub fn contains(&self, ip: u128) -> bool {
        self.contains_block(ip, F::MAX_BITS)
    }

    /// Whether any address of `ip/prefix` is in the tree. Prefix 0 asks
    /// about the whole space.
    pub fn intersects_block(&self, ip: u128, prefix: u32) -> bool {
        if prefix == 0 {
            return !self.is_empty();
        }
        if prefix > F::MAX_BITS {
            return false;
        }
        let ip = canonical(ip, prefix, F::MAX_BITS);
        matches!(self.find(ip, prefix).0, Find::Found { .. } | Find::Subset { .. })
    }

    // ---- insert ------------------------------------------------------------

    /// Add `ip/prefix`. Host bits below the prefix are ignored.
    pub fn insert(&mut self, ip: u128, prefix: u32) -> Result<()> {
        Self::check_prefix(prefix)?;
        let ip = canonical(ip, prefix, F::MAX_BITS);
        let (res, path) = self.find(ip, prefix);
        trace!("[INSERT] ip={:x}/{} find={:?} depth={}", ip, prefix, res, path.len);

        match res {
            Find::Found { .. } => {}
            Find::Empty => {
                let l = self.new_leaf(ip, prefix)?;
                self.root = Some(Entry::Leaf(l));
            }
            Find::MultiLeaf { first, last } => {
                let l = self.new_leaf(ip, prefix)?;
                if let Some(n) = path.last() {
                    self.set_slots(n, first, last, Entry::Leaf(l));
                }
            }
            Find::Subset { first, last } => {
                let l = self.new_leaf(ip, prefix)?;
                match path.last() {
                    None => {
                        if let Some(old) = self.root.take() {
                            self.destroy_entry(old);
                        }
                        self.root = Some(Entry::Leaf(l));
                    }
                    Some(n) => {
                        self.destroy_slots(n, first, last);
                        self.set_slots(n, first, last, Entry::Leaf(l));
                    }
                }
            }
            Find::NotFound { slot, bitpos } => {
                let parent = path.last();
                let existing = match parent {
                    None => self.root,
                    Some(p) => self.entry_at(p, slot),
                };
                let Some(existing) = existing else {
                    return Err(Error::Corrupt("search stopped at a vacant slot".into()));
                };
                let node_prefix = bitpos - bitpos % NUM_BITS;
                let node = self.nodes.alloc()?;
                let leaf = match self.new_leaf(ip, prefix) {
                    Ok(l) => l,
                    Err(e) => {
                        self.nodes.free(node);
                        return Err(e);
                    }
                };
                {
                    let n = self.nodes.get_mut(node);
                    n.set_prefix(node_prefix);
                    n.set_ip(canonical(ip, node_prefix, F::MAX_BITS));
                }
                self.attach(node, existing);
                self.attach(node, Entry::Leaf(leaf));
                self.place(parent, slot, Entry::Node(node));
            }
        }
        Ok(())
    }

    // ---- remove ------------------------------------------------------------

    /// Remove `ip/prefix`, splitting a covering leaf when needed.
    pub fn remove(&mut self, ip: u128, prefix: u32) -> Result<()> {
        Self::check_prefix(prefix)?;
        let ip = canonical(ip, prefix, F::MAX_BITS);
        let (res, path) = self.find(ip, prefix);
        trace!("[REMOVE] ip={:x}/{} find={:?} depth={}", ip, prefix, res, path.len);

        match res {
            Find::Empty | Find::NotFound { .. } | Find::MultiLeaf { .. } => Ok(()),
            Find::Subset { first, last } => {
                match path.last() {
                    None => self.reset(),
                    Some(n) => {
                        self.destroy_slots(n, first, last);
                        self.fix_single_child(path.as_slice());
                    }
                }
                Ok(())
            }
            Find::Found { leaf } => {
                let lp = self.leaves.get(leaf).prefix();
                let pieces = (prefix - lp) as usize;
                // make sure re-inserting the remainder cannot fail halfway
                self.leaves.reserve(self.leaves.count() + pieces + 1)?;
                self.nodes.reserve(self.nodes.count() + pieces + 1)?;

                self.detach_leaf(&path, leaf);
                if lp < prefix {
                    // the covering block minus the request: one sibling
                    // block per prefix length between the two
                    for q in (lp + 1..=prefix).rev() {
                        let sibling = canonical(ip, q, F::MAX_BITS) ^ (1u128 << (F::MAX_BITS - q));
                        self.insert(sibling, q)?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Unhook `leaf` from the last node of `path` (or the root) and free it.
    fn detach_leaf(&mut self, path: &Path, leaf: u32) {
        match path.last() {
            None => {
                self.leaves.free(leaf);
                self.root = None;
            }
            Some(n) => {
                let (first, last) = self.slots_for(n, Entry::Leaf(leaf));
                self.nodes.get_mut(n).clear_slots(first, last);
                self.leaves.free(leaf);
                self.fix_single_child(path.as_slice());
            }
        }
    }

    /// Free `e` and everything below it.
    pub(crate) fn destroy_entry(&mut self, e: Entry) {
        let mut stack = Vec::with_capacity(MAX_DEPTH * NUM_CHILDREN);
        stack.push(e);
        while let Some(e) = stack.pop() {
            match e {
                Entry::Leaf(l) => self.leaves.free(l),
                Entry::Node(n) => {
                    let rep = self.nodes.get(n).repeated();
                    for s in 0..NUM_CHILDREN {
                        if !rep.get(s) {
                            if let Some(c) = self.entry_at(n, s) {
                                stack.push(c);
                            }
                        }
                    }
                    self.nodes.free(n);
                }
            }
        }
    }

    /// Free every entry in slots `[first, last]` of `node` and clear them.
    fn destroy_slots(&mut self, node: u32, first: usize, last: usize) {
        let mut doomed = [None; NUM_CHILDREN];
        let rep = self.nodes.get(node).repeated();
        for (s, slot) in doomed.iter_mut().enumerate().take(last + 1).skip(first) {
            if !rep.get(s) {
                *slot = self.entry_at(node, s);
            }
        }
        self.nodes.get_mut(node).clear_slots(first, last);
        for e in doomed.into_iter().flatten() {
            self.destroy_entry(e);
        }
    }

    /// Walk `path` upwards removing nodes left with no children and
    /// replacing nodes left with one child by that child.
    fn fix_single_child(&mut self, path: &[u32]) {
        let mut depth = path.len();
        while depth > 0 {
            let n = path[depth - 1];
            let parent = if depth >= 2 { Some(path[depth - 2]) } else { None };
            let slot = match parent {
                Some(p) => self.slots_for(p, Entry::Node(n)).0,
                None => 0,
            };
            let node = self.nodes.get(n);
            match node.child_count() {
                0 => {
                    match parent {
                        None => self.root = None,
                        Some(p) => self.nodes.get_mut(p).clear_slots(slot, slot),
                    }
                    self.nodes.free(n);
                    trace!("[REMOVE] dropped empty node {}", n);
                    depth -= 1;
                }
                1 => {
                    let only = (0..NUM_CHILDREN).find_map(|s| self.entry_at(n, s));
                    if let Some(only) = only {
                        self.place(parent, slot, only);
                        self.nodes.free(n);
                        trace!("[REMOVE] collapsed single-child node {}", n);
                    }
                    break;
                }
                _ => break,
            }
        }
    }
}

impl<F: Family> fmt::Debug for RadixTree<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RadixTree")
            .field("v6", &F::IS_V6)
            .field("root", &self.root)
            .field("nodes", &self.nodes.count())
            .field("leaves", &self.leaves.count())
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> u128 {
        u32::from(s.parse::<std::net::Ipv4Addr>().unwrap()) as u128
    }

    fn blocks(t: &RadixV4) -> Vec<(u128, u32)> {
        t.blocks().collect()
    }

    #[test]
    fn find_on_empty_tree() {
        let t = RadixV4::new();
        assert_eq!(t.find(0, 8).0, Find::Empty);
    }

    #[test]
    fn insert_covered_is_noop() {
        let mut t = RadixV4::new();
        t.insert(v4("10.0.0.0"), 8).unwrap();
        t.insert(v4("10.1.2.3"), 32).unwrap();
        assert_eq!(blocks(&t), vec![(v4("10.0.0.0"), 8)]);
        assert_eq!(t.leaves.count(), 2);
    }

    #[test]
    fn insert_covering_block_replaces_subtree() {
        let mut t = RadixV4::new();
        t.insert(v4("10.0.0.1"), 32).unwrap();
        t.insert(v4("10.0.1.0"), 24).unwrap();
        t.insert(v4("10.200.0.0"), 16).unwrap();
        t.insert(v4("10.0.0.0"), 8).unwrap();
        assert_eq!(blocks(&t), vec![(v4("10.0.0.0"), 8)]);
    }

    #[test]
    fn diverging_insert_creates_node() {
        let mut t = RadixV4::new();
        t.insert(v4("10.0.0.0"), 8).unwrap();
        t.insert(v4("11.0.0.0"), 8).unwrap();
        let Some(Entry::Node(n)) = t.root else { panic!("expected node root") };
        // 10 and 11 differ in bit 7, so the node branches on bits 4..8
        assert_eq!(t.nodes.get(n).prefix(), 4);
        assert_eq!(blocks(&t), vec![(v4("10.0.0.0"), 8), (v4("11.0.0.0"), 8)]);
    }

    #[test]
    fn multi_slot_leaf() {
        let mut t = RadixV4::new();
        t.insert(v4("10.0.0.0"), 8).unwrap();
        t.insert(v4("12.0.0.0"), 6).unwrap();
        // 12.0.0.0/6 spans 12..15 in the node at prefix 4
        let Some(Entry::Node(n)) = t.root else { panic!("expected node root") };
        let node = t.nodes.get(n);
        assert!(node.is_leaf().get(0xC));
        assert!(!node.repeated().get(0xC));
        assert!(node.repeated().get(0xD) && node.repeated().get(0xF));
        assert!(t.contains(v4("15.255.0.1")));
        assert!(!t.contains(v4("11.0.0.0")));
        t.verify().unwrap();
    }

    #[test]
    fn remove_splits_covering_leaf() {
        let mut t = RadixV4::new();
        t.insert(v4("10.1.0.0"), 16).unwrap();
        t.remove(v4("10.1.2.3"), 32).unwrap();
        let got = blocks(&t);
        assert_eq!(got.len(), 16);
        assert!(!t.contains(v4("10.1.2.3")));
        assert!(t.contains(v4("10.1.2.2")));
        assert!(t.contains(v4("10.1.255.255")));
        t.verify().unwrap();
    }

    #[test]
    fn remove_larger_block_clears_only_inside() {
        let mut t = RadixV4::new();
        t.insert(v4("10.0.0.0"), 24).unwrap();
        t.insert(v4("10.0.5.0"), 24).unwrap();
        t.insert(v4("192.168.0.0"), 16).unwrap();
        t.remove(v4("10.0.0.0"), 8).unwrap();
        assert_eq!(blocks(&t), vec![(v4("192.168.0.0"), 16)]);
        t.verify().unwrap();
    }

    #[test]
    fn remove_everything_empties_tree() {
        let mut t = RadixV4::new();
        t.insert(v4("1.2.3.4"), 32).unwrap();
        t.insert(v4("5.6.7.8"), 32).unwrap();
        t.remove(v4("1.2.3.4"), 32).unwrap();
        t.remove(v4("5.6.7.8"), 32).unwrap();
        assert!(t.is_empty());
    }

    #[test]
    fn rejects_bad_prefixes() {
        let mut t = RadixV4::new();
        assert!(matches!(t.insert(0, 0), Err(Error::BadInput(_))));
        assert!(matches!(t.insert(0, 33), Err(Error::Prefix { .. })));
        assert!(t.is_empty());
    }

    #[test]
    fn intersects() {
        let mut t = RadixV4::new();
        t.insert(v4("10.1.1.0"), 24).unwrap();
        assert!(t.intersects_block(v4("10.0.0.0"), 8));
        assert!(t.intersects_block(v4("10.1.1.7"), 32));
        assert!(!t.intersects_block(v4("11.0.0.0"), 8));
        assert!(!t.contains_block(v4("10.0.0.0"), 8));
        assert!(t.contains_block(v4("10.1.1.128"), 25));
    }
}
