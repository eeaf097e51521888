//! Ordered traversal of the leaves of a radix tree.

use std::fmt::{self, Write};

use super::{Entry, Family, LeafRecord, NodeRecord, RadixTree};
use crate::constants::{MAX_DEPTH, NUM_CHILDREN};
use crate::helpers::{block_count, u128_to_ip};

/// Leaves of a tree as `(ip, prefix)` in ascending address order.
///
/// A tree with the clean layout is read straight out of the leaf arena;
/// anything else is walked depth-first with an explicit stack.
pub struct Blocks<'a, F: Family> {
    tree: &'a RadixTree<F>,
    mode: Mode,
}

enum Mode {
    Linear { next: usize },
    Dfs { stack: Vec<(u32, usize)>, root_leaf: Option<u32> },
    Done,
}

impl<'a, F: Family> Blocks<'a, F> {
    fn linear(tree: &'a RadixTree<F>) -> Self {
        Blocks {
            tree,
            mode: Mode::Linear { next: 1 },
        }
    }

    fn dfs(tree: &'a RadixTree<F>) -> Self {
        let mode = match tree.root {
            None => Mode::Done,
            Some(Entry::Leaf(l)) => Mode::Dfs {
                stack: Vec::new(),
                root_leaf: Some(l),
            },
            Some(Entry::Node(n)) => {
                let mut stack = Vec::with_capacity(MAX_DEPTH);
                stack.push((n, 0));
                Mode::Dfs { stack, root_leaf: None }
            }
        };
        Blocks { tree, mode }
    }
}

impl<F: Family> Iterator for Blocks<'_, F> {
    type Item = (u128, u32);

    fn next(&mut self) -> Option<Self::Item> {
        let tree = self.tree;
        match &mut self.mode {
            Mode::Done => None,
            Mode::Linear { next } => {
                let leaves = tree.leaves.as_slice();
                let leaf = leaves.get(*next)?;
                *next += 1;
                Some((leaf.ip(), leaf.prefix()))
            }
            Mode::Dfs { stack, root_leaf } => {
                if let Some(l) = root_leaf.take() {
                    let leaf = tree.leaves.get(l);
                    return Some((leaf.ip(), leaf.prefix()));
                }
                while let Some(top) = stack.last_mut() {
                    let (n, s) = *top;
                    if s >= NUM_CHILDREN {
                        stack.pop();
                        continue;
                    }
                    top.1 += 1;
                    let node = tree.nodes.get(n);
                    if node.repeated().get(s) {
                        continue;
                    }
                    match tree.entry_at(n, s) {
                        None => {}
                        Some(Entry::Leaf(l)) => {
                            let leaf = tree.leaves.get(l);
                            return Some((leaf.ip(), leaf.prefix()));
                        }
                        Some(Entry::Node(c)) => stack.push((c, 0)),
                    }
                }
                None
            }
        }
    }
}

impl<F: Family> RadixTree<F> {
    /// Blocks in ascending order, walking the tree.
    pub fn blocks(&self) -> Blocks<'_, F> {
        Blocks::dfs(self)
    }

    /// Blocks in ascending order, reading the leaf arena directly. Only
    /// valid on a tree with the clean layout.
    pub fn blocks_linear(&self) -> Blocks<'_, F> {
        if self.root.is_none() {
            return Blocks {
                tree: self,
                mode: Mode::Done,
            };
        }
        Blocks::linear(self)
    }

    /// Number of addresses, and whether the total is exactly 2^128 (the
    /// one value a `u128` cannot hold).
    pub fn count_addresses(&self) -> (u128, bool) {
        let mut total: u128 = 0;
        let mut overflow = false;
        for (_, prefix) in self.blocks() {
            let (t, o) = total.overflowing_add(block_count(prefix, F::MAX_BITS));
            total = t;
            overflow |= o;
        }
        (total, overflow)
    }

    /// Indented listing of every node and leaf.
    pub fn debug_dump(&self, out: &mut String) -> fmt::Result {
        writeln!(
            out,
            "radix v{}: root={:?} nodes={}/{} leaves={}/{} free=({}, {}) mapped={}",
            if F::IS_V6 { 6 } else { 4 },
            self.root,
            self.nodes.count(),
            self.nodes.capacity(),
            self.leaves.count(),
            self.leaves.capacity(),
            self.nodes.free_head(),
            self.leaves.free_head(),
            self.is_mapped()
        )?;
        let mut stack: Vec<(Entry, usize)> = Vec::new();
        if let Some(r) = self.root {
            stack.push((r, 0));
        }
        while let Some((e, depth)) = stack.pop() {
            let pad = "  ".repeat(depth + 1);
            match e {
                Entry::Leaf(l) => {
                    let leaf = self.leaves.get(l);
                    writeln!(out, "{}L{} {}/{}", pad, l, u128_to_ip(leaf.ip(), F::IS_V6), leaf.prefix())?;
                }
                Entry::Node(n) => {
                    let node = self.nodes.get(n);
                    writeln!(
                        out,
                        "{}N{} {}/{} leaf={:04x} rep={:04x}",
                        pad,
                        n,
                        u128_to_ip(node.ip(), F::IS_V6),
                        node.prefix(),
                        node.is_leaf().raw(),
                        node.repeated().raw()
                    )?;
                    for s in (0..NUM_CHILDREN).rev() {
                        if !node.repeated().get(s) {
                            if let Some(c) = self.entry_at(n, s) {
                                stack.push((c, depth + 1));
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::RadixV4;

    #[test]
    fn linear_and_dfs_agree_after_clean() {
        let mut t = RadixV4::new();
        for ip in [0x0A00_0000u128, 0x0100_0000, 0xC0A8_0000, 0x0A01_0000] {
            t.insert(ip, 16).unwrap();
        }
        t.clean().unwrap();
        let dfs: Vec<_> = t.blocks().collect();
        let lin: Vec<_> = t.blocks_linear().collect();
        assert_eq!(dfs, lin);
        assert_eq!(dfs[0], (0x0100_0000, 16));
        assert_eq!(dfs[1], (0x0A00_0000, 15));
    }

    #[test]
    fn counts() {
        let mut t = RadixV4::new();
        t.insert(0, 1).unwrap();
        t.insert(0x8000_0000, 1).unwrap();
        assert_eq!(t.count_addresses(), (1u128 << 32, false));
        let mut s = String::new();
        t.debug_dump(&mut s).unwrap();
        assert!(s.contains("0.0.0.0/1"));
    }
}
