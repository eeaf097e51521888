//! Whole-tree passes: verify, combine-adjacent, compact/sort, clean.

use bytemuck::Zeroable;
use log::{debug, trace};

use super::{Entry, Family, LeafRecord, NodeRecord, RadixTree};
use crate::arena::Arena;
use crate::constants::{MAX_DEPTH, NUM_BITS, NUM_CHILDREN};
use crate::errors::{Error, Result};
use crate::helpers::{canonical, child_slot, slot_span};

#[derive(Copy, Clone, PartialEq, Eq)]
enum Mark {
    Unseen,
    Free,
    InTree,
}

fn corrupt(msg: String) -> Error {
    Error::Corrupt(msg)
}

impl<F: Family> RadixTree<F> {
    /// Check the structural invariants without modifying anything.
    pub fn verify(&self) -> Result<()> {
        let max = F::MAX_BITS;
        let ncount = self.nodes.count();
        let lcount = self.leaves.count();
        let mut nmark = vec![Mark::Unseen; ncount];
        let mut lmark = vec![Mark::Unseen; lcount];

        let free_nodes = self
            .nodes
            .free_list()
            .map_err(|i| corrupt(format!("node free list is broken at {}", i)))?;
        for i in free_nodes {
            nmark[i as usize] = Mark::Free;
        }
        let free_leaves = self
            .leaves
            .free_list()
            .map_err(|i| corrupt(format!("leaf free list is broken at {}", i)))?;
        for i in free_leaves {
            lmark[i as usize] = Mark::Free;
        }

        let claim_leaf = |l: u32, lmark: &mut Vec<Mark>| -> Result<(u128, u32)> {
            let i = l as usize;
            if i == 0 || i >= lcount {
                return Err(corrupt(format!("leaf index {} out of range", l)));
            }
            match lmark[i] {
                Mark::Unseen => lmark[i] = Mark::InTree,
                Mark::Free => return Err(corrupt(format!("leaf {} is both free and in use", l))),
                Mark::InTree => return Err(corrupt(format!("leaf {} is reachable twice", l))),
            }
            let leaf = self.leaves.get(l);
            let (ip, prefix) = (leaf.ip(), leaf.prefix());
            if prefix == 0 || prefix > max {
                return Err(corrupt(format!("leaf {} has prefix {}", l, prefix)));
            }
            if canonical(ip, prefix, max) != ip {
                return Err(corrupt(format!("leaf {} has host bits set", l)));
            }
            Ok((ip, prefix))
        };

        let mut stack: Vec<u32> = Vec::with_capacity(MAX_DEPTH * NUM_CHILDREN);
        match self.root {
            None => return Ok(()),
            Some(Entry::Leaf(l)) => {
                claim_leaf(l, &mut lmark)?;
                return Ok(());
            }
            Some(Entry::Node(n)) => stack.push(n),
        }

        while let Some(n) = stack.pop() {
            let i = n as usize;
            if i == 0 || i >= ncount {
                return Err(corrupt(format!("node index {} out of range", n)));
            }
            match nmark[i] {
                Mark::Unseen => nmark[i] = Mark::InTree,
                Mark::Free => return Err(corrupt(format!("node {} is both free and in use", n))),
                Mark::InTree => return Err(corrupt(format!("node {} is reachable twice", n))),
            }
            let node = self.nodes.get(n);
            let (np, nip) = (node.prefix(), node.ip());
            if np % NUM_BITS != 0 || np + NUM_BITS > max {
                return Err(corrupt(format!("node {} has prefix {}", n, np)));
            }
            if canonical(nip, np, max) != nip {
                return Err(corrupt(format!("node {} has host bits set", n)));
            }

            let is_leaf = node.is_leaf();
            let rep = node.repeated();
            let mut run_until = 0usize;
            let mut children = 0usize;
            for s in 0..NUM_CHILDREN {
                let c = node.child(s);
                if s < run_until {
                    if c != node.child(s - 1) || !is_leaf.get(s) || !rep.get(s) {
                        return Err(corrupt(format!("node {} slot {} breaks a leaf run", n, s)));
                    }
                    continue;
                }
                if rep.get(s) {
                    return Err(corrupt(format!("node {} slot {} repeats outside a run", n, s)));
                }
                if c == 0 {
                    if is_leaf.get(s) {
                        return Err(corrupt(format!("node {} slot {} is an empty leaf", n, s)));
                    }
                    continue;
                }
                children += 1;
                if is_leaf.get(s) {
                    let (lip, lp) = claim_leaf(c, &mut lmark)?;
                    if lp <= np
                        || canonical(lip, np, max) != nip
                        || child_slot(lip, np, max) != s
                    {
                        return Err(corrupt(format!("leaf {} does not belong in node {} slot {}", c, n, s)));
                    }
                    let span = slot_span(lp, np);
                    if s + span > NUM_CHILDREN {
                        return Err(corrupt(format!("leaf {} overruns node {}", c, n)));
                    }
                    run_until = s + span;
                } else {
                    let ci = c as usize;
                    if ci >= ncount {
                        return Err(corrupt(format!("node index {} out of range", c)));
                    }
                    let child = self.nodes.get(c);
                    let (cp, cip) = (child.prefix(), child.ip());
                    if cp < np + NUM_BITS
                        || canonical(cip, np, max) != nip
                        || child_slot(cip, np, max) != s
                    {
                        return Err(corrupt(format!("node {} does not belong in node {} slot {}", c, n, s)));
                    }
                    stack.push(c);
                }
            }
            if children == 0 {
                trace!("[VERIFY] node {} has no children", n);
            }
        }
        Ok(())
    }

    /// Merge sibling leaves into larger blocks and collapse nodes left
    /// with a single child.
    pub(crate) fn combine_adjacent(&mut self) {
        let Some(Entry::Node(root)) = self.root else {
            return;
        };
        // pre-order list of (node, parent, slot in parent); visited in
        // reverse so children are done before their parent
        let mut order: Vec<(u32, Option<u32>, usize)> = Vec::new();
        let mut stack = vec![(root, None, 0usize)];
        while let Some(item) = stack.pop() {
            order.push(item);
            let n = item.0;
            for s in 0..NUM_CHILDREN {
                if let Some(Entry::Node(c)) = self.entry_at(n, s) {
                    stack.push((c, Some(n), s));
                }
            }
        }

        let mut merged = 0usize;
        for &(n, parent, slot) in order.iter().rev() {
            merged += self.merge_siblings(n);
            self.collapse_node(n, parent, slot);
        }
        if merged > 0 {
            debug!("[CLEAN] merged {} pairs of sibling leaves", merged);
        }
    }

    /// Merge equal-sized buddy leaves inside `n`, smallest first.
    fn merge_siblings(&mut self, n: u32) -> usize {
        let np = self.nodes.get(n).prefix();
        // a node at prefix 0 keeps the two halves apart
        let lowest = if np == 0 { 2 } else { np + 1 };
        let mut merged = 0;
        for q in (lowest..=np + NUM_BITS).rev() {
            let span = slot_span(q, np);
            let mut a = 0;
            while a + span < NUM_CHILDREN {
                let b = a + span;
                let node = self.nodes.get(n);
                let rep = node.repeated();
                if let (Some(Entry::Leaf(la)), Some(Entry::Leaf(lb))) = (self.entry_at(n, a), self.entry_at(n, b)) {
                    if !rep.get(a)
                        && !rep.get(b)
                        && self.leaves.get(la).prefix() == q
                        && self.leaves.get(lb).prefix() == q
                    {
                        self.leaves.get_mut(la).set_prefix(q - 1);
                        self.set_slots(n, a, b + span - 1, Entry::Leaf(la));
                        self.leaves.free(lb);
                        merged += 1;
                    }
                }
                a += 2 * span;
            }
        }
        merged
    }

    /// Remove `n` if it is empty; replace it by its child if it has one.
    fn collapse_node(&mut self, n: u32, parent: Option<u32>, slot: usize) {
        match self.nodes.get(n).child_count() {
            0 => {
                match parent {
                    None => self.root = None,
                    Some(p) => self.nodes.get_mut(p).clear_slots(slot, slot),
                }
                self.nodes.free(n);
            }
            1 => {
                if let Some(only) = (0..NUM_CHILDREN).find_map(|s| self.entry_at(n, s)) {
                    self.place(parent, slot, only);
                    self.nodes.free(n);
                }
            }
            _ => {}
        }
    }

    /// Rebuild both arenas hole-free: nodes in pre-order, leaves in
    /// ascending address order from index 1. Free lists end up empty.
    pub(crate) fn sort_leaves(&mut self) -> Result<()> {
        let Some(root) = self.root else {
            self.reset();
            return Ok(());
        };

        let mut nodes: Vec<F::Node> = Vec::new();
        let mut leaves: Vec<F::Leaf> = Vec::new();
        nodes
            .try_reserve_exact(self.nodes.count().max(1))
            .map_err(|_| Error::Alloc("node"))?;
        leaves
            .try_reserve_exact(self.leaves.count().max(2))
            .map_err(|_| Error::Alloc("leaf"))?;
        nodes.push(F::Node::zeroed());
        leaves.push(F::Leaf::zeroed());

        let new_root = match root {
            Entry::Leaf(l) => {
                leaves.push(*self.leaves.get(l));
                Entry::Leaf(1)
            }
            Entry::Node(n) => {
                nodes.push(*self.nodes.get(n));
                let mut stack: Vec<(usize, usize)> = Vec::with_capacity(MAX_DEPTH);
                stack.push((1, 0));
                while let Some(top) = stack.last_mut() {
                    let (ni, s) = *top;
                    if s >= NUM_CHILDREN {
                        stack.pop();
                        continue;
                    }
                    top.1 += 1;
                    let rec = nodes[ni];
                    let c = rec.child(s);
                    if c == 0 {
                        continue;
                    }
                    if rec.is_leaf().get(s) {
                        let new_idx = if rec.repeated().get(s) {
                            rec.child(s - 1)
                        } else {
                            leaves.push(*self.leaves.get(c));
                            (leaves.len() - 1) as u32
                        };
                        nodes[ni].set_child(s, new_idx);
                    } else {
                        nodes.push(*self.nodes.get(c));
                        let new_idx = nodes.len() - 1;
                        nodes[ni].set_child(s, new_idx as u32);
                        stack.push((new_idx, 0));
                    }
                }
                Entry::Node(1)
            }
        };

        trace!(
            "[CLEAN] compacted nodes {} -> {}, leaves {} -> {}",
            self.nodes.count(),
            nodes.len(),
            self.leaves.count(),
            leaves.len()
        );
        self.nodes = Arena::from_records(nodes);
        self.leaves = Arena::from_records(leaves);
        self.root = Some(new_root);
        Ok(())
    }

    /// Restore every clean-set invariant. Fails `Corrupt` without touching
    /// the tree when the structure is inconsistent.
    pub fn clean(&mut self) -> Result<()> {
        self.make_owned()?;
        self.verify()?;
        self.combine_adjacent();
        self.sort_leaves()
    }

    /// Whether every issued node is reachable from the root and none sits on
    /// the free list. Assumes a verified tree.
    pub(crate) fn nodes_compact(&self) -> bool {
        let mut reached = 0usize;
        let mut stack: Vec<u32> = Vec::with_capacity(MAX_DEPTH * NUM_CHILDREN);
        if let Some(Entry::Node(n)) = self.root {
            stack.push(n);
        }
        while let Some(n) = stack.pop() {
            reached += 1;
            for s in 0..NUM_CHILDREN {
                if let Some(Entry::Node(c)) = self.entry_at(n, s) {
                    stack.push(c);
                }
            }
        }
        self.nodes.free_head() == 0 && reached + 1 == self.nodes.count().max(1)
    }

    /// Whether the arenas already have the clean layout. Used by loaders to
    /// decide if a file can be iterated linearly.
    pub(crate) fn leaves_ascending(&self) -> bool {
        let leaves = self.leaves.as_slice();
        leaves.len() < 3 || leaves[1..].windows(2).all(|w| w[0].ip() < w[1].ip())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{RadixV4, RadixV6};
    use super::*;
    use crate::helpers::v4_to_v6;

    fn v4(s: &str) -> u128 {
        u32::from(s.parse::<std::net::Ipv4Addr>().unwrap()) as u128
    }

    #[test]
    fn four_hosts_merge_to_slash30() {
        let mut t = RadixV4::new();
        for i in 0..4 {
            t.insert(v4("1.0.0.0") + i, 32).unwrap();
        }
        t.clean().unwrap();
        assert_eq!(t.blocks().collect::<Vec<_>>(), vec![(v4("1.0.0.0"), 30)]);
        assert_eq!(t.leaf_count(), 2);
    }

    #[test]
    fn halves_stay_apart() {
        let mut t = RadixV4::new();
        t.insert(0, 1).unwrap();
        t.insert(v4("128.0.0.0"), 1).unwrap();
        t.clean().unwrap();
        assert_eq!(t.blocks().collect::<Vec<_>>(), vec![(0, 1), (v4("128.0.0.0"), 1)]);
    }

    #[test]
    fn clean_sorts_leaves() {
        let mut t = RadixV4::new();
        for ip in ["9.0.0.1", "3.3.3.3", "200.1.1.1", "3.3.3.4", "77.0.0.0"] {
            t.insert(v4(ip), 32).unwrap();
        }
        t.remove(v4("77.0.0.0"), 32).unwrap();
        t.clean().unwrap();
        let leaves = t.leaves.as_slice();
        assert!(leaves[1..].windows(2).all(|w| w[0].ip() < w[1].ip()));
        assert_eq!(t.leaves.free_head(), 0);
        assert_eq!(t.nodes.free_head(), 0);
        assert!(t.leaves_ascending());
        t.verify().unwrap();
    }

    #[test]
    fn verify_detects_bad_prefix() {
        let mut t = RadixV4::new();
        t.insert(v4("10.0.0.0"), 8).unwrap();
        t.insert(v4("11.0.0.0"), 8).unwrap();
        t.leaves.get_mut(1).set_prefix(40);
        assert!(matches!(t.verify(), Err(Error::Corrupt(_))));
    }

    #[test]
    fn verify_detects_shared_leaf() {
        let mut t = RadixV4::new();
        t.insert(v4("10.0.0.0"), 8).unwrap();
        t.insert(v4("11.0.0.0"), 8).unwrap();
        let Some(Entry::Node(n)) = t.root else { panic!("expected node root") };
        let a = t.nodes.get(n).child(0xA);
        t.nodes.get_mut(n).set_child(0xB, a);
        assert!(t.verify().is_err());
    }

    #[test]
    fn clean_is_idempotent() {
        let mut t = RadixV6::new();
        t.insert(v4_to_v6(0x0A00_0000), 120).unwrap();
        t.insert(0x2001_0db8u128 << 96, 32).unwrap();
        t.insert(v4_to_v6(0x0A00_0100), 120).unwrap();
        t.clean().unwrap();
        let once: Vec<_> = t.blocks().collect();
        let bytes = t.leaves.as_bytes().to_vec();
        t.clean().unwrap();
        assert_eq!(t.blocks().collect::<Vec<_>>(), once);
        assert_eq!(t.leaves.as_bytes(), &bytes[..]);
        assert_eq!(once[0], (v4_to_v6(0x0A00_0000), 119));
    }
}
