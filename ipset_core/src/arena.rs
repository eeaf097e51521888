//! Index-addressed record arenas.
//!
//! An arena is a growable array of fixed-size `Pod` records referenced by
//! `u32` index. Index 0 is a sentinel that is never handed out, so 0 can
//! mean "no child" inside the tree. Freed records go on a LIFO free list
//! threaded through one in-band word of the record.
//!
//! An arena may also borrow its records from a mapped file. The first call
//! that needs mutable access copies the records into owned storage; from
//! then on the arena behaves like any other. Indices never change across
//! that copy.

use std::sync::Arc;

use bytemuck::Pod;
use log::{debug, trace};

use crate::constants::{ARENA_DOUBLING_LIMIT, ARENA_INITIAL_ENTRIES, ARENA_LINEAR_STEP};
use crate::errors::{Error, Result};
use crate::platform::MappedRegion;

/// A record that can live in an [`Arena`].
pub trait ArenaRecord: Pod {
    /// Name used in log lines and allocation errors.
    const KIND: &'static str;

    /// Next entry of the free list when this record is free.
    fn free_link(&self) -> u32;
    fn set_free_link(&mut self, next: u32);
}

#[derive(Clone)]
pub struct Arena<T: ArenaRecord> {
    /// Owned records; `len()` is the capacity and everything past `count`
    /// is zeroed. Empty while `mapped` is set.
    records: Vec<T>,
    /// File region the records are borrowed from, and their byte offset.
    mapped: Option<(Arc<MappedRegion>, usize)>,
    /// Entries issued so far, sentinel included. 0 for a fresh arena.
    count: usize,
    free_head: u32,
}

/// Next capacity under the growth policy.
fn next_capacity(cap: usize) -> usize {
    if cap < ARENA_INITIAL_ENTRIES {
        ARENA_INITIAL_ENTRIES
    } else if cap < ARENA_DOUBLING_LIMIT {
        (cap * 2).min(ARENA_DOUBLING_LIMIT)
    } else {
        cap + ARENA_LINEAR_STEP
    }
}

impl<T: ArenaRecord> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ArenaRecord> Arena<T> {
    pub fn new() -> Self {
        Arena {
            records: Vec::new(),
            mapped: None,
            count: 0,
            free_head: 0,
        }
    }

    /// Wrap records read from a file. `records[0]` is the sentinel.
    pub fn from_records(records: Vec<T>) -> Self {
        let count = records.len();
        Arena {
            records,
            mapped: None,
            count,
            free_head: 0,
        }
    }

    /// Borrow `count` records starting `offset` bytes into `region`.
    pub fn from_mapped(region: Arc<MappedRegion>, offset: usize, count: usize) -> Result<Self> {
        let bytes = count
            .checked_mul(std::mem::size_of::<T>())
            .and_then(|n| n.checked_add(offset))
            .filter(|&end| end <= region.len())
            .ok_or_else(|| Error::Corrupt(format!("{} region exceeds mapped file", T::KIND)))?;
        bytemuck::try_cast_slice::<u8, T>(&region.as_bytes()[offset..bytes])
            .map_err(|_| Error::Corrupt(format!("{} region is misaligned", T::KIND)))?;
        Ok(Arena {
            records: Vec::new(),
            mapped: Some((region, offset)),
            count,
            free_head: 0,
        })
    }

    /// Entries issued, sentinel included.
    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        match self.mapped {
            Some(_) => self.count,
            None => self.records.len(),
        }
    }

    #[inline]
    pub fn free_head(&self) -> u32 {
        self.free_head
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// The issued records, sentinel included.
    pub fn as_slice(&self) -> &[T] {
        match &self.mapped {
            None => &self.records[..self.count],
            Some((region, offset)) => {
                let end = offset + self.count * std::mem::size_of::<T>();
                // alignment and bounds were checked in from_mapped
                bytemuck::try_cast_slice(&region.as_bytes()[*offset..end]).unwrap_or(&[])
            }
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let count = self.count;
        &mut self.owned()[..count]
    }

    #[inline]
    pub fn get(&self, idx: u32) -> &T {
        &self.as_slice()[idx as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, idx: u32) -> &mut T {
        &mut self.owned()[idx as usize]
    }

    /// Copy mapped records into owned storage. Returns whether a copy was
    /// made.
    pub fn make_owned(&mut self) -> Result<bool> {
        if !self.is_mapped() {
            return Ok(false);
        }
        let mut v: Vec<T> = Vec::new();
        v.try_reserve_exact(self.count).map_err(|_| Error::Alloc(T::KIND))?;
        v.extend_from_slice(self.as_slice());
        debug!("[COW] copied {} {} records out of the mapping", self.count, T::KIND);
        self.records = v;
        self.mapped = None;
        Ok(true)
    }

    fn owned(&mut self) -> &mut Vec<T> {
        if self.mapped.is_some() {
            self.records = self.as_slice().to_vec();
            self.mapped = None;
        }
        &mut self.records
    }

    fn grow(&mut self) -> Result<()> {
        let v = self.owned();
        let old = v.len();
        let new = next_capacity(old);
        v.try_reserve_exact(new - old).map_err(|_| Error::Alloc(T::KIND))?;
        v.resize(new, T::zeroed());
        trace!("[ALLOC] {} arena grown {} -> {}", T::KIND, old, new);
        Ok(())
    }

    /// Issue a zeroed record: unused tail first, then the free list, then
    /// a grown buffer.
    pub fn alloc(&mut self) -> Result<u32> {
        if self.count == 0 {
            if self.capacity() < 2 {
                self.grow()?;
            }
            self.count = 1;
        }
        if self.count >= self.capacity() && self.free_head != 0 {
            let idx = self.free_head;
            let rec = self.get_mut(idx);
            let next = rec.free_link();
            *rec = T::zeroed();
            self.free_head = next;
            trace!("[ALLOC] reusing free {} at {}", T::KIND, idx);
            return Ok(idx);
        }
        if self.count >= self.capacity() {
            self.grow()?;
        }
        let idx = u32::try_from(self.count).map_err(|_| Error::Alloc(T::KIND))?;
        self.count += 1;
        *self.get_mut(idx) = T::zeroed();
        Ok(idx)
    }

    /// Return `idx` to the free list.
    pub fn free(&mut self, idx: u32) {
        debug_assert!(idx != 0 && (idx as usize) < self.count);
        let head = self.free_head;
        let rec = self.get_mut(idx);
        *rec = T::zeroed();
        rec.set_free_link(head);
        self.free_head = idx;
    }

    /// Walk the free list. Stops at the first index that is out of range
    /// or already seen, reporting it as `Err`.
    pub fn free_list(&self) -> std::result::Result<Vec<u32>, u32> {
        let mut out = Vec::new();
        let mut seen = vec![false; self.count];
        let mut idx = self.free_head;
        while idx != 0 {
            let i = idx as usize;
            if i >= self.count || seen[i] {
                return Err(idx);
            }
            seen[i] = true;
            out.push(idx);
            idx = self.get(idx).free_link();
        }
        Ok(out)
    }

    /// Keep entries `[0, count)`, zero the rest and forget the free list.
    pub fn truncate(&mut self, count: usize) {
        let old = self.count;
        if count < old {
            for rec in &mut self.owned()[count..old] {
                *rec = T::zeroed();
            }
        }
        self.count = count.min(old);
        self.free_head = 0;
    }

    /// Release capacity beyond the issued entries.
    pub fn shrink(&mut self) {
        if self.mapped.is_none() {
            self.records.truncate(self.count);
            self.records.shrink_to_fit();
        }
    }

    /// Drop every record, including the sentinel.
    pub fn clear(&mut self) {
        self.records = Vec::new();
        self.mapped = None;
        self.count = 0;
        self.free_head = 0;
    }

    /// Reserve room for at least `n` issued entries.
    pub fn reserve(&mut self, n: usize) -> Result<()> {
        while self.capacity() < n {
            self.grow()?;
        }
        Ok(())
    }

    /// Rebuild with another record type, one-to-one by index. The free list
    /// is carried over.
    pub fn map_into<U, F>(&self, mut f: F) -> Result<Arena<U>>
    where
        U: ArenaRecord,
        F: FnMut(&T) -> U,
    {
        let mut v: Vec<U> = Vec::new();
        v.try_reserve_exact(self.count).map_err(|_| Error::Alloc(U::KIND))?;
        v.extend(self.as_slice().iter().map(&mut f));
        let free = self.free_list().unwrap_or_default();
        for &idx in &free {
            let next = self.get(idx).free_link();
            v[idx as usize] = U::zeroed();
            v[idx as usize].set_free_link(next);
        }
        let mut out = Arena::from_records(v);
        out.free_head = self.free_head;
        Ok(out)
    }

    /// Record bytes as laid out in memory, sentinel included.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;

    #[repr(C)]
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
    struct Rec {
        link: u32,
        val: u32,
    }

    impl ArenaRecord for Rec {
        const KIND: &'static str = "test";
        fn free_link(&self) -> u32 {
            self.link
        }
        fn set_free_link(&mut self, next: u32) {
            self.link = next;
        }
    }

    #[test]
    fn never_issues_sentinel() {
        let mut a: Arena<Rec> = Arena::new();
        assert_eq!(a.alloc().unwrap(), 1);
        assert_eq!(a.alloc().unwrap(), 2);
        assert_eq!(a.count(), 3);
        assert_eq!(a.capacity(), ARENA_INITIAL_ENTRIES);
    }

    #[test]
    fn tail_before_free_list() {
        let mut a: Arena<Rec> = Arena::new();
        let x = a.alloc().unwrap();
        let _y = a.alloc().unwrap();
        a.free(x);
        // tail still has room, so the freed entry waits
        assert_eq!(a.alloc().unwrap(), 3);
        assert_eq!(a.free_list().unwrap(), vec![x]);
    }

    #[test]
    fn free_list_is_lifo_once_tail_is_full() {
        let mut a: Arena<Rec> = Arena::new();
        for _ in 1..ARENA_INITIAL_ENTRIES {
            a.alloc().unwrap();
        }
        assert_eq!(a.count(), a.capacity());
        a.free(5);
        a.free(9);
        assert_eq!(a.alloc().unwrap(), 9);
        assert_eq!(a.alloc().unwrap(), 5);
        // now it must grow
        assert_eq!(a.alloc().unwrap() as usize, ARENA_INITIAL_ENTRIES);
        assert_eq!(a.capacity(), ARENA_INITIAL_ENTRIES * 2);
    }

    #[test]
    fn growth_policy() {
        assert_eq!(next_capacity(0), 2_048);
        assert_eq!(next_capacity(2_048), 4_096);
        assert_eq!(next_capacity(524_288), 1_048_576);
        assert_eq!(next_capacity(1_048_576), 2_097_152);
        assert_eq!(next_capacity(2_097_152), 3_145_728);
    }

    #[test]
    fn truncate_zeroes_tail() {
        let mut a: Arena<Rec> = Arena::new();
        for v in 1..=4 {
            let i = a.alloc().unwrap();
            a.get_mut(i).val = v;
        }
        a.free(2);
        a.truncate(3);
        assert_eq!(a.count(), 3);
        assert_eq!(a.free_head(), 0);
        assert_eq!(a.as_slice().len(), 3);
        assert_eq!(a.alloc().unwrap(), 3);
        assert_eq!(a.get(3).val, 0);
    }

    #[test]
    fn map_into_keeps_free_list() {
        let mut a: Arena<Rec> = Arena::new();
        for _ in 0..4 {
            a.alloc().unwrap();
        }
        a.free(2);
        let b: Arena<Rec> = a.map_into(|r| Rec { link: r.link, val: r.val + 1 }).unwrap();
        assert_eq!(b.free_head(), 2);
        assert_eq!(b.free_list().unwrap(), vec![2]);
        assert_eq!(b.get(1).val, 1);
    }
}
