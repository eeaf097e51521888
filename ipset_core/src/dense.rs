//! Two-level bit-per-address IPv4 set.
//!
//! The top level has one slot per /16; a present slot owns 2,048 32-bit
//! words, one bit per address. Bit `ip & 31` of word `(ip >> 5) & 0x7FF`
//! holds address `ip`. A present slot is never all zeroes.

use log::trace;

use crate::constants::{DENSE_BLOCK_WORDS, DENSE_TOP_SLOTS};
use crate::errors::{Error, Result};
use crate::helpers::largest_block;

type Block = Box<[u32]>;

#[derive(Clone, Default)]
pub struct DenseBitmap {
    /// Empty until the first insert; afterwards `DENSE_TOP_SLOTS` long.
    top: Vec<Option<Block>>,
    blocks_in_use: usize,
}

fn new_block(fill: u32) -> Result<Block> {
    let mut v: Vec<u32> = Vec::new();
    v.try_reserve_exact(DENSE_BLOCK_WORDS)
        .map_err(|_| Error::Alloc("bitmap block"))?;
    v.resize(DENSE_BLOCK_WORDS, fill);
    Ok(v.into_boxed_slice())
}

/// Set or clear the bits for offsets `[lo, hi]` inside one /16 block.
fn fill_bits(block: &mut [u32], lo: u32, hi: u32, set: bool) {
    let (wlo, whi) = ((lo >> 5) as usize, (hi >> 5) as usize);
    let lo_mask = u32::MAX << (lo & 31);
    let hi_mask = u32::MAX >> (31 - (hi & 31));
    let apply = |w: &mut u32, m: u32| {
        if set {
            *w |= m
        } else {
            *w &= !m
        }
    };
    if wlo == whi {
        apply(&mut block[wlo], lo_mask & hi_mask);
        return;
    }
    apply(&mut block[wlo], lo_mask);
    for w in &mut block[wlo + 1..whi] {
        *w = if set { u32::MAX } else { 0 };
    }
    apply(&mut block[whi], hi_mask);
}

impl DenseBitmap {
    pub fn new() -> Self {
        DenseBitmap::default()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks_in_use == 0
    }

    /// Number of /16 blocks holding at least one address.
    pub fn blocks_in_use(&self) -> usize {
        self.blocks_in_use
    }

    pub fn clear(&mut self) {
        self.top = Vec::new();
        self.blocks_in_use = 0;
    }

    fn ensure_top(&mut self) -> Result<()> {
        if self.top.is_empty() {
            self.top
                .try_reserve_exact(DENSE_TOP_SLOTS)
                .map_err(|_| Error::Alloc("bitmap top level"))?;
            self.top.resize_with(DENSE_TOP_SLOTS, || None);
        }
        Ok(())
    }

    #[inline]
    fn block(&self, hi16: usize) -> Option<&[u32]> {
        self.top.get(hi16).and_then(|b| b.as_deref())
    }

    #[inline]
    pub fn contains(&self, ip: u32) -> bool {
        match self.block((ip >> 16) as usize) {
            Some(b) => (b[((ip >> 5) & 0x7FF) as usize] >> (ip & 0x1F)) & 1 == 1,
            None => false,
        }
    }

    /// Add every address in `[lo, hi]`.
    pub fn insert_range(&mut self, lo: u32, hi: u32) -> Result<()> {
        if lo > hi {
            return Err(Error::BadInput("range start is above range end"));
        }
        self.ensure_top()?;
        let mut cur = lo as u64;
        let end = hi as u64;
        while cur <= end {
            let hi16 = (cur >> 16) as usize;
            let block_end = ((hi16 as u64) << 16) | 0xFFFF;
            let stop = block_end.min(end);
            let (off_lo, off_hi) = ((cur & 0xFFFF) as u32, (stop & 0xFFFF) as u32);
            let full = off_lo == 0 && off_hi == 0xFFFF;
            match &mut self.top[hi16] {
                Some(b) if full => b.fill(u32::MAX),
                Some(b) => fill_bits(b, off_lo, off_hi, true),
                slot @ None => {
                    let mut b = new_block(if full { u32::MAX } else { 0 })?;
                    if !full {
                        fill_bits(&mut b, off_lo, off_hi, true);
                    }
                    *slot = Some(b);
                    self.blocks_in_use += 1;
                }
            }
            cur = stop + 1;
        }
        Ok(())
    }

    /// Drop every address in `[lo, hi]`, releasing blocks that empty out.
    pub fn remove_range(&mut self, lo: u32, hi: u32) -> Result<()> {
        if lo > hi {
            return Err(Error::BadInput("range start is above range end"));
        }
        if self.top.is_empty() {
            return Ok(());
        }
        let mut cur = lo as u64;
        let end = hi as u64;
        while cur <= end {
            let hi16 = (cur >> 16) as usize;
            let block_end = ((hi16 as u64) << 16) | 0xFFFF;
            let stop = block_end.min(end);
            let (off_lo, off_hi) = ((cur & 0xFFFF) as u32, (stop & 0xFFFF) as u32);
            let slot = &mut self.top[hi16];
            if let Some(b) = slot.as_mut() {
                let release = if off_lo == 0 && off_hi == 0xFFFF {
                    true
                } else {
                    fill_bits(b, off_lo, off_hi, false);
                    b.iter().all(|&w| w == 0)
                };
                if release {
                    *slot = None;
                    self.blocks_in_use -= 1;
                }
            }
            cur = stop + 1;
        }
        Ok(())
    }

    fn range_of(ip: u32, prefix: u32) -> (u32, u32) {
        let host = u32::MAX.checked_shr(prefix).unwrap_or(0);
        let base = ip & !host;
        (base, base | host)
    }

    pub fn insert(&mut self, ip: u32, prefix: u32) -> Result<()> {
        let (lo, hi) = Self::range_of(ip, prefix);
        self.insert_range(lo, hi)
    }

    pub fn remove(&mut self, ip: u32, prefix: u32) -> Result<()> {
        let (lo, hi) = Self::range_of(ip, prefix);
        self.remove_range(lo, hi)
    }

    /// Whether every address of `ip/prefix` is present.
    pub fn contains_block(&self, ip: u32, prefix: u32) -> bool {
        let (lo, hi) = Self::range_of(ip, prefix);
        self.next_clear(lo as u64) > hi as u64
    }

    /// Whether any address of `ip/prefix` is present.
    pub fn intersects_block(&self, ip: u32, prefix: u32) -> bool {
        let (lo, hi) = Self::range_of(ip, prefix);
        self.next_set(lo as u64).is_some_and(|a| a <= hi)
    }

    /// Lowest present address at or above `from`.
    pub fn next_set(&self, from: u64) -> Option<u32> {
        let mut cur = from;
        while cur <= u32::MAX as u64 {
            let hi16 = (cur >> 16) as usize;
            let Some(b) = self.block(hi16) else {
                cur = ((hi16 as u64) + 1) << 16;
                continue;
            };
            let mut w = ((cur >> 5) & 0x7FF) as usize;
            let mut word = b[w] & (u32::MAX << (cur & 31));
            loop {
                if word != 0 {
                    return Some(((hi16 as u32) << 16) | ((w as u32) << 5) | word.trailing_zeros());
                }
                w += 1;
                if w == DENSE_BLOCK_WORDS {
                    break;
                }
                word = b[w];
            }
            cur = ((hi16 as u64) + 1) << 16;
        }
        None
    }

    /// Lowest absent address at or above `from`; `2^32` if there is none.
    pub fn next_clear(&self, from: u64) -> u64 {
        let mut cur = from;
        while cur <= u32::MAX as u64 {
            let hi16 = (cur >> 16) as usize;
            let Some(b) = self.block(hi16) else {
                return cur;
            };
            let mut w = ((cur >> 5) & 0x7FF) as usize;
            let mut word = !b[w] & (u32::MAX << (cur & 31));
            loop {
                if word != 0 {
                    return (((hi16 as u64) << 16) | ((w as u64) << 5)) + word.trailing_zeros() as u64;
                }
                w += 1;
                if w == DENSE_BLOCK_WORDS {
                    break;
                }
                word = !b[w];
            }
            cur = ((hi16 as u64) + 1) << 16;
        }
        1u64 << 32
    }

    pub fn count(&self) -> u64 {
        self.top
            .iter()
            .flatten()
            .map(|b| b.iter().map(|w| w.count_ones() as u64).sum::<u64>())
            .sum()
    }

    /// Maximal CIDR blocks in ascending order.
    pub fn blocks(&self) -> DenseBlocks<'_> {
        DenseBlocks {
            bitmap: self,
            pos: 0,
            run: None,
        }
    }

    /// `self |= other`
    pub fn union_with(&mut self, other: &DenseBitmap) -> Result<()> {
        if other.is_empty() {
            return Ok(());
        }
        self.ensure_top()?;
        for (i, src) in other.top.iter().enumerate() {
            let Some(src) = src else { continue };
            match &mut self.top[i] {
                Some(dst) => dst.iter_mut().zip(src.iter()).for_each(|(d, s)| *d |= s),
                slot @ None => {
                    *slot = Some(src.clone());
                    self.blocks_in_use += 1;
                }
            }
        }
        Ok(())
    }

    /// `self &= other`
    pub fn intersect_with(&mut self, other: &DenseBitmap) {
        for (i, slot) in self.top.iter_mut().enumerate() {
            let Some(dst) = slot.as_mut() else { continue };
            let keep = match other.block(i) {
                Some(src) => {
                    dst.iter_mut().zip(src.iter()).for_each(|(d, s)| *d &= s);
                    dst.iter().any(|&w| w != 0)
                }
                None => false,
            };
            if !keep {
                *slot = None;
                self.blocks_in_use -= 1;
            }
        }
    }

    /// `self &= !other`
    pub fn subtract(&mut self, other: &DenseBitmap) {
        for (i, slot) in self.top.iter_mut().enumerate() {
            let Some(dst) = slot.as_mut() else { continue };
            let Some(src) = other.block(i) else { continue };
            dst.iter_mut().zip(src.iter()).for_each(|(d, s)| *d &= !s);
            if dst.iter().all(|&w| w == 0) {
                *slot = None;
                self.blocks_in_use -= 1;
            }
        }
    }

    /// Whether the two bitmaps share an address.
    pub fn intersects(&self, other: &DenseBitmap) -> bool {
        self.top.iter().enumerate().any(|(i, a)| match (a, other.block(i)) {
            (Some(a), Some(b)) => a.iter().zip(b.iter()).any(|(x, y)| x & y != 0),
            _ => false,
        })
    }

    pub fn debug_dump(&self, out: &mut String) -> std::fmt::Result {
        use std::fmt::Write;
        writeln!(out, "bitmap v4: {} /16 blocks in use", self.blocks_in_use)?;
        for (i, b) in self.top.iter().enumerate() {
            if let Some(b) = b {
                let n: u32 = b.iter().map(|w| w.count_ones()).sum();
                writeln!(out, "  {}.{}.0.0/16 {} addresses", i >> 8, i & 0xFF, n)?;
            }
        }
        trace!("[DUMP] bitmap dump written");
        Ok(())
    }
}

impl std::fmt::Debug for DenseBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenseBitmap")
            .field("blocks_in_use", &self.blocks_in_use)
            .finish()
    }
}

/// Iterator over the maximal CIDR blocks of a [`DenseBitmap`].
pub struct DenseBlocks<'a> {
    bitmap: &'a DenseBitmap,
    pos: u64,
    /// Remaining part of the current run of present addresses.
    run: Option<(u64, u64)>,
}

impl Iterator for DenseBlocks<'_> {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.run.is_none() {
            let start = self.bitmap.next_set(self.pos)? as u64;
            let end = self.bitmap.next_clear(start) - 1;
            self.pos = end + 1;
            self.run = Some((start, end));
        }
        let (lo, hi) = self.run?;
        let prefix = largest_block(lo as u128, hi as u128, 32);
        let last = lo + (1u64 << (32 - prefix)) - 1;
        self.run = if last >= hi { None } else { Some((last + 1, hi)) };
        Some((lo as u32, prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership() {
        let mut d = DenseBitmap::new();
        d.insert(0x0A00_0000, 24).unwrap();
        assert!(d.contains(0x0A00_0000));
        assert!(d.contains(0x0A00_00FF));
        assert!(!d.contains(0x0A00_0100));
        assert_eq!(d.count(), 256);
        assert_eq!(d.blocks_in_use(), 1);
    }

    #[test]
    fn blocks_are_maximal() {
        let mut d = DenseBitmap::new();
        d.insert_range(0x0A00_0001, 0x0A00_0010).unwrap();
        let got: Vec<_> = d.blocks().collect();
        assert_eq!(
            got,
            vec![
                (0x0A00_0001, 32),
                (0x0A00_0002, 31),
                (0x0A00_0004, 30),
                (0x0A00_0008, 29),
                (0x0A00_0010, 32)
            ]
        );
    }

    #[test]
    fn runs_cross_block_boundaries() {
        let mut d = DenseBitmap::new();
        d.insert(0x0A00_0000, 8).unwrap();
        assert_eq!(d.blocks_in_use(), 256);
        assert_eq!(d.blocks().collect::<Vec<_>>(), vec![(0x0A00_0000, 8)]);
        d.insert(0x0B00_0000, 8).unwrap();
        assert_eq!(d.blocks().collect::<Vec<_>>(), vec![(0x0A00_0000, 7)]);
        assert_eq!(d.count(), 1u64 << 25);
    }

    #[test]
    fn remove_releases_empty_blocks() {
        let mut d = DenseBitmap::new();
        d.insert(0xC0A8_0100, 24).unwrap();
        d.remove(0xC0A8_0180, 25).unwrap();
        assert_eq!(d.blocks().collect::<Vec<_>>(), vec![(0xC0A8_0100, 25)]);
        d.remove(0xC0A8_0000, 16).unwrap();
        assert!(d.is_empty());
    }

    #[test]
    fn word_ops() {
        let mut a = DenseBitmap::new();
        let mut b = DenseBitmap::new();
        a.insert(0x0A00_0000, 8).unwrap();
        b.insert(0x0A00_0000, 16).unwrap();
        b.insert(0x0B00_0000, 16).unwrap();
        assert!(a.intersects(&b));

        let mut i = a.clone();
        i.intersect_with(&b);
        assert_eq!(i.blocks().collect::<Vec<_>>(), vec![(0x0A00_0000, 16)]);

        let mut s = a.clone();
        s.subtract(&b);
        assert_eq!(s.count(), (1 << 24) - (1 << 16));

        a.union_with(&b).unwrap();
        assert_eq!(a.count(), (1 << 24) + (1 << 16));
    }

    #[test]
    fn block_queries() {
        let mut d = DenseBitmap::new();
        d.insert(0x0A00_0000, 24).unwrap();
        assert!(d.contains_block(0x0A00_0080, 25));
        assert!(!d.contains_block(0x0A00_0000, 23));
        assert!(d.intersects_block(0x0A00_0000, 8));
        assert!(!d.intersects_block(0x0B00_0000, 8));
        d.insert(0xFFFF_FF00, 24).unwrap();
        assert!(d.contains_block(0xFFFF_FFFF, 32));
    }
}
