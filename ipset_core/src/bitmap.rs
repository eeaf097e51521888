//! Per-node child bitmaps.

use bytemuck::{Pod, Zeroable};

use crate::constants::NUM_CHILDREN;

/// One bit per child slot of a radix node.
#[repr(transparent)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct ChildBitmap(u32);

#[inline]
fn range_bits(first: usize, last: usize) -> u32 {
    debug_assert!(first <= last && last < NUM_CHILDREN);
    let width = last - first + 1;
    let ones = if width >= 32 { u32::MAX } else { (1u32 << width) - 1 };
    ones << first
}

impl ChildBitmap {
    #[inline]
    pub fn get(self, i: usize) -> bool {
        (self.0 >> i) & 1 == 1
    }

    #[inline]
    pub fn set(&mut self, i: usize) {
        self.0 |= 1 << i;
    }

    #[inline]
    pub fn clear(&mut self, i: usize) {
        self.0 &= !(1 << i);
    }

    /// Set the inclusive slot range `[first, last]`.
    #[inline]
    pub fn set_range(&mut self, first: usize, last: usize) {
        self.0 |= range_bits(first, last);
    }

    /// Clear the inclusive slot range `[first, last]`.
    #[inline]
    pub fn clear_range(&mut self, first: usize, last: usize) {
        self.0 &= !range_bits(first, last);
    }

    #[inline]
    pub fn clear_all(&mut self) {
        self.0 = 0;
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn from_raw(v: u32) -> Self {
        ChildBitmap(v)
    }

    #[inline]
    pub fn swap_bytes(&mut self) {
        self.0 = self.0.swap_bytes();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_bits() {
        let mut b = ChildBitmap::default();
        b.set(0);
        b.set(15);
        assert!(b.get(0) && b.get(15) && !b.get(7));
        b.clear(0);
        assert!(!b.get(0));
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn ranges() {
        let mut b = ChildBitmap::default();
        b.set_range(4, 7);
        assert_eq!(b.raw(), 0x00F0);
        b.set_range(0, 15);
        assert_eq!(b.raw(), 0xFFFF);
        b.clear_range(1, 14);
        assert_eq!(b.raw(), 0x8001);
        b.clear_all();
        assert!(b.is_empty());
    }
}
