//! The IPset value: one address set over one of three representations.
//!
//! IPv4 content lives either in a [`DenseBitmap`] or in a [`RadixV4`];
//! IPv6 content always lives in a [`RadixV6`]. Callers hand in `IpAddr`
//! values of either family and the set maps them onto its own: IPv4
//! addresses go into `::ffff:0:0/96` of an IPv6 set, and v4-mapped IPv6
//! addresses are stored as IPv4 in an IPv4 set. Any other IPv6 address
//! promotes an IPv4 set to IPv6 unless auto-conversion is switched off.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::ControlFlow;

use log::{debug, info, trace};
use metrics::{counter, gauge};

use crate::config::Config;
use crate::constants::{V4_MAPPED_BITS, V4_MAPPED_PREFIX};
use crate::dense::DenseBitmap;
use crate::errors::{Error, Result};
use crate::format::each_cidr;
use crate::header::HeaderEntry;
use crate::helpers::{
    block_contains, block_count, canonical, ip_to_u128, is_v4_mapped, v4_plen, v4_to_v6,
};
use crate::radix::{RadixV4, RadixV6};
use crate::types::{InCoreFormat, IpSetOptions};

/// Storage behind an [`IpSet`].
#[derive(Clone)]
pub(crate) enum Repr {
    Bitmap(Box<DenseBitmap>),
    V4(RadixV4),
    V6(RadixV6),
}

/// Where a caller's block lands relative to the set's own family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// Right-aligned block in the set's family.
    Native(u128, u32),
    /// Exactly `::ffff:0:0/96`, i.e. the whole of an IPv4 set's space.
    AllV4,
    /// An IPv6 block strictly larger than `::ffff:0:0/96` that contains it.
    Wider,
    /// IPv6 content an IPv4 set cannot hold.
    Foreign,
}

#[derive(Clone)]
pub struct IpSet {
    pub(crate) repr: Repr,
    /// A radix tree was changed since the last [`IpSet::clean`].
    pub(crate) dirty: bool,
    no_autoconvert: bool,
    pub(crate) options: IpSetOptions,
    /// Invocation and annotation entries of the file the set was read from.
    pub(crate) provenance: Vec<HeaderEntry>,
}

/// The two prefix-1 blocks that together form "everything".
pub(crate) fn halves(is_v6: bool) -> [(IpAddr, u32); 2] {
    if is_v6 {
        [
            (IpAddr::V6(Ipv6Addr::UNSPECIFIED), 1),
            (IpAddr::V6(Ipv6Addr::from(1u128 << 127)), 1),
        ]
    } else {
        [
            (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 1),
            (IpAddr::V4(Ipv4Addr::from(0x8000_0000u32)), 1),
        ]
    }
}

impl IpSet {
    /// Empty set. IPv4 sets use the in-core format chosen by
    /// `SKIPSET_INCORE_FORMAT` (the dense bitmap unless told otherwise).
    pub fn create(ipv6: bool) -> IpSet {
        Self::create_with_format(ipv6, Config::global().incore_format)
    }

    /// Empty set with an explicit IPv4 representation. IPv6 sets are
    /// always radix trees.
    pub fn create_with_format(ipv6: bool, format: InCoreFormat) -> IpSet {
        crate::ensure_logging();
        crate::telemetry::init();
        let repr = match (ipv6, format) {
            (true, _) => Repr::V6(RadixV6::new()),
            (false, InCoreFormat::Radix) => Repr::V4(RadixV4::new()),
            (false, InCoreFormat::IpTree) => Repr::Bitmap(Box::default()),
        };
        debug!("[CREATE] ipv6={} format={:?}", ipv6, format);
        Self::from_repr(repr, false)
    }

    pub(crate) fn from_repr(repr: Repr, dirty: bool) -> IpSet {
        IpSet {
            repr,
            dirty,
            no_autoconvert: false,
            options: IpSetOptions::default(),
            provenance: Vec::new(),
        }
    }

    // ---- properties ----------------------------------------------------------

    /// Whether the set stores IPv6 addresses.
    pub fn is_v6(&self) -> bool {
        matches!(self.repr, Repr::V6(_))
    }

    /// Whether the set holds any address outside `::ffff:0:0/96`.
    pub fn contains_v6(&self) -> bool {
        match &self.repr {
            Repr::V6(t) => t.has_non_mapped(),
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.repr {
            Repr::Bitmap(b) => b.is_empty(),
            Repr::V4(t) => t.is_empty(),
            Repr::V6(t) => t.is_empty(),
        }
    }

    /// Whether the set needs [`IpSet::clean`] before it can be written or
    /// iterated with an [`crate::IpSetIter`].
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the set is still reading its records from a mapped file.
    pub fn is_mapped(&self) -> bool {
        match &self.repr {
            Repr::Bitmap(_) => false,
            Repr::V4(t) => t.is_mapped(),
            Repr::V6(t) => t.is_mapped(),
        }
    }

    pub fn incore_format(&self) -> InCoreFormat {
        match self.repr {
            Repr::Bitmap(_) => InCoreFormat::IpTree,
            _ => InCoreFormat::Radix,
        }
    }

    /// Allow or refuse promotion to IPv6 when IPv6 content arrives.
    pub fn set_auto_convert(&mut self, enabled: bool) {
        self.no_autoconvert = !enabled;
    }

    pub fn auto_convert_is_enabled(&self) -> bool {
        !self.no_autoconvert
    }

    /// Writer options used by [`IpSet::write`].
    pub fn bind_options(&mut self, options: IpSetOptions) {
        self.options = options;
    }

    pub fn options(&self) -> &IpSetOptions {
        &self.options
    }

    #[inline]
    pub(crate) fn max_bits(&self) -> u32 {
        if self.is_v6() {
            128
        } else {
            32
        }
    }

    // ---- internal plumbing ------------------------------------------------------

    /// Blocks in the set's own family, ascending. Works on dirty sets.
    pub(crate) fn native_blocks(&self) -> Box<dyn Iterator<Item = (u128, u32)> + '_> {
        match &self.repr {
            Repr::Bitmap(b) => Box::new(b.blocks().map(|(ip, p)| (ip as u128, p))),
            Repr::V4(t) if self.dirty => Box::new(t.blocks()),
            Repr::V4(t) => Box::new(t.blocks_linear()),
            Repr::V6(t) if self.dirty => Box::new(t.blocks()),
            Repr::V6(t) => Box::new(t.blocks_linear()),
        }
    }

    /// Take a private copy of mapped arenas before the first write.
    pub(crate) fn ensure_owned(&mut self) -> Result<()> {
        let copied = match &mut self.repr {
            Repr::Bitmap(_) => false,
            Repr::V4(t) => t.make_owned()?,
            Repr::V6(t) => t.make_owned()?,
        };
        if copied {
            counter!("ipset_cow_copies_total").increment(1);
            info!("[COW] IPset copied out of its file mapping");
        }
        Ok(())
    }

    pub(crate) fn insert_native(&mut self, ip: u128, prefix: u32) -> Result<()> {
        match &mut self.repr {
            Repr::Bitmap(b) => b.insert(ip as u32, prefix),
            Repr::V4(t) => {
                self.dirty = true;
                t.insert(ip, prefix)
            }
            Repr::V6(t) => {
                self.dirty = true;
                t.insert(ip, prefix)
            }
        }
    }

    pub(crate) fn remove_native(&mut self, ip: u128, prefix: u32) -> Result<()> {
        match &mut self.repr {
            Repr::Bitmap(b) => b.remove(ip as u32, prefix),
            Repr::V4(t) => {
                self.dirty = true;
                t.remove(ip, prefix)
            }
            Repr::V6(t) => {
                self.dirty = true;
                t.remove(ip, prefix)
            }
        }
    }

    fn contains_native(&self, ip: u128, prefix: u32) -> bool {
        match &self.repr {
            Repr::Bitmap(b) => b.contains_block(ip as u32, prefix),
            Repr::V4(t) => t.contains_block(ip, prefix),
            Repr::V6(t) => t.contains_block(ip, prefix),
        }
    }

    fn intersects_native(&self, ip: u128, prefix: u32) -> bool {
        match &self.repr {
            Repr::Bitmap(b) => b.intersects_block(ip as u32, prefix),
            Repr::V4(t) => t.intersects_block(ip, prefix),
            Repr::V6(t) => t.intersects_block(ip, prefix),
        }
    }

    /// Map a caller's block onto the set's family.
    fn target(&self, ip: IpAddr, prefix: u32) -> Result<Target> {
        let (raw, addr_v6) = ip_to_u128(ip);
        let bits = if addr_v6 { 128 } else { 32 };
        if prefix == 0 {
            return Err(Error::BadInput("prefix 0 must be split into two halves"));
        }
        if prefix > bits {
            return Err(Error::Prefix { prefix, bits });
        }
        let raw = canonical(raw, prefix, bits);
        Ok(match (self.is_v6(), addr_v6) {
            (false, false) | (true, true) => Target::Native(raw, prefix),
            (true, false) => Target::Native(v4_to_v6(raw as u32), v4_plen(prefix)),
            (false, true) if prefix > V4_MAPPED_BITS && is_v4_mapped(raw) => {
                Target::Native(raw & 0xFFFF_FFFF, prefix - V4_MAPPED_BITS)
            }
            (false, true) if prefix == V4_MAPPED_BITS && raw == V4_MAPPED_PREFIX => Target::AllV4,
            (false, true) if block_contains(raw, prefix, V4_MAPPED_PREFIX, V4_MAPPED_BITS, 128) => {
                Target::Wider
            }
            (false, true) => Target::Foreign,
        })
    }

    /// Switch an IPv4 set to IPv6 so it can take IPv6 content.
    pub(crate) fn promote(&mut self) -> Result<()> {
        if self.no_autoconvert {
            return Err(Error::Ipv6);
        }
        debug!("[CONVERT] promoting IPv4 set to IPv6");
        self.convert(6)
    }

    // ---- population ------------------------------------------------------------

    /// Add the block `ip/prefix`. Host bits below the prefix are ignored.
    pub fn insert_addr(&mut self, ip: IpAddr, prefix: u32) -> Result<()> {
        counter!("ipset_inserts_total").increment(1);
        trace!("[INSERT] {}/{}", ip, prefix);
        let mut target = self.target(ip, prefix)?;
        if matches!(target, Target::Wider | Target::Foreign) {
            self.promote()?;
            target = self.target(ip, prefix)?;
        }
        self.ensure_owned()?;
        match target {
            Target::Native(raw, p) => self.insert_native(raw, p),
            Target::AllV4 => {
                self.insert_native(0, 1)?;
                self.insert_native(0x8000_0000, 1)
            }
            // promotion makes every block native
            Target::Wider | Target::Foreign => Err(Error::Ipv6),
        }
    }

    /// Add every address in `[lo, hi]`. Fails `BadInput` when `lo > hi`.
    pub fn insert_range(&mut self, lo: IpAddr, hi: IpAddr) -> Result<()> {
        counter!("ipset_inserts_total").increment(1);
        let (mut l, lv6) = ip_to_u128(lo);
        let (mut h, hv6) = ip_to_u128(hi);
        let mut v6 = lv6 || hv6;
        if v6 && !lv6 {
            l = v4_to_v6(l as u32);
        }
        if v6 && !hv6 {
            h = v4_to_v6(h as u32);
        }
        if l > h {
            return Err(Error::BadInput("range start is above range end"));
        }
        if v6 && !self.is_v6() {
            if is_v4_mapped(l) && is_v4_mapped(h) {
                l &= 0xFFFF_FFFF;
                h &= 0xFFFF_FFFF;
                v6 = false;
            } else {
                self.promote()?;
            }
        }
        if !v6 && self.is_v6() {
            l = v4_to_v6(l as u32);
            h = v4_to_v6(h as u32);
        }
        trace!("[INSERT] range {:x}-{:x}", l, h);
        self.ensure_owned()?;
        self.insert_native_range(l, h)
    }

    /// Add `[lo, hi]`, both already in the set's family, as CIDR blocks.
    pub(crate) fn insert_native_range(&mut self, lo: u128, hi: u128) -> Result<()> {
        if let Repr::Bitmap(b) = &mut self.repr {
            return b.insert_range(lo as u32, hi as u32);
        }
        let bits = self.max_bits();
        let flow = each_cidr(lo, hi, bits, &mut |ip, p| match self.insert_native(ip, p) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => ControlFlow::Break(e),
        });
        match flow {
            ControlFlow::Break(e) => Err(e),
            ControlFlow::Continue(()) => Ok(()),
        }
    }

    /// Add every `(ip, prefix)` pair; prefix 0 stands for the whole space
    /// of the pair's family.
    pub fn insert_wildcard<I>(&mut self, blocks: I) -> Result<()>
    where
        I: IntoIterator<Item = (IpAddr, u32)>,
    {
        for (ip, prefix) in blocks {
            if prefix == 0 {
                for (half, p) in halves(ip.is_ipv6()) {
                    self.insert_addr(half, p)?;
                }
            } else {
                self.insert_addr(ip, prefix)?;
            }
        }
        Ok(())
    }

    /// Remove the block `ip/prefix`, splitting any larger block around it.
    pub fn remove_addr(&mut self, ip: IpAddr, prefix: u32) -> Result<()> {
        counter!("ipset_removes_total").increment(1);
        trace!("[REMOVE] {}/{}", ip, prefix);
        match self.target(ip, prefix)? {
            Target::Native(raw, p) => {
                self.ensure_owned()?;
                self.remove_native(raw, p)
            }
            Target::AllV4 | Target::Wider => {
                self.remove_all();
                Ok(())
            }
            Target::Foreign => Ok(()),
        }
    }

    /// Remove every `(ip, prefix)` pair; prefix 0 empties the set of that
    /// family's content.
    pub fn remove_wildcard<I>(&mut self, blocks: I) -> Result<()>
    where
        I: IntoIterator<Item = (IpAddr, u32)>,
    {
        for (ip, prefix) in blocks {
            if prefix == 0 {
                for (half, p) in halves(ip.is_ipv6()) {
                    self.remove_addr(half, p)?;
                }
            } else {
                self.remove_addr(ip, prefix)?;
            }
        }
        Ok(())
    }

    /// Empty the set, keeping its family and representation. A file
    /// mapping is released.
    pub fn remove_all(&mut self) {
        match &mut self.repr {
            Repr::Bitmap(b) => b.clear(),
            Repr::V4(t) => t.reset(),
            Repr::V6(t) => t.reset(),
        }
        self.dirty = false;
    }

    // ---- queries ---------------------------------------------------------------

    pub fn contains_addr(&self, ip: IpAddr) -> bool {
        let prefix = if ip.is_ipv6() { 128 } else { 32 };
        self.contains_block(ip, prefix)
    }

    /// Whether every address of `ip/prefix` is in the set. Exact on clean
    /// sets; on a dirty set a block split over several leaves reads as
    /// absent.
    pub fn contains_block(&self, ip: IpAddr, prefix: u32) -> bool {
        match self.target(ip, prefix) {
            Ok(Target::Native(raw, p)) => self.contains_native(raw, p),
            Ok(Target::AllV4) => {
                self.contains_native(0, 1) && self.contains_native(0x8000_0000, 1)
            }
            _ => false,
        }
    }

    /// Whether any address of `ip/prefix` is in the set.
    pub fn intersects_block(&self, ip: IpAddr, prefix: u32) -> bool {
        match self.target(ip, prefix) {
            Ok(Target::Native(raw, p)) => self.intersects_native(raw, p),
            Ok(Target::AllV4 | Target::Wider) => !self.is_empty(),
            _ => false,
        }
    }

    /// Number of addresses; the whole IPv6 space saturates at `u128::MAX`.
    pub fn count_addresses(&self) -> u128 {
        let (n, overflow) = self.count_exact();
        if overflow {
            u128::MAX
        } else {
            n
        }
    }

    /// Number of addresses as base-10 text, exact even for 2^128.
    pub fn count_addresses_string(&self) -> String {
        match self.count_exact() {
            (_, true) => "340282366920938463463374607431768211456".to_string(),
            (n, false) => n.to_string(),
        }
    }

    fn count_exact(&self) -> (u128, bool) {
        match &self.repr {
            Repr::Bitmap(b) => (b.count() as u128, false),
            Repr::V4(t) => t.count_addresses(),
            Repr::V6(t) => t.count_addresses(),
        }
    }

    // ---- shape -----------------------------------------------------------------

    /// Restore the canonical layout: no holes, ascending leaves, no two
    /// blocks that could merge. Fails `Corrupt` without change when the
    /// structure is inconsistent.
    pub fn clean(&mut self) -> Result<()> {
        self.ensure_owned()?;
        let leaves = match &mut self.repr {
            Repr::Bitmap(_) => None,
            Repr::V4(t) => {
                t.clean()?;
                Some(t.leaf_count())
            }
            Repr::V6(t) => {
                t.clean()?;
                Some(t.leaf_count())
            }
        };
        self.dirty = false;
        counter!("ipset_cleans_total").increment(1);
        if let Some(n) = leaves {
            gauge!("ipset_last_leaf_count").set(n.saturating_sub(1) as f64);
        }
        Ok(())
    }

    /// Replace each `/prefix` block that meets the set by its first
    /// address.
    pub fn mask(&mut self, prefix: u32) -> Result<()> {
        self.remask(prefix, false)
    }

    /// Replace each `/prefix` block that meets the set by the whole block.
    pub fn mask_and_fill(&mut self, prefix: u32) -> Result<()> {
        self.remask(prefix, true)
    }

    fn remask(&mut self, prefix: u32, fill: bool) -> Result<()> {
        let bits = self.max_bits();
        if prefix == 0 || prefix > bits {
            return Err(Error::Prefix { prefix, bits });
        }
        if prefix == bits {
            return Ok(());
        }
        if !fill {
            // one leaf per /prefix slice of every wider block
            let leaves = self
                .native_blocks()
                .filter(|&(_, bp)| bp < prefix)
                .map(|(_, bp)| block_count(bp, prefix))
                .fold(0u128, u128::saturating_add);
            if leaves > u128::from(u32::MAX) {
                return Err(Error::Alloc("masked IPset"));
            }
        }

        let mut out = self.empty_like();
        for (ip, bp) in self.native_blocks() {
            if bp >= prefix {
                let base = canonical(ip, prefix, bits);
                out.insert_native(base, if fill { prefix } else { bits })?;
            } else if fill {
                out.insert_native(ip, bp)?;
            } else {
                let step = 1u128 << (bits - prefix);
                for k in 0..(1u128 << (prefix - bp)) {
                    out.insert_native(ip + k * step, bits)?;
                }
            }
        }
        out.clean()?;
        debug!("[MASK] /{} fill={} -> {} addresses", prefix, fill, out.count_addresses());
        self.adopt(out);
        Ok(())
    }

    /// Empty set of the same family and representation.
    pub(crate) fn empty_like(&self) -> IpSet {
        let repr = match &self.repr {
            Repr::Bitmap(_) => Repr::Bitmap(Box::default()),
            Repr::V4(_) => Repr::V4(RadixV4::new()),
            Repr::V6(_) => Repr::V6(RadixV6::new()),
        };
        IpSet::from_repr(repr, false)
    }

    /// Take over the content of `other`, keeping options and flags. The old
    /// content (and any file mapping) goes away with `other`.
    pub(crate) fn adopt(&mut self, mut other: IpSet) {
        std::mem::swap(&mut self.repr, &mut other.repr);
        self.dirty = other.dirty;
    }
}
