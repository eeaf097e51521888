//! Presenting a set as addresses or CIDR blocks under an IPv6 policy.

use std::net::IpAddr;
use std::ops::ControlFlow;

use crate::constants::{V4_MAPPED_BITS, V4_MAPPED_PREFIX};
use crate::errors::{Error, Result};
use crate::helpers::{block_contains, block_last, is_v4_mapped, u128_to_ip, v4_plen, v4_to_v6};
use crate::ipset::IpSet;
use crate::types::V6Policy;

/// One stored block as the caller gets to see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Presented {
    Skip,
    One(u128, u32, bool),
    /// The whole IPv4 space, as its two halves.
    AllV4,
}

/// Apply `policy` to the block `ip/prefix` of a set whose IPv6 flag is
/// `set_v6`.
pub(crate) fn present(ip: u128, prefix: u32, set_v6: bool, policy: V6Policy) -> Presented {
    match (set_v6, policy) {
        (false, V6Policy::Only) => Presented::Skip,
        (false, V6Policy::Force) => Presented::One(v4_to_v6(ip as u32), v4_plen(prefix), true),
        (false, _) => Presented::One(ip, prefix, false),
        (true, V6Policy::Ignore) => Presented::Skip,
        (true, V6Policy::AsV4) => {
            if prefix > V4_MAPPED_BITS && is_v4_mapped(ip) {
                Presented::One(ip & 0xFFFF_FFFF, prefix - V4_MAPPED_BITS, false)
            } else if block_contains(ip, prefix, V4_MAPPED_PREFIX, V4_MAPPED_BITS, 128) {
                Presented::AllV4
            } else {
                Presented::Skip
            }
        }
        (true, _) => Presented::One(ip, prefix, true),
    }
}

fn emit<B, F>(ip: u128, prefix: u32, v6: bool, cidr: bool, f: &mut F) -> ControlFlow<B>
where
    F: FnMut(IpAddr, u32) -> ControlFlow<B>,
{
    if cidr {
        return f(u128_to_ip(ip, v6), prefix);
    }
    let bits = if v6 { 128 } else { 32 };
    let last = block_last(ip, prefix, bits);
    let mut cur = ip;
    loop {
        f(u128_to_ip(cur, v6), bits)?;
        if cur == last {
            return ControlFlow::Continue(());
        }
        cur += 1;
    }
}

/// Hand one stored block to `f`, as a block or address by address.
pub(crate) fn visit_block<B, F>(
    ip: u128,
    prefix: u32,
    set_v6: bool,
    cidr: bool,
    policy: V6Policy,
    f: &mut F,
) -> ControlFlow<B>
where
    F: FnMut(IpAddr, u32) -> ControlFlow<B>,
{
    match present(ip, prefix, set_v6, policy) {
        Presented::Skip => ControlFlow::Continue(()),
        Presented::One(ip, p, v6) => emit(ip, p, v6, cidr, f),
        Presented::AllV4 => {
            emit(0, 1, false, cidr, f)?;
            emit(0x8000_0000, 1, false, cidr, f)
        }
    }
}

impl IpSet {
    /// Call `f` for every block (`cidr`) or every address, ascending. Works
    /// on dirty sets. A `Break` from `f` stops the walk and is returned.
    pub fn walk<B, F>(&self, cidr: bool, policy: V6Policy, mut f: F) -> ControlFlow<B>
    where
        F: FnMut(IpAddr, u32) -> ControlFlow<B>,
    {
        let v6 = self.is_v6();
        for (ip, prefix) in self.native_blocks() {
            visit_block(ip, prefix, v6, cidr, policy, &mut f)?;
        }
        ControlFlow::Continue(())
    }

    /// Forward iterator over a clean set.
    pub fn iter(&self, cidr: bool, policy: V6Policy) -> Result<IpSetIter<'_>> {
        IpSetIter::bind(self, cidr, policy)
    }
}

/// Pull-style iteration over a clean set. Yields `(address, prefix)`;
/// without `cidr` every address comes out with the full prefix length.
pub struct IpSetIter<'a> {
    set: &'a IpSet,
    cidr: bool,
    policy: V6Policy,
    blocks: Box<dyn Iterator<Item = (u128, u32)> + 'a>,
    /// Second half of an [`Presented::AllV4`] block.
    pending: Option<(u128, u32, bool)>,
    /// Address expansion in progress: next, last, IPv6.
    expand: Option<(u128, u128, bool)>,
}

impl<'a> IpSetIter<'a> {
    /// Fails `RequireClean` on a dirty set.
    pub fn bind(set: &'a IpSet, cidr: bool, policy: V6Policy) -> Result<Self> {
        if set.is_dirty() {
            return Err(Error::RequireClean);
        }
        Ok(IpSetIter {
            set,
            cidr,
            policy,
            blocks: set.native_blocks(),
            pending: None,
            expand: None,
        })
    }

    /// Start again from the lowest address.
    pub fn reset(&mut self) {
        self.blocks = self.set.native_blocks();
        self.pending = None;
        self.expand = None;
    }
}

impl Iterator for IpSetIter<'_> {
    type Item = (IpAddr, u32);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((cur, last, v6)) = self.expand {
                self.expand = (cur != last).then_some((cur + 1, last, v6));
                return Some((u128_to_ip(cur, v6), if v6 { 128 } else { 32 }));
            }
            let (ip, prefix, v6) = match self.pending.take() {
                Some(b) => b,
                None => {
                    let (ip, prefix) = self.blocks.next()?;
                    match present(ip, prefix, self.set.is_v6(), self.policy) {
                        Presented::Skip => continue,
                        Presented::One(ip, p, v6) => (ip, p, v6),
                        Presented::AllV4 => {
                            self.pending = Some((0x8000_0000, 1, false));
                            (0, 1, false)
                        }
                    }
                }
            };
            if self.cidr {
                return Some((u128_to_ip(ip, v6), prefix));
            }
            let bits = if v6 { 128 } else { 32 };
            self.expand = Some((ip, block_last(ip, prefix, bits), v6));
        }
    }
}
