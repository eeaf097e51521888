//! SLASH64 payload (record version 5), IPv6 only. Records carry one 64-bit
//! half of an address in network order and a marker byte.
//!
//! An upper half with a prefix of at most 64 is a whole block. An upper
//! half with the /64 marker opens a group, and the lower-half records that
//! follow belong to that /64: either a block with a prefix above 64 or a
//! bitmap marker with a 256-bit map of a /120.

use std::io::{Read, Write};
use std::ops::ControlFlow;

use super::{bitmap_runs, each_cidr, visit, Chunked, Chunker, Input, Output};
use crate::constants::{MARKER_BITMAP, MARKER_SLASH64};
use crate::errors::{Error, Result};
use crate::helpers::canonical;
use crate::ipset::IpSet;

const RECORD_SIZE: usize = 9;

fn drain<W: Write>(out: &mut Output<W>, pending: &mut Vec<Chunked>) -> Result<()> {
    for item in pending.drain(..) {
        match item {
            Chunked::Block(ip, prefix) => {
                out.u64_be(ip as u64)?;
                out.u8(prefix as u8)?;
            }
            Chunked::Bitmap(base, words) => {
                out.u64_be(base as u64)?;
                out.u8(MARKER_BITMAP)?;
                out.words(&words)?;
            }
        }
    }
    Ok(())
}

pub(super) fn write<W: Write>(set: &IpSet, out: &mut Output<W>) -> Result<()> {
    let mut chunker = Chunker::new(128, RECORD_SIZE);
    let mut pending = Vec::new();
    let mut group: Option<u64> = None;
    for (ip, prefix) in set.native_blocks() {
        let upper = (ip >> 64) as u64;
        if prefix <= 64 {
            chunker.flush(&mut pending);
            drain(out, &mut pending)?;
            out.u64_be(upper)?;
            out.u8(prefix as u8)?;
            group = None;
            continue;
        }
        if group != Some(upper) {
            chunker.flush(&mut pending);
            drain(out, &mut pending)?;
            out.u64_be(upper)?;
            out.u8(MARKER_SLASH64)?;
            group = Some(upper);
        }
        chunker.push(ip, prefix, &mut pending);
        drain(out, &mut pending)?;
    }
    chunker.flush(&mut pending);
    drain(out, &mut pending)
}

fn open_group(group: Option<u64>) -> Result<u128> {
    group
        .map(|u| u128::from(u) << 64)
        .ok_or_else(|| Error::Corrupt("SLASH64 lower half outside a /64 group".into()))
}

pub(super) fn decode<R, B, F>(input: &mut Input<R>, f: &mut F) -> Result<ControlFlow<B>>
where
    R: Read,
    F: FnMut(u128, u32) -> ControlFlow<B>,
{
    let mut group: Option<u64> = None;
    let mut raw = [0u8; 8];
    while input.fill_or_eof(&mut raw)? {
        let half = u64::from_be_bytes(raw);
        match input.u8()? {
            MARKER_SLASH64 => group = Some(half),
            MARKER_BITMAP => {
                let base = open_group(group)? | u128::from(half);
                if base & 0xFF != 0 {
                    return Err(Error::Corrupt(format!("SLASH64 bitmap base {:#x} is not aligned", base)));
                }
                let words = input.words()?;
                for (lo, hi) in bitmap_runs(&words) {
                    visit!(each_cidr(base + u128::from(lo), base + u128::from(hi), 128, f));
                }
            }
            p @ 1..=64 => {
                group = None;
                let prefix = u32::from(p);
                visit!(f(canonical(u128::from(half) << 64, prefix, 128), prefix));
            }
            p @ 65..=128 => {
                let prefix = u32::from(p);
                let ip = open_group(group)? | u128::from(half);
                visit!(f(canonical(ip, prefix, 128), prefix));
            }
            p => return Err(Error::Corrupt(format!("SLASH64 marker {:#04x} is not valid", p))),
        }
    }
    Ok(ControlFlow::Continue(()))
}
