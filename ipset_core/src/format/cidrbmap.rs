//! CIDRBMAP payload (record version 4): ascending `(address, marker)`
//! records. A marker up to the family width is a CIDR prefix; the bitmap
//! marker is followed by a 256-bit map of the /24 (or /120) at `address`.
//! IPv4 addresses are host order, IPv6 addresses network order.

use std::io::{Read, Write};
use std::ops::ControlFlow;

use super::{bitmap_runs, each_cidr, visit, Chunked, Chunker, Input, Output};
use crate::constants::{CHUNK_BITS, MARKER_BITMAP};
use crate::errors::{Error, Result};
use crate::helpers::canonical;
use crate::ipset::IpSet;

fn record_size(v6: bool) -> usize {
    if v6 {
        17
    } else {
        5
    }
}

fn address<W: Write>(out: &mut Output<W>, ip: u128, v6: bool) -> Result<()> {
    if v6 {
        out.u128_be(ip)
    } else {
        out.u32(ip as u32)
    }
}

fn drain<W: Write>(out: &mut Output<W>, v6: bool, pending: &mut Vec<Chunked>) -> Result<()> {
    for item in pending.drain(..) {
        match item {
            Chunked::Block(ip, prefix) => {
                address(out, ip, v6)?;
                out.u8(prefix as u8)?;
            }
            Chunked::Bitmap(base, words) => {
                address(out, base, v6)?;
                out.u8(MARKER_BITMAP)?;
                out.words(&words)?;
            }
        }
    }
    Ok(())
}

pub(super) fn write<W: Write>(set: &IpSet, out: &mut Output<W>) -> Result<()> {
    let v6 = set.is_v6();
    let bits = if v6 { 128 } else { 32 };
    let mut chunker = Chunker::new(bits, record_size(v6));
    let mut pending = Vec::new();
    for (ip, prefix) in set.native_blocks() {
        chunker.push(ip, prefix, &mut pending);
        drain(out, v6, &mut pending)?;
    }
    chunker.flush(&mut pending);
    drain(out, v6, &mut pending)
}

pub(super) fn decode<R, B, F>(input: &mut Input<R>, v6: bool, f: &mut F) -> Result<ControlFlow<B>>
where
    R: Read,
    F: FnMut(u128, u32) -> ControlFlow<B>,
{
    let bits = if v6 { 128 } else { 32 };
    let mut raw = [0u8; 16];
    let width = if v6 { 16 } else { 4 };
    while input.fill_or_eof(&mut raw[..width])? {
        let ip = if v6 {
            u128::from_be_bytes(raw)
        } else {
            u128::from(input.u32_from([raw[0], raw[1], raw[2], raw[3]]))
        };
        match input.u8()? {
            MARKER_BITMAP => {
                let base = canonical(ip, bits - CHUNK_BITS, bits);
                if base != ip {
                    return Err(Error::Corrupt(format!("CIDRBMAP bitmap base {:#x} is not aligned", ip)));
                }
                let words = input.words()?;
                for (lo, hi) in bitmap_runs(&words) {
                    visit!(each_cidr(base + u128::from(lo), base + u128::from(hi), bits, f));
                }
            }
            p if p != 0 && u32::from(p) <= bits => {
                let prefix = u32::from(p);
                visit!(f(canonical(ip, prefix, bits), prefix));
            }
            p => return Err(Error::Corrupt(format!("CIDRBMAP marker {:#04x} is not valid", p))),
        }
    }
    Ok(ControlFlow::Continue(()))
}
