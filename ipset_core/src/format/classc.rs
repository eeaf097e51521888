//! CLASSC payload (record version 2): one record per IPv4 /24 in use,
//! the /24 base followed by a 256-bit bitmap, ascending.

use std::io::{Read, Write};
use std::ops::ControlFlow;

use super::{bitmap_runs, each_cidr, set_bits, visit, Input, Output};
use crate::algebra::blocks_for;
use crate::constants::CHUNK_BITMAP_WORDS;
use crate::errors::{Error, Result};
use crate::helpers::block_last;
use crate::ipset::IpSet;

type Record = (u32, [u32; CHUNK_BITMAP_WORDS]);

fn emit<W: Write>(out: &mut Output<W>, (base, words): &Record) -> Result<()> {
    out.u32(*base)?;
    out.words(words)
}

pub(super) fn write<W: Write>(set: &IpSet, out: &mut Output<W>) -> Result<()> {
    let mut cur: Option<Record> = None;
    for (ip, prefix) in blocks_for(false, set) {
        let hi = block_last(ip, prefix, 32) as u32;
        let mut a = ip as u32;
        loop {
            let base = a & 0xFFFF_FF00;
            let end = hi.min(base | 0xFF);
            if !matches!(cur, Some((b, _)) if b == base) {
                if let Some(rec) = cur.take() {
                    emit(out, &rec)?;
                }
                cur = Some((base, [0; CHUNK_BITMAP_WORDS]));
            }
            if let Some((_, words)) = cur.as_mut() {
                set_bits(words, a & 0xFF, end & 0xFF);
            }
            if end == hi {
                break;
            }
            a = end + 1;
        }
    }
    if let Some(rec) = cur {
        emit(out, &rec)?;
    }
    Ok(())
}

/// Runs that continue into the next record are joined, so blocks wider
/// than a /24 come out whole.
pub(super) fn decode<R, B, F>(input: &mut Input<R>, f: &mut F) -> Result<ControlFlow<B>>
where
    R: Read,
    F: FnMut(u128, u32) -> ControlFlow<B>,
{
    let mut open: Option<(u32, u32)> = None;
    let mut raw = [0u8; 4];
    while input.fill_or_eof(&mut raw)? {
        let base = input.u32_from(raw);
        if base & 0xFF != 0 {
            return Err(Error::Corrupt(format!("CLASSC base {:#010x} is not a /24", base)));
        }
        let words = input.words()?;
        for (lo, hi) in bitmap_runs(&words) {
            let (lo, hi) = (base + lo, base + hi);
            match open {
                Some((start, end)) if end.checked_add(1) == Some(lo) => open = Some((start, hi)),
                _ => {
                    if let Some((start, end)) = open.replace((lo, hi)) {
                        visit!(each_cidr(u128::from(start), u128::from(end), 32, f));
                    }
                }
            }
        }
    }
    if let Some((start, end)) = open {
        visit!(each_cidr(u128::from(start), u128::from(end), 32, f));
    }
    Ok(ControlFlow::Continue(()))
}
