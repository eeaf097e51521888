//! Reading and writing IPset files.
//!
//! Four payload layouts exist, picked by the header's record version:
//! CLASSC (2), RADIX (3), CIDRBMAP (4) and SLASH64 (5). Every layout but
//! RADIX is a stream of CIDR blocks and chunk bitmaps, so each codec
//! exposes `decode`, which hands blocks to a callback; building a set and
//! streaming a file share that path.

mod cidrbmap;
mod classc;
mod radix;
mod slash64;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use log::{debug, error};
use metrics::counter;

use crate::config::Config;
use crate::constants::{CHUNK_BITMAP_WORDS, CHUNK_BITS};
use crate::errors::{Error, Result};
use crate::header::{FileHeader, HeaderEntry, IpSetEntry};
use crate::helpers::{block_last, canonical, largest_block};
use crate::iobuf::{read_exact_or_eof, PayloadReader, PayloadWriter};
use crate::ipset::IpSet;
use crate::types::RecordVersion;

/// Return a `Break` from a decoder.
macro_rules! visit {
    ($flow:expr) => {
        if let ::std::ops::ControlFlow::Break(b) = $flow {
            return Ok(::std::ops::ControlFlow::Break(b));
        }
    };
}
pub(crate) use visit;

// ---- payload primitives ----------------------------------------------------------

/// Payload bytes in the byte order the header announced.
pub(crate) struct Input<R: Read> {
    r: R,
    big_endian: bool,
}

impl<R: Read> Input<R> {
    pub(crate) fn new(r: R, big_endian: bool) -> Self {
        Input { r, big_endian }
    }

    pub(crate) fn is_native(&self) -> bool {
        self.big_endian == cfg!(target_endian = "big")
    }

    pub(crate) fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.r.read_exact(buf).map_err(Error::short_read)
    }

    /// Like [`Input::fill`], but `false` at a clean end of payload.
    pub(crate) fn fill_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        read_exact_or_eof(&mut self.r, buf).map_err(Error::short_read)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.fill(&mut b)?;
        Ok(b[0])
    }

    pub(crate) fn u32_from(&self, b: [u8; 4]) -> u32 {
        if self.big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        }
    }

    /// One 256-bit chunk bitmap.
    pub(crate) fn words(&mut self) -> Result<[u32; CHUNK_BITMAP_WORDS]> {
        let mut raw = [0u8; CHUNK_BITMAP_WORDS * 4];
        self.fill(&mut raw)?;
        let mut out = [0u32; CHUNK_BITMAP_WORDS];
        for (w, c) in out.iter_mut().zip(raw.chunks_exact(4)) {
            *w = self.u32_from([c[0], c[1], c[2], c[3]]);
        }
        Ok(out)
    }

    /// Up to `n` bytes into `buf`; fewer means the payload ended.
    pub(crate) fn take_to_end(&mut self, n: u64, buf: &mut Vec<u8>) -> Result<usize> {
        Ok((&mut self.r).take(n).read_to_end(buf)?)
    }

    pub(crate) fn skip(&mut self, n: u64) -> Result<()> {
        let skipped = std::io::copy(&mut (&mut self.r).take(n), &mut std::io::sink())?;
        if skipped != n {
            return Err(Error::Corrupt("unexpected end of IPset payload".into()));
        }
        Ok(())
    }
}

/// Payload sink; integers go out in host order, IPv6 addresses in
/// network order.
pub(crate) struct Output<W: Write> {
    w: PayloadWriter<W>,
}

impl<W: Write> Output<W> {
    pub(crate) fn new(w: PayloadWriter<W>) -> Self {
        Output { w }
    }

    pub(crate) fn bytes(&mut self, b: &[u8]) -> Result<()> {
        Ok(self.w.write_all(b)?)
    }

    pub(crate) fn u8(&mut self, v: u8) -> Result<()> {
        self.bytes(&[v])
    }

    pub(crate) fn u32(&mut self, v: u32) -> Result<()> {
        self.bytes(&v.to_ne_bytes())
    }

    pub(crate) fn u64_be(&mut self, v: u64) -> Result<()> {
        self.bytes(&v.to_be_bytes())
    }

    pub(crate) fn u128_be(&mut self, v: u128) -> Result<()> {
        self.bytes(&v.to_be_bytes())
    }

    pub(crate) fn words(&mut self, words: &[u32; CHUNK_BITMAP_WORDS]) -> Result<()> {
        for w in words {
            self.u32(*w)?;
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<()> {
        self.w.finish()?;
        Ok(())
    }
}

// ---- chunk bitmaps ----------------------------------------------------------------

/// Set the bits for offsets `[lo, hi]` of a chunk bitmap. Offset `o` is bit
/// `o & 31` of word `o >> 5`.
pub(crate) fn set_bits(words: &mut [u32; CHUNK_BITMAP_WORDS], lo: u32, hi: u32) {
    for o in lo..=hi {
        words[(o >> 5) as usize] |= 1 << (o & 31);
    }
}

/// Maximal runs of set bits, as inclusive offset pairs.
pub(crate) fn bitmap_runs(words: &[u32; CHUNK_BITMAP_WORDS]) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    let mut start = None;
    for o in 0..(1u32 << CHUNK_BITS) {
        let set = (words[(o >> 5) as usize] >> (o & 31)) & 1 == 1;
        match (set, start) {
            (true, None) => start = Some(o),
            (false, Some(s)) => {
                out.push((s, o - 1));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        out.push((s, (1 << CHUNK_BITS) - 1));
    }
    out
}

/// Hand `[lo, hi]` to `f` as the fewest CIDR blocks.
pub(crate) fn each_cidr<B, F>(lo: u128, hi: u128, bits: u32, f: &mut F) -> ControlFlow<B>
where
    F: FnMut(u128, u32) -> ControlFlow<B>,
{
    let mut cur = lo;
    loop {
        let p = largest_block(cur, hi, bits);
        f(cur, p)?;
        let last = block_last(cur, p, bits);
        if last >= hi {
            return ControlFlow::Continue(());
        }
        cur = last + 1;
    }
}

/// What a [`Chunker`] decided to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Chunked {
    Block(u128, u32),
    Bitmap(u128, [u32; CHUNK_BITMAP_WORDS]),
}

/// Collects the small blocks of one /24 (or /120) and emits them either
/// one by one or as a single bitmap, whichever is smaller on disk.
pub(crate) struct Chunker {
    bits: u32,
    rec_size: usize,
    base: u128,
    blocks: Vec<(u128, u32)>,
}

impl Chunker {
    pub(crate) fn new(bits: u32, rec_size: usize) -> Self {
        Chunker {
            bits,
            rec_size,
            base: 0,
            blocks: Vec::new(),
        }
    }

    /// Feed the next ascending block.
    pub(crate) fn push(&mut self, ip: u128, prefix: u32, out: &mut Vec<Chunked>) {
        let chunk_prefix = self.bits - CHUNK_BITS;
        if prefix <= chunk_prefix {
            self.flush(out);
            out.push(Chunked::Block(ip, prefix));
            return;
        }
        let base = canonical(ip, chunk_prefix, self.bits);
        if !self.blocks.is_empty() && base != self.base {
            self.flush(out);
        }
        self.base = base;
        self.blocks.push((ip, prefix));
    }

    pub(crate) fn flush(&mut self, out: &mut Vec<Chunked>) {
        if self.blocks.is_empty() {
            return;
        }
        let n = self.blocks.len();
        if n * self.rec_size > self.rec_size + CHUNK_BITMAP_WORDS * 4 {
            let mut words = [0u32; CHUNK_BITMAP_WORDS];
            for &(ip, p) in &self.blocks {
                let lo = (ip - self.base) as u32;
                let hi = (block_last(ip, p, self.bits) - self.base) as u32;
                set_bits(&mut words, lo, hi);
            }
            out.push(Chunked::Bitmap(self.base, words));
        } else {
            out.extend(self.blocks.iter().map(|&(ip, p)| Chunked::Block(ip, p)));
        }
        self.blocks.clear();
    }
}

// ---- dispatch ---------------------------------------------------------------------

pub(crate) fn report_read_error(name: &str, e: &Error) {
    if Config::global().print_read_error {
        error!("[READ] {}: {}", name, e);
    } else {
        debug!("[READ] {}: {}", name, e);
    }
}

fn ipset_entry(header: &FileHeader) -> Result<&IpSetEntry> {
    header.ipset_entry().ok_or_else(|| {
        Error::FileHeader(format!(
            "{} file has no IPset header entry",
            header.record_version
        ))
    })
}

/// Whether the payload holds IPv6 addresses.
pub(crate) fn file_is_v6(header: &FileHeader) -> Result<bool> {
    match header.record_version {
        RecordVersion::ClassC => Ok(false),
        RecordVersion::Radix => match ipset_entry(header)?.leaf_size {
            8 => Ok(false),
            24 => Ok(true),
            n => Err(Error::FileHeader(format!("RADIX leaf size {} is not supported", n))),
        },
        RecordVersion::CidrBmap | RecordVersion::Slash64 => {
            match (header.record_version, ipset_entry(header)?.leaf_size) {
                (RecordVersion::CidrBmap, 4) => Ok(false),
                (_, 16) => Ok(true),
                (_, n) => Err(Error::FileHeader(format!(
                    "{} address size {} is not supported",
                    header.record_version, n
                ))),
            }
        }
        RecordVersion::Default => Err(Error::FileVersion("record version 0 has no layout".into())),
    }
}

/// Feed every block of a non-mapped payload to `f`, in file order.
pub(crate) fn decode_blocks<R, B, F>(
    input: &mut Input<R>,
    header: &FileHeader,
    v6: bool,
    f: &mut F,
) -> Result<ControlFlow<B>>
where
    R: Read,
    F: FnMut(u128, u32) -> ControlFlow<B>,
{
    match header.record_version {
        RecordVersion::ClassC => classc::decode(input, f),
        RecordVersion::Radix => radix::decode(input, ipset_entry(header)?, v6, f),
        RecordVersion::CidrBmap => cidrbmap::decode(input, v6, f),
        RecordVersion::Slash64 => slash64::decode(input, f),
        RecordVersion::Default => Err(Error::FileVersion("record version 0 has no layout".into())),
    }
}

fn keep_provenance(set: &mut IpSet, header: &FileHeader) {
    set.provenance = header
        .entries
        .iter()
        .filter(|e| matches!(e, HeaderEntry::Invocation(_) | HeaderEntry::Annotation(_)))
        .cloned()
        .collect();
}

fn read_payload<R: Read>(r: R, header: &FileHeader) -> Result<IpSet> {
    let v6 = file_is_v6(header)?;
    let mut input = Input::new(PayloadReader::new(r, header.comp_method), header.big_endian);
    let mut set = if header.record_version == RecordVersion::Radix {
        radix::read(&mut input, ipset_entry(header)?, v6)?
    } else {
        let mut set = IpSet::create(v6);
        let flow = decode_blocks(&mut input, header, v6, &mut |ip, p| match set.insert_native(ip, p) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => ControlFlow::Break(e),
        })?;
        if let ControlFlow::Break(e) = flow {
            return Err(e);
        }
        set.clean()?;
        set
    };
    keep_provenance(&mut set, header);
    Ok(set)
}

fn open_error(path: &Path) -> impl FnOnce(std::io::Error) -> Error {
    let path = path.to_path_buf();
    move |source| Error::Open { path, source }
}

fn load_file(path: &Path) -> Result<IpSet> {
    let file = File::open(path).map_err(open_error(path))?;
    let mut reader = BufReader::new(&file);
    let header = FileHeader::read(&mut reader)?;
    if let Some(mut set) = radix::try_map(&file, &header)? {
        keep_provenance(&mut set, &header);
        return Ok(set);
    }
    read_payload(reader, &header)
}

impl IpSet {
    /// Read a set from an IPset stream.
    pub fn read<R: Read>(r: &mut R) -> Result<IpSet> {
        Self::read_with_header(r).map(|(set, _)| set)
    }

    /// Read a set and return the header it came with.
    pub fn read_with_header<R: Read>(r: &mut R) -> Result<(IpSet, FileHeader)> {
        crate::ensure_logging();
        counter!("ipset_reads_total").increment(1);
        let res = FileHeader::read(r).and_then(|header| {
            let set = read_payload(&mut *r, &header)?;
            Ok((set, header))
        });
        if let Err(e) = &res {
            report_read_error("stream", e);
        }
        res
    }

    /// Read a set from a file. Uncompressed RADIX files in host byte
    /// order are mapped instead of read; the set copies its records out
    /// on the first change.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<IpSet> {
        let path = path.as_ref();
        crate::ensure_logging();
        counter!("ipset_reads_total").increment(1);
        let res = load_file(path);
        if let Err(e) = &res {
            report_read_error(&path.display().to_string(), e);
        }
        res
    }

    /// Record version [`IpSet::write`] will use.
    pub fn record_version_for_write(&self) -> RecordVersion {
        let mut v = self.options.record_version;
        if v == RecordVersion::Default {
            v = Config::global().record_version;
        }
        match (v, self.is_v6()) {
            (RecordVersion::Default, false) => RecordVersion::ClassC,
            (RecordVersion::Default, true) => RecordVersion::Radix,
            (RecordVersion::ClassC, true) if self.contains_v6() => RecordVersion::Radix,
            (RecordVersion::Slash64, false) => RecordVersion::CidrBmap,
            (v, _) => v,
        }
    }

    fn header_entries(&self) -> Vec<HeaderEntry> {
        let opts = &self.options;
        let mut out: Vec<HeaderEntry> = self
            .provenance
            .iter()
            .filter(|e| match e {
                HeaderEntry::Invocation(_) => !opts.invocation_strip,
                HeaderEntry::Annotation(_) => !opts.note_strip,
                _ => false,
            })
            .cloned()
            .collect();
        if let Some(argv) = &opts.invocation {
            out.push(HeaderEntry::Invocation(argv.join(" ")));
        }
        out.extend(opts.notes.iter().cloned().map(HeaderEntry::Annotation));
        out
    }

    /// Write the set with its bound options. Requires a clean set.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        if self.dirty {
            return Err(Error::RequireClean);
        }
        let version = self.record_version_for_write();
        let mut header = FileHeader::new(version, self.options.comp_method);
        header.entries = self.header_entries();
        debug!("[WRITE] record version {} compression {:?}", version, header.comp_method);

        if version == RecordVersion::Radix {
            radix::write(self, header, w)?;
        } else {
            let v6 = match version {
                RecordVersion::ClassC => false,
                RecordVersion::CidrBmap => self.is_v6(),
                _ => true,
            };
            if version != RecordVersion::ClassC {
                header.entries.push(HeaderEntry::IpSet(IpSetEntry {
                    leaf_size: if v6 { 16 } else { 4 },
                    ..IpSetEntry::default()
                }));
            }
            header.write(w, 1)?;
            let mut out = Output::new(PayloadWriter::new(&mut *w, header.comp_method));
            match version {
                RecordVersion::ClassC => classc::write(self, &mut out)?,
                RecordVersion::CidrBmap => cidrbmap::write(self, &mut out)?,
                _ => slash64::write(self, &mut out)?,
            }
            out.finish()?;
        }
        counter!("ipset_writes_total").increment(1);
        Ok(())
    }

    /// Write the set to `path`. The data goes to a sibling temporary file
    /// that then replaces `path`, so a set mapped from `path` stays valid.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut tmp = PathBuf::from(path);
        let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        tmp.set_file_name(name);

        let file = File::create(&tmp).map_err(open_error(&tmp))?;
        let mut w = BufWriter::new(file);
        let res = self
            .write(&mut w)
            .and_then(|()| w.into_inner().map_err(|e| Error::from(e.into_error())))
            .and_then(|file| {
                drop(file);
                std::fs::rename(&tmp, path).map_err(open_error(path))
            });
        if res.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_are_maximal() {
        let mut w = [0u32; CHUNK_BITMAP_WORDS];
        set_bits(&mut w, 0, 7);
        set_bits(&mut w, 30, 33);
        set_bits(&mut w, 255, 255);
        assert_eq!(bitmap_runs(&w), vec![(0, 7), (30, 33), (255, 255)]);
    }

    #[test]
    fn cidr_split() {
        let mut got = Vec::new();
        let _ = each_cidr::<(), _>(8, 20, 32, &mut |ip, p| {
            got.push((ip, p));
            ControlFlow::Continue(())
        });
        assert_eq!(got, vec![(8, 29), (16, 30), (20, 32)]);
    }

    #[test]
    fn chunker_picks_smaller_encoding() {
        // 5-byte IPv4 records: eight blocks cost more than one bitmap
        let mut c = Chunker::new(32, 5);
        let mut out = Vec::new();
        for i in 0..8u128 {
            c.push(0x0A00_0000 + i * 4, 32, &mut out);
        }
        c.push(0x0B00_0000, 16, &mut out);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], Chunked::Bitmap(0x0A00_0000, _)));
        assert_eq!(out[1], Chunked::Block(0x0B00_0000, 16));

        let mut c = Chunker::new(32, 5);
        out.clear();
        c.push(0x0A00_0001, 32, &mut out);
        c.push(0x0A00_0101, 32, &mut out);
        c.flush(&mut out);
        assert_eq!(out, vec![Chunked::Block(0x0A00_0001, 32), Chunked::Block(0x0A00_0101, 32)]);
    }
}
