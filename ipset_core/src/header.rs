//! The file header in front of every IPset payload.
//!
//! A fixed 16-byte start is followed by a list of header entries, each
//! `(id u32, length u32, payload)` with the length counting the 8-byte
//! entry head itself. An entry with id 0 ends the list; its length also covers
//! any padding. All header integers are big endian regardless of the
//! payload byte order, which the flags byte records.

use std::io::{self, Read, Write};

use log::{debug, trace};

use crate::constants::{
    FILE_VERSION, FT_IPSET, HEADER_MAGIC, HEADER_START_LEN, HENTRY_ANNOTATION_ID, HENTRY_END_ID,
    HENTRY_INVOCATION_ID, HENTRY_IPSET_ID, HENTRY_IPSET_LEN, HENTRY_HEAD_LEN, WRITER_VERSION,
};
use crate::errors::{Error, Result};
use crate::types::{CompMethod, RecordVersion};

/// Structural description of the payload, stored as header entry 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpSetEntry {
    pub children_per_node: u32,
    pub leaf_count: u32,
    pub leaf_size: u32,
    pub node_count: u32,
    pub node_size: u32,
    /// Root index; the high bit marks a leaf.
    pub root_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderEntry {
    /// Command line that produced the file.
    Invocation(String),
    Annotation(String),
    IpSet(IpSetEntry),
    /// Anything else, kept byte for byte.
    Unknown { id: u32, data: Vec<u8> },
}

impl HeaderEntry {
    pub fn id(&self) -> u32 {
        match self {
            HeaderEntry::Invocation(_) => HENTRY_INVOCATION_ID,
            HeaderEntry::Annotation(_) => HENTRY_ANNOTATION_ID,
            HeaderEntry::IpSet(_) => HENTRY_IPSET_ID,
            HeaderEntry::Unknown { id, .. } => *id,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            HeaderEntry::Invocation(s) | HeaderEntry::Annotation(s) => {
                let mut v = s.as_bytes().to_vec();
                v.push(0);
                v
            }
            HeaderEntry::IpSet(e) => [
                e.children_per_node,
                e.leaf_count,
                e.leaf_size,
                e.node_count,
                e.node_size,
                e.root_index,
            ]
            .iter()
            .flat_map(|v| v.to_be_bytes())
            .collect(),
            HeaderEntry::Unknown { data, .. } => data.clone(),
        }
    }

    fn parse(id: u32, data: Vec<u8>) -> Result<Self> {
        let text = |d: &[u8]| {
            let end = d.iter().position(|&b| b == 0).unwrap_or(d.len());
            String::from_utf8_lossy(&d[..end]).into_owned()
        };
        Ok(match id {
            HENTRY_INVOCATION_ID => HeaderEntry::Invocation(text(&data)),
            HENTRY_ANNOTATION_ID => HeaderEntry::Annotation(text(&data)),
            HENTRY_IPSET_ID => {
                if data.len() != HENTRY_IPSET_LEN - HENTRY_HEAD_LEN {
                    return Err(Error::FileHeader(format!(
                        "IPset header entry is {} bytes, expected {}",
                        data.len() + HENTRY_HEAD_LEN,
                        HENTRY_IPSET_LEN
                    )));
                }
                let f = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
                HeaderEntry::IpSet(IpSetEntry {
                    children_per_node: f(0),
                    leaf_count: f(4),
                    leaf_size: f(8),
                    node_count: f(12),
                    node_size: f(16),
                    root_index: f(20),
                })
            }
            _ => HeaderEntry::Unknown { id, data },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Byte order of the payload.
    pub big_endian: bool,
    pub file_version: u8,
    pub comp_method: CompMethod,
    pub writer_version: u32,
    pub record_size: u16,
    pub record_version: RecordVersion,
    pub entries: Vec<HeaderEntry>,
    /// Bytes the header occupies on disk, padding included.
    pub length: usize,
}

fn truncated(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::FileHeader("file ends inside the header".into())
    } else {
        Error::FileIo(e)
    }
}

impl FileHeader {
    /// Header for a payload written by this host.
    pub fn new(record_version: RecordVersion, comp_method: CompMethod) -> Self {
        FileHeader {
            big_endian: cfg!(target_endian = "big"),
            file_version: FILE_VERSION,
            comp_method,
            writer_version: WRITER_VERSION,
            record_size: 1,
            record_version,
            entries: Vec::new(),
            length: 0,
        }
    }

    /// Whether the payload byte order matches this host.
    pub fn is_native_order(&self) -> bool {
        self.big_endian == cfg!(target_endian = "big")
    }

    pub fn ipset_entry(&self) -> Option<&IpSetEntry> {
        self.entries.iter().find_map(|e| match e {
            HeaderEntry::IpSet(s) => Some(s),
            _ => None,
        })
    }

    pub fn invocations(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| match e {
            HeaderEntry::Invocation(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn annotations(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| match e {
            HeaderEntry::Annotation(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let mut start = [0u8; HEADER_START_LEN];
        // anything that is not a SiLK file at all is a read error
        r.read_exact(&mut start)?;
        if start[..4] != HEADER_MAGIC {
            return Err(Error::FileIo(io::Error::new(
                io::ErrorKind::InvalidData,
                "input is not a SiLK file",
            )));
        }
        let big_endian = start[4] & 1 == 1;
        if start[5] != FT_IPSET {
            return Err(Error::FileType(start[5]));
        }
        let file_version = start[6];
        if file_version < FILE_VERSION {
            return Err(Error::FileVersion(format!(
                "legacy file version {} is not supported",
                file_version
            )));
        }
        let comp_method = CompMethod::from_u8(start[7])
            .ok_or_else(|| Error::FileHeader(format!("unknown compression method {}", start[7])))?;
        let writer_version = u32::from_be_bytes([start[8], start[9], start[10], start[11]]);
        let record_size = u16::from_be_bytes([start[12], start[13]]);
        let raw_version = u16::from_be_bytes([start[14], start[15]]);
        let record_version = match raw_version {
            0..=2 => RecordVersion::ClassC,
            3 => RecordVersion::Radix,
            4 => RecordVersion::CidrBmap,
            5 => RecordVersion::Slash64,
            v => {
                return Err(Error::FileVersion(format!("record version {} is not supported", v)));
            }
        };
        if record_size != 1 {
            return Err(Error::FileHeader(format!("record size {} is not 1", record_size)));
        }

        let mut entries = Vec::new();
        let mut length = HEADER_START_LEN;
        loop {
            let mut head = [0u8; HENTRY_HEAD_LEN];
            r.read_exact(&mut head).map_err(truncated)?;
            let id = u32::from_be_bytes([head[0], head[1], head[2], head[3]]);
            let len = u32::from_be_bytes([head[4], head[5], head[6], head[7]]) as usize;
            if len < HENTRY_HEAD_LEN {
                return Err(Error::FileHeader(format!("header entry {} has length {}", id, len)));
            }
            let want = (len - HENTRY_HEAD_LEN) as u64;
            let mut data = Vec::new();
            r.by_ref().take(want).read_to_end(&mut data)?;
            if data.len() as u64 != want {
                return Err(Error::FileHeader("file ends inside the header".into()));
            }
            length += len;
            if id == HENTRY_END_ID {
                break;
            }
            trace!("[HEADER] entry id={} len={}", id, len);
            entries.push(HeaderEntry::parse(id, data)?);
        }

        debug!(
            "[HEADER] version={} comp={:?} record={} entries={} length={}",
            file_version,
            comp_method,
            record_version,
            entries.len(),
            length
        );
        Ok(FileHeader {
            big_endian,
            file_version,
            comp_method,
            writer_version,
            record_size,
            record_version,
            entries,
            length,
        })
    }

    /// Serialise, padding the whole header to a multiple of `align`.
    pub fn to_bytes(&self, align: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&HEADER_MAGIC);
        out.push(u8::from(self.big_endian));
        out.push(FT_IPSET);
        out.push(self.file_version);
        out.push(self.comp_method as u8);
        out.extend_from_slice(&self.writer_version.to_be_bytes());
        out.extend_from_slice(&self.record_size.to_be_bytes());
        out.extend_from_slice(&self.record_version.as_u16().to_be_bytes());
        for e in &self.entries {
            let payload = e.payload();
            out.extend_from_slice(&e.id().to_be_bytes());
            out.extend_from_slice(&((payload.len() + HENTRY_HEAD_LEN) as u32).to_be_bytes());
            out.extend_from_slice(&payload);
        }
        let align = align.max(1);
        let pad = (align - (out.len() + HENTRY_HEAD_LEN) % align) % align;
        out.extend_from_slice(&HENTRY_END_ID.to_be_bytes());
        out.extend_from_slice(&((HENTRY_HEAD_LEN + pad) as u32).to_be_bytes());
        out.resize(out.len() + pad, 0);
        out
    }

    /// Write the header; returns the bytes written.
    pub fn write<W: Write>(&self, w: &mut W, align: usize) -> Result<usize> {
        let bytes = self.to_bytes(align);
        w.write_all(&bytes)?;
        Ok(bytes.len())
    }
}
