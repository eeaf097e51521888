//! Public value types shared by the set, its iterators and its codecs.

use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// How IPv6 addresses are presented when walking or iterating a set.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum V6Policy {
    /// Only IPv4 content; an IPv6 set yields nothing.
    Ignore,
    /// IPv4 only; IPv6 content inside `::ffff:0:0/96` is decoded as IPv4.
    AsV4,
    /// Each set yields its native family.
    #[default]
    Mix,
    /// Always IPv6; IPv4 content is mapped into `::ffff:0:0/96`.
    Force,
    /// IPv6 only; an IPv4 set yields nothing.
    Only,
}

impl V6Policy {
    /// Numeric form used across the C ABI, in declaration order.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(V6Policy::Ignore),
            1 => Some(V6Policy::AsV4),
            2 => Some(V6Policy::Mix),
            3 => Some(V6Policy::Force),
            4 => Some(V6Policy::Only),
            _ => None,
        }
    }
}

impl FromStr for V6Policy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ignore" => Ok(V6Policy::Ignore),
            "asv4" => Ok(V6Policy::AsV4),
            "mix" => Ok(V6Policy::Mix),
            "force" => Ok(V6Policy::Force),
            "only" => Ok(V6Policy::Only),
            _ => Err(Error::BadInput("unknown IPv6 policy")),
        }
    }
}

/// Payload layout of an IPset file, stored as the header's record version.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum RecordVersion {
    /// Resolve at write time: CLASSC for IPv4 content, RADIX for IPv6.
    #[default]
    Default = 0,
    /// IPv4 /24 bitmaps.
    ClassC = 2,
    /// Raw arena image of the radix tree.
    Radix = 3,
    /// CIDR blocks mixed with /24 (or /120) bitmaps.
    CidrBmap = 4,
    /// IPv6 CIDR blocks grouped by /64.
    Slash64 = 5,
}

impl RecordVersion {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(RecordVersion::Default),
            2 => Some(RecordVersion::ClassC),
            3 => Some(RecordVersion::Radix),
            4 => Some(RecordVersion::CidrBmap),
            5 => Some(RecordVersion::Slash64),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for RecordVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordVersion::Default => "DEFAULT",
            RecordVersion::ClassC => "CLASSC",
            RecordVersion::Radix => "RADIX",
            RecordVersion::CidrBmap => "CIDRBMAP",
            RecordVersion::Slash64 => "SLASH64",
        };
        write!(f, "{} ({})", name, self.as_u16())
    }
}

/// Compression applied to the payload following the file header.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum CompMethod {
    #[default]
    None = 0,
    Zlib = 1,
}

impl CompMethod {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(CompMethod::None),
            1 => Some(CompMethod::Zlib),
            _ => None,
        }
    }
}

/// In-memory representation used for IPv4 content.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum InCoreFormat {
    /// Two-level /16 bitmap.
    #[default]
    IpTree,
    /// 16-way radix tree.
    Radix,
}

impl FromStr for InCoreFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "iptree" => Ok(InCoreFormat::IpTree),
            "radix" => Ok(InCoreFormat::Radix),
            _ => Err(Error::BadInput("unknown in-core IPset format")),
        }
    }
}

/// Options used when an IPset is written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpSetOptions {
    pub record_version: RecordVersion,
    pub comp_method: CompMethod,
    /// Drop invocation entries carried over from the source header.
    pub invocation_strip: bool,
    /// Drop annotation entries carried over from the source header.
    pub note_strip: bool,
    /// Command line to record as an invocation entry.
    pub invocation: Option<Vec<String>>,
    /// Annotations to record.
    pub notes: Vec<String>,
}

impl IpSetOptions {
    pub fn with_record_version(mut self, v: RecordVersion) -> Self {
        self.record_version = v;
        self
    }

    pub fn with_compression(mut self, c: CompMethod) -> Self {
        self.comp_method = c;
        self
    }
}

/// Settings for [`crate::procstream`] and [`crate::IpSet::walk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessParams {
    /// Present CIDR blocks instead of individual addresses.
    pub visit_cidr: bool,
    pub v6_policy: V6Policy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_versions_round_trip_numbers() {
        for v in [0u16, 2, 3, 4, 5] {
            assert_eq!(RecordVersion::from_u16(v).map(|r| r.as_u16()), Some(v));
        }
        assert_eq!(RecordVersion::from_u16(1), None);
        assert_eq!(RecordVersion::from_u16(6), None);
    }

    #[test]
    fn parses_policy_and_format() {
        assert_eq!("ASV4".parse::<V6Policy>().unwrap(), V6Policy::AsV4);
        assert!("v7".parse::<V6Policy>().is_err());
        assert_eq!("radix".parse::<InCoreFormat>().unwrap(), InCoreFormat::Radix);
    }
}
