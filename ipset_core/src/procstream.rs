//! Streaming over an IPset file without building a set.
//!
//! The payload is decoded block by block and handed to a callback, so
//! memory use does not depend on the size of the file. RADIX payloads
//! are visited in storage order; the other layouts come out ascending.

use std::io::Read;
use std::net::IpAddr;
use std::ops::ControlFlow;

use log::debug;

use crate::errors::Result;
use crate::format::{decode_blocks, file_is_v6, report_read_error, Input};
use crate::header::FileHeader;
use crate::helpers::block_count;
use crate::iobuf::PayloadReader;
use crate::iter::visit_block;
use crate::types::ProcessParams;

/// Header, family and payload of a stream.
fn open<R: Read>(r: &mut R) -> Result<(FileHeader, bool, Input<PayloadReader<&mut R>>)> {
    crate::ensure_logging();
    let header = FileHeader::read(r)?;
    let v6 = file_is_v6(&header)?;
    debug!("[STREAM] record version {} v6={}", header.record_version, v6);
    let input = Input::new(PayloadReader::new(r, header.comp_method), header.big_endian);
    Ok((header, v6, input))
}

fn reported<T>(res: Result<T>) -> Result<T> {
    if let Err(e) = &res {
        report_read_error("stream", e);
    }
    res
}

/// Call `f` for every block (`params.visit_cidr`) or address in the
/// stream, presented under `params.v6_policy`.
pub fn process_stream<R, B, F>(r: &mut R, params: ProcessParams, f: F) -> Result<ControlFlow<B>>
where
    R: Read,
    F: FnMut(IpAddr, u32) -> ControlFlow<B>,
{
    process_stream_with_init(r, params, |_, _, _| ControlFlow::Continue(()), f)
}

/// Like [`process_stream`], with `init` run once after the header is read.
/// `init` sees the header and whether the file holds IPv6, may adjust the
/// parameters, and may stop the walk before any address is visited.
pub fn process_stream_with_init<R, B, I, F>(
    r: &mut R,
    mut params: ProcessParams,
    init: I,
    mut f: F,
) -> Result<ControlFlow<B>>
where
    R: Read,
    I: FnOnce(&FileHeader, bool, &mut ProcessParams) -> ControlFlow<B>,
    F: FnMut(IpAddr, u32) -> ControlFlow<B>,
{
    reported((|| -> Result<ControlFlow<B>> {
        let (header, v6, mut input) = open(r)?;
        if let ControlFlow::Break(b) = init(&header, v6, &mut params) {
            return Ok(ControlFlow::Break(b));
        }
        let ProcessParams { visit_cidr, v6_policy } = params;
        decode_blocks(&mut input, &header, v6, &mut |ip, prefix| {
            visit_block(ip, prefix, v6, visit_cidr, v6_policy, &mut f)
        })
    })())
}

/// Number of addresses in the stream, saturating at `u128::MAX`.
pub fn process_stream_count_ips<R: Read>(r: &mut R) -> Result<u128> {
    reported((|| -> Result<u128> {
        let (header, v6, mut input) = open(r)?;
        let bits = if v6 { 128 } else { 32 };
        let mut total = 0u128;
        let _ = decode_blocks::<_, (), _>(&mut input, &header, v6, &mut |_, prefix| {
            total = total.saturating_add(block_count(prefix, bits));
            ControlFlow::Continue(())
        })?;
        Ok(total)
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipset::IpSet;
    use crate::types::{IpSetOptions, RecordVersion, V6Policy};

    fn file(version: RecordVersion) -> Vec<u8> {
        let mut s = IpSet::create(false);
        s.insert_addr("10.0.0.0".parse().unwrap(), 24).unwrap();
        s.insert_addr("10.0.5.7".parse().unwrap(), 32).unwrap();
        s.clean().unwrap();
        s.bind_options(IpSetOptions {
            record_version: version,
            ..IpSetOptions::default()
        });
        let mut buf = Vec::new();
        s.write(&mut buf).unwrap();
        buf
    }

    #[test]
    fn blocks_in_every_layout() {
        for v in [RecordVersion::ClassC, RecordVersion::Radix, RecordVersion::CidrBmap] {
            let buf = file(v);
            let mut got = Vec::new();
            let params = ProcessParams {
                visit_cidr: true,
                v6_policy: V6Policy::Mix,
            };
            let flow = process_stream::<_, (), _>(&mut &buf[..], params, |ip, p| {
                got.push(format!("{}/{}", ip, p));
                ControlFlow::Continue(())
            })
            .unwrap();
            assert_eq!(flow, ControlFlow::Continue(()));
            assert_eq!(got, vec!["10.0.0.0/24", "10.0.5.7/32"], "{}", v);
        }
    }

    #[test]
    fn init_can_force_v6_and_stop() {
        let buf = file(RecordVersion::CidrBmap);
        let mut first = None;
        let params = ProcessParams {
            visit_cidr: false,
            v6_policy: V6Policy::Mix,
        };
        let flow = process_stream_with_init(
            &mut &buf[..],
            params,
            |h, v6, p| {
                assert_eq!(h.record_version, RecordVersion::CidrBmap);
                assert!(!v6);
                p.v6_policy = V6Policy::Force;
                ControlFlow::Continue(())
            },
            |ip, p| {
                first = Some((ip, p));
                ControlFlow::Break("stop")
            },
        )
        .unwrap();
        assert_eq!(flow, ControlFlow::Break("stop"));
        assert_eq!(first, Some(("::ffff:10.0.0.0".parse::<IpAddr>().unwrap(), 128)));
    }

    #[test]
    fn init_break_skips_payload() {
        let buf = file(RecordVersion::Radix);
        let mut calls = 0;
        let flow = process_stream_with_init(
            &mut &buf[..],
            ProcessParams::default(),
            |_, _, _| ControlFlow::Break(1),
            |_, _| {
                calls += 1;
                ControlFlow::Continue(())
            },
        )
        .unwrap();
        assert_eq!(flow, ControlFlow::Break(1));
        assert_eq!(calls, 0);
    }

    #[test]
    fn counts_addresses() {
        let buf = file(RecordVersion::ClassC);
        assert_eq!(process_stream_count_ips(&mut &buf[..]).unwrap(), 257);
    }
}
