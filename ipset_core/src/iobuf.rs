//! Block-compressed payload streams.
//!
//! A compressed payload is a run of blocks, each
//! `(compressed_len u32 BE, uncompressed_len u32 BE, zlib bytes)`, with at
//! most 64 KiB of uncompressed data per block. The stream ends at a block
//! boundary.

use std::io::{self, Read, Write};

use libflate::zlib;
use log::trace;

use crate::constants::{IOBUF_BLOCK_SIZE, IOBUF_MAX_COMPRESSED};
use crate::types::CompMethod;

/// Compresses everything written to it into framed zlib blocks. Call
/// [`BlockWriter::finish`] to emit the final partial block.
pub struct BlockWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(inner: W) -> Self {
        BlockWriter {
            inner,
            buf: Vec::with_capacity(IOBUF_BLOCK_SIZE),
        }
    }

    fn flush_block(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let mut enc = zlib::Encoder::new(Vec::new())?;
        enc.write_all(&self.buf)?;
        let data = enc.finish().into_result()?;
        trace!("[IOBUF] block {} -> {} bytes", self.buf.len(), data.len());
        self.inner.write_all(&(data.len() as u32).to_be_bytes())?;
        self.inner.write_all(&(self.buf.len() as u32).to_be_bytes())?;
        self.inner.write_all(&data)?;
        self.buf.clear();
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<W> {
        self.flush_block()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for BlockWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = IOBUF_BLOCK_SIZE - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() == IOBUF_BLOCK_SIZE {
            self.flush_block()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_block()?;
        self.inner.flush()
    }
}

/// Reads back what a [`BlockWriter`] produced.
pub struct BlockReader<R: Read> {
    inner: R,
    block: Vec<u8>,
    pos: usize,
    done: bool,
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Fill `buf` completely, or return `false` on end of stream before the
/// first byte.
pub(crate) fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut got = 0;
    while got < buf.len() {
        match r.read(&mut buf[got..]) {
            Ok(0) if got == 0 => return Ok(false),
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

impl<R: Read> BlockReader<R> {
    pub fn new(inner: R) -> Self {
        BlockReader {
            inner,
            block: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    fn next_block(&mut self) -> io::Result<bool> {
        let mut sizes = [0u8; 8];
        if !read_exact_or_eof(&mut self.inner, &mut sizes)? {
            return Ok(false);
        }
        let compr = u32::from_be_bytes([sizes[0], sizes[1], sizes[2], sizes[3]]) as usize;
        let uncompr = u32::from_be_bytes([sizes[4], sizes[5], sizes[6], sizes[7]]) as usize;
        if compr > IOBUF_MAX_COMPRESSED || uncompr > IOBUF_MAX_COMPRESSED {
            return Err(invalid("compressed block size out of range"));
        }
        let mut data = vec![0u8; compr];
        self.inner.read_exact(&mut data)?;
        self.block.clear();
        zlib::Decoder::new(&data[..])?.read_to_end(&mut self.block)?;
        if self.block.len() != uncompr {
            return Err(invalid("compressed block does not match its stated size"));
        }
        self.pos = 0;
        Ok(true)
    }
}

impl<R: Read> Read for BlockReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.block.len() {
            if self.done || !self.next_block()? {
                self.done = true;
                return Ok(0);
            }
        }
        let n = out.len().min(self.block.len() - self.pos);
        out[..n].copy_from_slice(&self.block[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Payload source after the header, decompressing when the header says so.
pub(crate) enum PayloadReader<R: Read> {
    Plain(R),
    Zlib(BlockReader<R>),
}

impl<R: Read> PayloadReader<R> {
    pub(crate) fn new(inner: R, comp: CompMethod) -> Self {
        match comp {
            CompMethod::None => PayloadReader::Plain(inner),
            CompMethod::Zlib => PayloadReader::Zlib(BlockReader::new(inner)),
        }
    }
}

impl<R: Read> Read for PayloadReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match self {
            PayloadReader::Plain(r) => r.read(out),
            PayloadReader::Zlib(r) => r.read(out),
        }
    }
}

/// Payload sink after the header.
pub(crate) enum PayloadWriter<W: Write> {
    Plain(W),
    Zlib(BlockWriter<W>),
}

impl<W: Write> PayloadWriter<W> {
    pub(crate) fn new(inner: W, comp: CompMethod) -> Self {
        match comp {
            CompMethod::None => PayloadWriter::Plain(inner),
            CompMethod::Zlib => PayloadWriter::Zlib(BlockWriter::new(inner)),
        }
    }

    pub(crate) fn finish(self) -> io::Result<W> {
        match self {
            PayloadWriter::Plain(mut w) => {
                w.flush()?;
                Ok(w)
            }
            PayloadWriter::Zlib(w) => w.finish(),
        }
    }
}

impl<W: Write> Write for PayloadWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            PayloadWriter::Plain(w) => w.write(data),
            PayloadWriter::Zlib(w) => w.write(data),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            PayloadWriter::Plain(w) => w.flush(),
            PayloadWriter::Zlib(w) => w.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_several_blocks() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut w = BlockWriter::new(Vec::new());
        w.write_all(&data).unwrap();
        let framed = w.finish().unwrap();
        let first = u32::from_be_bytes([framed[4], framed[5], framed[6], framed[7]]);
        assert_eq!(first as usize, IOBUF_BLOCK_SIZE);

        let mut back = Vec::new();
        BlockReader::new(&framed[..]).read_to_end(&mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn empty_stream() {
        let framed = BlockWriter::new(Vec::new()).finish().unwrap();
        assert!(framed.is_empty());
        let mut back = Vec::new();
        BlockReader::new(&framed[..]).read_to_end(&mut back).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn truncated_block_is_an_error() {
        let mut w = BlockWriter::new(Vec::new());
        w.write_all(b"some payload bytes").unwrap();
        let framed = w.finish().unwrap();
        let mut back = Vec::new();
        let err = BlockReader::new(&framed[..framed.len() - 2])
            .read_to_end(&mut back)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
