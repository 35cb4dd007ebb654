//! Stream framing of BGZF blocks and one-shot helpers
//!
//! [`read_block_into`] pulls exactly one raw (still compressed) block from any
//! [`Read`] source, tolerating short reads. [`compress`] and [`decompress`] are
//! single-threaded conveniences over whole in-memory buffers.

use std::io::{self, Read};

use crate::codec::Decompressor;
use crate::error::Result;
use crate::header::{is_eof_marker, BlockHeader, EOF_MARKER, SIZE_GZIP_PREFIX};
use crate::planner::FlushPlanner;

/// Reads the next raw block from `reader` into `buffer`, replacing its contents
///
/// Returns `Ok(false)` when the source is exhausted exactly at a block boundary.
///
/// # Errors
///
/// * `FormatError` - If the header is malformed
/// * `IoError` (`UnexpectedEof`) - If the source ends inside a block
pub fn read_block_into<R: Read>(reader: &mut R, buffer: &mut Vec<u8>) -> Result<bool> {
    buffer.clear();
    buffer.resize(SIZE_GZIP_PREFIX, 0);

    let n = read_fully(reader, buffer)?;
    if n == 0 {
        buffer.clear();
        return Ok(false);
    }
    if n < SIZE_GZIP_PREFIX {
        return Err(truncated(n).into());
    }

    let mut prefix = [0u8; SIZE_GZIP_PREFIX];
    prefix.copy_from_slice(&buffer[..SIZE_GZIP_PREFIX]);
    let xlen = BlockHeader::parse_prefix(&prefix)?;

    buffer.resize(SIZE_GZIP_PREFIX + xlen as usize, 0);
    reader.read_exact(&mut buffer[SIZE_GZIP_PREFIX..])?;
    let bsize = BlockHeader::find_bsize(&buffer[SIZE_GZIP_PREFIX..])?;

    let header = BlockHeader { xlen, bsize };
    header.validate()?;

    let read = buffer.len();
    buffer.resize(header.block_size(), 0);
    reader.read_exact(&mut buffer[read..])?;
    Ok(true)
}

/// Fills `buffer` until it is full or the source reports end of stream
fn read_fully<R: Read>(reader: &mut R, buffer: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn truncated(n: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("BGZF stream ends {n} bytes into a block header"),
    )
}

/// Compresses `data` into a complete BGZF stream on the calling thread
///
/// Blocks are cut at the deflate bound and the stream is terminated with the
/// end-of-stream marker.
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>> {
    let mut planner = FlushPlanner::new(level);
    let mut out = Vec::with_capacity(data.len() / 2 + EOF_MARKER.len());
    let mut sizes = Vec::new();

    let mut rest = data;
    while !rest.is_empty() {
        let unflushed = planner.flush(rest, false, &mut out, &mut sizes)?;
        rest = &rest[rest.len() - unflushed..];
    }
    out.extend_from_slice(&EOF_MARKER);
    Ok(out)
}

/// Decompresses a complete BGZF stream on the calling thread
///
/// Decoding stops at the end-of-stream marker; any bytes after it are ignored. A
/// stream ending cleanly at a block boundary without the marker is accepted with a
/// warning.
pub fn decompress(mut data: &[u8]) -> Result<Vec<u8>> {
    let mut decompressor = Decompressor::new();
    let mut block = Vec::new();
    let mut raw = Vec::new();
    let mut out = Vec::new();
    let mut blocks = 0u64;
    loop {
        if !read_block_into(&mut data, &mut block)? {
            log::warn!(
                "BGZF stream ended after {blocks} blocks without an end-of-stream marker"
            );
            break;
        }
        if is_eof_marker(&block) {
            break;
        }
        decompressor.decompress(&block, &mut raw)?;
        out.extend_from_slice(&raw);
        blocks += 1;
    }
    Ok(out)
}
