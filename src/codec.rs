//! Stateless per-block compression primitives
//!
//! [`Compressor`] deflates a bounded chunk into one complete block (header, payload and
//! footer) and [`Decompressor`] inflates one block back to raw bytes while checking the
//! footer. Neither type splits input or frames streams; see [`crate::planner`] and
//! [`crate::block`] for that.

use flate2::{Compress, Compression, Crc, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{FormatError, IntegrityError, Result};
use crate::header::{
    BlockFooter, BlockHeader, MAX_BLOCK_PAYLOAD, MAX_BLOCK_SIZE, MAX_UNCOMPRESSED_SIZE,
    SIZE_FOOTER, SIZE_HEADER,
};

/// Default deflate level
pub const DEFAULT_LEVEL: u32 = 6;

/// Largest raw chunk guaranteed to deflate into a single block payload
///
/// Derived from the most conservative zlib bound, `n + ceil(n/8) + ceil(n/64) + 5`,
/// which also covers stored-block fallbacks of the rust backend.
pub const DEFLATE_BOUND: usize = max_input_within(MAX_BLOCK_PAYLOAD);

const fn worst_case_deflate(n: usize) -> usize {
    n + ((n + 7) >> 3) + ((n + 63) >> 6) + 5
}

const fn max_input_within(budget: usize) -> usize {
    let (mut lo, mut hi) = (0, budget);
    while lo < hi {
        let mid = (lo + hi).div_ceil(2);
        if worst_case_deflate(mid) <= budget {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    lo
}

/// Compressed and uncompressed size of one emitted block
///
/// This is the unit reported to index builders through [`crate::BlockObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockSizes {
    /// Total block size on disk (header, payload and footer)
    pub compressed: usize,
    /// Number of raw bytes stored in the block
    pub uncompressed: usize,
}

/// Deflates single chunks into complete BGZF blocks
pub struct Compressor {
    inner: Compress,
    level: u32,
}
impl Default for Compressor {
    fn default() -> Self {
        Self::new(DEFAULT_LEVEL)
    }
}
impl Compressor {
    /// Creates a raw-deflate compressor at `level` (0-9)
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self {
            inner: Compress::new(Compression::new(level), false),
            level,
        }
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Compresses `raw` into one block appended to `out`
    ///
    /// Returns the sizes of the emitted block, or `None` (leaving `out` untouched) when
    /// the deflated chunk does not fit in a single block payload. Splitting is up to the
    /// caller.
    pub fn compress(&mut self, raw: &[u8], out: &mut Vec<u8>) -> Result<Option<BlockSizes>> {
        if raw.len() > MAX_UNCOMPRESSED_SIZE {
            return Ok(None);
        }

        let start = out.len();
        out.resize(start + MAX_BLOCK_SIZE, 0);

        self.inner.reset();
        let payload = &mut out[start + SIZE_HEADER..start + MAX_BLOCK_SIZE - SIZE_FOOTER];
        let status = self.inner.compress(raw, payload, FlushCompress::Finish)?;
        if status != Status::StreamEnd || self.inner.total_in() as usize != raw.len() {
            out.truncate(start);
            return Ok(None);
        }

        let payload_len = self.inner.total_out() as usize;
        let block_size = SIZE_HEADER + payload_len + SIZE_FOOTER;

        BlockHeader::new(block_size).write_bytes(&mut out[start..start + SIZE_HEADER]);
        BlockFooter::new(crc32(raw), raw.len() as u32)
            .write_bytes(&mut out[start + SIZE_HEADER + payload_len..start + block_size]);
        out.truncate(start + block_size);

        Ok(Some(BlockSizes {
            compressed: block_size,
            uncompressed: raw.len(),
        }))
    }
}

/// Inflates complete BGZF blocks and verifies their footers
pub struct Decompressor {
    inner: Decompress,
}
impl Default for Decompressor {
    fn default() -> Self {
        Self::new()
    }
}
impl Decompressor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Decompress::new(false),
        }
    }

    /// Inflates `block` (exactly one BGZF block) into `out`, replacing its contents
    ///
    /// Returns the number of uncompressed bytes.
    ///
    /// # Errors
    ///
    /// * `FormatError` - If the framing is malformed or the payload is not valid deflate
    /// * `IntegrityError` - If the inflated length or CRC32 disagree with the footer
    pub fn decompress(&mut self, block: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let header = BlockHeader::from_bytes(block)?;
        if header.block_size() != block.len() {
            return Err(FormatError::BlockSizeMismatch {
                expected: header.block_size(),
                found: block.len(),
            }
            .into());
        }

        let footer = BlockFooter::from_block(block);
        if footer.isize as usize > MAX_UNCOMPRESSED_SIZE {
            return Err(FormatError::UncompressedTooLarge(footer.isize).into());
        }
        let expected = footer.isize as usize;
        let payload = &block[header.header_len()..block.len() - SIZE_FOOTER];

        // One spare byte so an overlong payload shows up as a size mismatch
        out.clear();
        out.resize(expected + 1, 0);

        self.inner.reset(false);
        let status = self
            .inner
            .decompress(payload, out, FlushDecompress::Finish)
            .map_err(FormatError::from)?;
        let produced = self.inner.total_out() as usize;
        out.truncate(produced);

        if status != Status::StreamEnd || produced != expected {
            return Err(IntegrityError::SizeMismatch {
                expected: footer.isize,
                found: produced,
            }
            .into());
        }

        let found = crc32(out);
        if found != footer.crc32 {
            return Err(IntegrityError::ChecksumMismatch {
                expected: footer.crc32,
                found,
            }
            .into());
        }

        Ok(produced)
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{EOF_MARKER, MAX_BLOCK_PAYLOAD};
    use crate::Error;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut data = vec![0u8; len];
        rng.fill(&mut data[..]);
        data
    }

    #[test]
    fn test_deflate_bound() {
        assert!(DEFLATE_BOUND < MAX_BLOCK_PAYLOAD);
        assert!(worst_case_deflate(DEFLATE_BOUND) <= MAX_BLOCK_PAYLOAD);
        assert!(worst_case_deflate(DEFLATE_BOUND + 1) > MAX_BLOCK_PAYLOAD);
    }

    #[test]
    fn test_roundtrip_sizes() -> anyhow::Result<()> {
        let mut compressor = Compressor::default();
        let mut decompressor = Decompressor::new();
        for len in [0, 1, 17, 4096, DEFLATE_BOUND] {
            let raw = random_bytes(len, len as u64);
            let mut block = Vec::new();
            let sizes = compressor.compress(&raw, &mut block)?.expect("chunk within bound");
            assert_eq!(sizes.compressed, block.len());
            assert_eq!(sizes.uncompressed, len);
            assert!(block.len() <= MAX_BLOCK_SIZE);

            let mut out = Vec::new();
            assert_eq!(decompressor.decompress(&block, &mut out)?, len);
            assert_eq!(out, raw);
        }
        Ok(())
    }

    #[test]
    fn test_full_payload_compressible() -> anyhow::Result<()> {
        let raw = vec![b'A'; MAX_BLOCK_PAYLOAD];
        let mut block = Vec::new();
        let sizes = Compressor::new(1).compress(&raw, &mut block)?;
        assert!(sizes.is_some());

        let mut out = Vec::new();
        Decompressor::new().decompress(&block, &mut out)?;
        assert_eq!(out, raw);
        Ok(())
    }

    #[test]
    fn test_incompressible_overflow_is_reported() -> anyhow::Result<()> {
        // Stored blocks add framing, so a full payload of noise cannot fit at level 0
        let raw = random_bytes(MAX_BLOCK_PAYLOAD, 7);
        let mut block = vec![1, 2, 3];
        let sizes = Compressor::new(0).compress(&raw, &mut block)?;
        assert!(sizes.is_none());
        assert_eq!(block, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_appends_after_existing_blocks() -> anyhow::Result<()> {
        let mut compressor = Compressor::default();
        let mut out = Vec::new();
        let first = compressor.compress(b"first", &mut out)?.unwrap();
        let second = compressor.compress(b"second", &mut out)?.unwrap();
        assert_eq!(out.len(), first.compressed + second.compressed);

        let mut raw = Vec::new();
        let mut decompressor = Decompressor::new();
        decompressor.decompress(&out[first.compressed..], &mut raw)?;
        assert_eq!(raw, b"second");
        Ok(())
    }

    #[test]
    fn test_eof_marker_decompresses_empty() -> anyhow::Result<()> {
        let mut out = vec![9; 4];
        assert_eq!(Decompressor::new().decompress(&EOF_MARKER, &mut out)?, 0);
        assert!(out.is_empty());
        Ok(())
    }

    #[test]
    fn test_crc_bit_flips_detected() -> anyhow::Result<()> {
        let mut compressor = Compressor::default();
        let mut decompressor = Decompressor::new();
        for len in [1, 100, 10_000, DEFLATE_BOUND] {
            let raw = random_bytes(len, 99 + len as u64);
            let mut block = Vec::new();
            compressor.compress(&raw, &mut block)?.unwrap();
            let crc_start = block.len() - SIZE_FOOTER;
            for bit in 0..32 {
                let mut corrupt = block.clone();
                corrupt[crc_start + bit / 8] ^= 1 << (bit % 8);
                let mut out = Vec::new();
                let err = decompressor.decompress(&corrupt, &mut out).unwrap_err();
                assert!(matches!(
                    err,
                    Error::IntegrityError(IntegrityError::ChecksumMismatch { .. })
                ));
            }
        }
        Ok(())
    }

    #[test]
    fn test_isize_mismatch_detected() -> anyhow::Result<()> {
        let mut block = Vec::new();
        Compressor::default().compress(b"hello world", &mut block)?.unwrap();
        let isize_pos = block.len() - 4;
        block[isize_pos] = 3;

        let err = Decompressor::new()
            .decompress(&block, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::IntegrityError(IntegrityError::SizeMismatch {
                expected: 3,
                found: 4
            })
        ));
        Ok(())
    }

    #[test]
    fn test_truncated_buffer_rejected() -> anyhow::Result<()> {
        let mut block = Vec::new();
        Compressor::default().compress(b"hello world", &mut block)?.unwrap();
        block.pop();
        let err = Decompressor::new()
            .decompress(&block, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::FormatError(FormatError::BlockSizeMismatch { .. })
        ));
        Ok(())
    }
}
