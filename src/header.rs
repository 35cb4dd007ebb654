//! # Block Header and Footer Definitions
//!
//! Every BGZF block is a complete gzip member with a fixed framing:
//!
//! ```text
//! ┌──────────────────────────┐
//! │  Gzip header + BC field  │ 18 bytes (BSIZE patched after compression)
//! ├──────────────────────────┤
//! │                          │
//! │   Raw deflate payload    │ at most 65510 bytes
//! │                          │
//! ├──────────────────────────┤
//! │  CRC32 + ISIZE           │ 8 bytes
//! └──────────────────────────┘
//! ```
//!
//! The header written by this crate is always the canonical 18-byte form (`XLEN = 6`,
//! a single `BC` subfield). Headers read back may carry additional subfields, in which
//! case the `BC` subfield is searched for within the extra field.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{FormatError, Result};

/// Gzip magic bytes
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Deflate compression method identifier
const CM_DEFLATE: u8 = 8;

/// FEXTRA bit of the gzip flag byte
const FLG_FEXTRA: u8 = 0x04;

/// Operating system byte written into every header (unknown)
const OS_UNKNOWN: u8 = 0xff;

/// Length of the fixed part of a gzip header (up to and including XLEN)
pub const SIZE_GZIP_PREFIX: usize = 12;

/// Extra field length of the canonical BGZF header
const XLEN_CANONICAL: u16 = 6;

/// Size of the canonical block header in bytes
pub const SIZE_HEADER: usize = 18;

/// Size of the block footer in bytes
pub const SIZE_FOOTER: usize = 8;

/// Largest total size (header, payload and footer) of a single block
pub const MAX_BLOCK_SIZE: usize = 1 << 16;

/// Largest deflate payload that fits between a canonical header and the footer
pub const MAX_BLOCK_PAYLOAD: usize = MAX_BLOCK_SIZE - SIZE_HEADER - SIZE_FOOTER;

/// Largest uncompressed payload a footer may declare
pub const MAX_UNCOMPRESSED_SIZE: usize = 1 << 16;

/// Default number of raw bytes gathered into each block
pub const DEFAULT_CHUNK_SIZE: usize = 64512;

/// Canonical end-of-stream marker.
///
/// An empty block whose payload is the two-byte fixed-huffman empty deflate stream.
/// It is always the final block of a well-formed stream.
pub const EOF_MARKER: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02, 0x00,
    0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Raw deflate stream of a single empty fixed-huffman block
const EMPTY_DEFLATE: [u8; 2] = [0x03, 0x00];

/// Returns true if `block` is an end-of-stream marker
///
/// Any well-formed block whose payload is the empty deflate stream, with a zero CRC
/// and length, is accepted. Timestamp, XFL and OS bytes and additional extra
/// subfields may differ from [`EOF_MARKER`].
#[must_use]
pub fn is_eof_marker(block: &[u8]) -> bool {
    let Ok(header) = BlockHeader::from_bytes(block) else {
        return false;
    };
    if header.block_size() != block.len() {
        return false;
    }
    let payload = &block[header.header_len()..block.len() - SIZE_FOOTER];
    payload == EMPTY_DEFLATE && BlockFooter::from_block(block) == BlockFooter::new(0, 0)
}

/// Decoded framing information of a block header
///
/// # Fields
///
/// * `xlen` - Length of the gzip extra field (6 for canonical headers)
/// * `bsize` - Total block size minus one, as stored in the `BC` subfield
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Length of the gzip extra field
    pub xlen: u16,

    /// Total block size minus one
    pub bsize: u16,
}
impl BlockHeader {
    /// Creates a canonical header for a block of `block_size` total bytes
    ///
    /// `block_size` must be in `1..=MAX_BLOCK_SIZE`.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        debug_assert!(block_size > 0 && block_size <= MAX_BLOCK_SIZE);
        Self {
            xlen: XLEN_CANONICAL,
            bsize: (block_size - 1) as u16,
        }
    }

    /// Total size of the block (header, payload and footer) in bytes
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.bsize as usize + 1
    }

    /// Size of the header itself in bytes
    #[must_use]
    pub fn header_len(&self) -> usize {
        SIZE_GZIP_PREFIX + self.xlen as usize
    }

    /// Size of the deflate payload in bytes
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.block_size() - self.header_len() - SIZE_FOOTER
    }

    /// Validates the fixed gzip prefix and returns the extra field length
    ///
    /// # Errors
    ///
    /// * `FormatError::InvalidMagic` - If the gzip magic bytes are missing
    /// * `FormatError::InvalidMethod` - If the compression method is not deflate
    /// * `FormatError::MissingExtraField` - If the FEXTRA flag is not set
    pub fn parse_prefix(prefix: &[u8; SIZE_GZIP_PREFIX]) -> Result<u16> {
        if prefix[0..2] != GZIP_MAGIC {
            return Err(FormatError::InvalidMagic([prefix[0], prefix[1]]).into());
        }
        if prefix[2] != CM_DEFLATE {
            return Err(FormatError::InvalidMethod(prefix[2]).into());
        }
        if prefix[3] & FLG_FEXTRA == 0 {
            return Err(FormatError::MissingExtraField(prefix[3]).into());
        }
        Ok(LittleEndian::read_u16(&prefix[10..12]))
    }

    /// Searches the gzip extra field for the `BC` subfield and returns BSIZE
    ///
    /// # Errors
    ///
    /// * `FormatError::MissingBlockSize` - If no `BC` subfield of length 2 is present
    pub fn find_bsize(extra: &[u8]) -> Result<u16> {
        let mut pos = 0;
        while pos + 4 <= extra.len() {
            let slen = LittleEndian::read_u16(&extra[pos + 2..pos + 4]) as usize;
            if extra[pos] == b'B' && extra[pos + 1] == b'C' && slen == 2 && pos + 6 <= extra.len()
            {
                return Ok(LittleEndian::read_u16(&extra[pos + 4..pos + 6]));
            }
            pos += 4 + slen;
        }
        Err(FormatError::MissingBlockSize(extra.len() as u16).into())
    }

    /// Parses a header from the start of a block buffer
    ///
    /// # Errors
    ///
    /// Any error of [`BlockHeader::parse_prefix`] or [`BlockHeader::find_bsize`], and
    /// `FormatError::BlockTooSmall` if the buffer or the declared block size cannot hold
    /// the header and footer.
    pub fn from_bytes(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < SIZE_GZIP_PREFIX {
            return Err(FormatError::BlockTooSmall(buffer.len(), SIZE_HEADER).into());
        }
        let mut prefix = [0u8; SIZE_GZIP_PREFIX];
        prefix.copy_from_slice(&buffer[..SIZE_GZIP_PREFIX]);
        let xlen = Self::parse_prefix(&prefix)?;

        let header_len = SIZE_GZIP_PREFIX + xlen as usize;
        if buffer.len() < header_len {
            return Err(FormatError::BlockTooSmall(buffer.len(), header_len).into());
        }
        let bsize = Self::find_bsize(&buffer[SIZE_GZIP_PREFIX..header_len])?;
        let header = Self { xlen, bsize };
        header.validate()?;
        Ok(header)
    }

    /// Checks that the declared block size leaves room for the header and footer
    pub fn validate(&self) -> Result<()> {
        let framing = self.header_len() + SIZE_FOOTER;
        if self.block_size() < framing {
            return Err(FormatError::BlockTooSmall(self.block_size(), framing).into());
        }
        Ok(())
    }

    /// Writes the canonical 18-byte header into the start of `buffer`
    pub fn write_bytes(&self, buffer: &mut [u8]) {
        buffer[0..2].copy_from_slice(&GZIP_MAGIC);
        buffer[2] = CM_DEFLATE;
        buffer[3] = FLG_FEXTRA;
        buffer[4..8].fill(0); // mtime
        buffer[8] = 0; // xfl
        buffer[9] = OS_UNKNOWN;
        LittleEndian::write_u16(&mut buffer[10..12], XLEN_CANONICAL);
        buffer[12] = b'B';
        buffer[13] = b'C';
        LittleEndian::write_u16(&mut buffer[14..16], 2);
        LittleEndian::write_u16(&mut buffer[16..18], self.bsize);
    }
}

/// Trailer of a block: checksum and length of the uncompressed payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockFooter {
    /// CRC32 of the uncompressed payload
    pub crc32: u32,

    /// Length of the uncompressed payload (mod 2^32)
    pub isize: u32,
}
impl BlockFooter {
    #[must_use]
    pub fn new(crc32: u32, isize: u32) -> Self {
        Self { crc32, isize }
    }

    /// Reads the footer from the last 8 bytes of `block`
    #[must_use]
    pub fn from_block(block: &[u8]) -> Self {
        let footer = &block[block.len() - SIZE_FOOTER..];
        Self {
            crc32: LittleEndian::read_u32(&footer[0..4]),
            isize: LittleEndian::read_u32(&footer[4..8]),
        }
    }

    /// Writes the footer into the start of `buffer`
    pub fn write_bytes(&self, buffer: &mut [u8]) {
        LittleEndian::write_u32(&mut buffer[0..4], self.crc32);
        LittleEndian::write_u32(&mut buffer[4..8], self.isize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_payload_budget() {
        assert_eq!(MAX_BLOCK_PAYLOAD, 65510);
        const { assert!(DEFAULT_CHUNK_SIZE <= MAX_BLOCK_PAYLOAD) };
    }

    #[test]
    fn test_eof_marker_parses() -> crate::Result<()> {
        let header = BlockHeader::from_bytes(&EOF_MARKER)?;
        assert_eq!(header.block_size(), EOF_MARKER.len());
        assert_eq!(header.header_len(), SIZE_HEADER);
        assert_eq!(header.payload_len(), 2);

        let footer = BlockFooter::from_block(&EOF_MARKER);
        assert_eq!(footer, BlockFooter::new(0, 0));
        Ok(())
    }

    #[test]
    fn test_canonical_header_matches_marker() {
        let mut buffer = [0u8; SIZE_HEADER];
        BlockHeader::new(EOF_MARKER.len()).write_bytes(&mut buffer);
        assert_eq!(buffer, EOF_MARKER[..SIZE_HEADER]);
    }

    #[test]
    fn test_marker_recognized_by_content() {
        assert!(is_eof_marker(&EOF_MARKER));

        // Unix OS byte and a nonzero timestamp
        let mut unix = EOF_MARKER;
        unix[9] = 0x03;
        unix[4] = 0x5a;
        assert!(is_eof_marker(&unix));

        // "XY" subfield ahead of BC, with BSIZE grown to match
        let mut extended = EOF_MARKER[..12].to_vec();
        extended[10] = 12;
        extended.extend_from_slice(&[b'X', b'Y', 2, 0, 7, 7]);
        extended.extend_from_slice(&[b'B', b'C', 2, 0, 33, 0]);
        extended.extend_from_slice(&EOF_MARKER[18..]);
        assert_eq!(extended.len(), 34);
        assert!(is_eof_marker(&extended));
    }

    #[test]
    fn test_non_empty_blocks_are_not_markers() {
        let mut with_length = EOF_MARKER;
        with_length[24] = 1;
        assert!(!is_eof_marker(&with_length));

        let mut with_crc = EOF_MARKER;
        with_crc[20] = 1;
        assert!(!is_eof_marker(&with_crc));

        let mut other_payload = EOF_MARKER;
        other_payload[18] = 0x01;
        assert!(!is_eof_marker(&other_payload));

        assert!(!is_eof_marker(&EOF_MARKER[..27]));
        assert!(!is_eof_marker(b"not a block at all, 28 bytes"));
    }

    #[test]
    fn test_invalid_magic() {
        let mut block = EOF_MARKER;
        block[1] = 0x8c;
        let err = BlockHeader::from_bytes(&block).unwrap_err();
        assert!(matches!(
            err,
            Error::FormatError(FormatError::InvalidMagic([0x1f, 0x8c]))
        ));
    }

    #[test]
    fn test_missing_bc_subfield() {
        let mut block = EOF_MARKER;
        block[12] = b'X';
        let err = BlockHeader::from_bytes(&block).unwrap_err();
        assert!(matches!(
            err,
            Error::FormatError(FormatError::MissingBlockSize(6))
        ));
    }

    #[test]
    fn test_missing_extra_flag() {
        let mut block = EOF_MARKER;
        block[3] = 0;
        assert!(matches!(
            BlockHeader::from_bytes(&block),
            Err(Error::FormatError(FormatError::MissingExtraField(0)))
        ));
    }

    #[test]
    fn test_bc_after_foreign_subfield() -> crate::Result<()> {
        // "XY" subfield of 3 bytes precedes BC
        let extra = [b'X', b'Y', 3, 0, 1, 2, 3, b'B', b'C', 2, 0, 0x34, 0x12];
        assert_eq!(BlockHeader::find_bsize(&extra)?, 0x1234);
        Ok(())
    }

    #[test]
    fn test_block_too_small() {
        let mut block = EOF_MARKER;
        // BSIZE of 10 cannot hold an 18 byte header
        block[16] = 9;
        assert!(matches!(
            BlockHeader::from_bytes(&block),
            Err(Error::FormatError(FormatError::BlockTooSmall(10, 26)))
        ));
    }
}
