//! # Block Index
//!
//! Engines report the `(compressed, uncompressed)` size of every data block they
//! produce or consume, in stream order, to an optional [`BlockObserver`]. The
//! end-of-stream marker is never reported.
//!
//! [`BlockIndex`] is the stock observer: it accumulates block start offsets and
//! can be stored in the bgzip `.gzi` layout:
//!
//! ```text
//! u64 LE   number of entries
//! u64 LE   compressed offset   ┐ repeated, one pair per block boundary
//! u64 LE   uncompressed offset ┘ (the implicit first block at 0/0 is omitted)
//! ```

use std::io::{Read, Write};

use auto_impl::auto_impl;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use crate::codec::BlockSizes;
use crate::error::Result;

/// Receives the sizes of each data block in stream order
///
/// Called from worker threads (compression) or the consuming thread
/// (decompression), never concurrently for the same engine.
#[auto_impl(&, Box, Arc)]
pub trait BlockObserver: Send + Sync {
    fn on_block(&self, sizes: BlockSizes);
}

/// Start of one block in both coordinate systems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexEntry {
    /// Byte offset of the block within the compressed stream
    pub compressed_offset: u64,
    /// Offset of the block's first byte within the uncompressed data
    pub uncompressed_offset: u64,
}

/// Block boundaries of a BGZF stream
///
/// The first entry is always `0/0`; every reported block appends the boundary
/// that follows it.
#[derive(Debug)]
pub struct BlockIndex {
    entries: Mutex<Vec<IndexEntry>>,
}
impl Default for BlockIndex {
    fn default() -> Self {
        Self::new()
    }
}
impl BlockIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::from_entries(Vec::new())
    }

    fn from_entries(boundaries: Vec<IndexEntry>) -> Self {
        let mut entries = Vec::with_capacity(boundaries.len() + 1);
        entries.push(IndexEntry::default());
        entries.extend(boundaries);
        Self {
            entries: Mutex::new(entries),
        }
    }

    /// Snapshot of every block boundary, starting with `0/0`
    #[must_use]
    pub fn entries(&self) -> Vec<IndexEntry> {
        self.entries.lock().clone()
    }

    /// Total bytes covered in the compressed stream, excluding the marker
    #[must_use]
    pub fn compressed_len(&self) -> u64 {
        self.last().compressed_offset
    }

    /// Total uncompressed bytes covered
    #[must_use]
    pub fn uncompressed_len(&self) -> u64 {
        self.last().uncompressed_offset
    }

    fn last(&self) -> IndexEntry {
        self.entries.lock().last().copied().unwrap_or_default()
    }

    /// Finds the block holding uncompressed byte `pos`
    ///
    /// Returns `None` if `pos` lies beyond the indexed data.
    #[must_use]
    pub fn locate(&self, pos: u64) -> Option<IndexEntry> {
        let entries = self.entries.lock();
        let total = entries.last()?.uncompressed_offset;
        if pos >= total {
            return None;
        }
        let idx = entries.partition_point(|e| e.uncompressed_offset <= pos);
        entries.get(idx.checked_sub(1)?).copied()
    }

    /// BGZF virtual offset of uncompressed byte `pos`
    ///
    /// The block's compressed offset in the upper 48 bits and the offset within
    /// the block in the lower 16 bits.
    #[must_use]
    pub fn virtual_offset(&self, pos: u64) -> Option<u64> {
        let entry = self.locate(pos)?;
        Some((entry.compressed_offset << 16) | (pos - entry.uncompressed_offset))
    }

    /// Writes the index in the `.gzi` layout
    pub fn write_gzi<W: Write>(&self, mut writer: W) -> Result<()> {
        let entries = self.entries.lock();
        let boundaries = &entries[1..];
        writer.write_u64::<LittleEndian>(boundaries.len() as u64)?;
        for entry in boundaries {
            writer.write_u64::<LittleEndian>(entry.compressed_offset)?;
            writer.write_u64::<LittleEndian>(entry.uncompressed_offset)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads an index stored in the `.gzi` layout
    pub fn from_gzi<R: Read>(mut reader: R) -> Result<Self> {
        let n = reader.read_u64::<LittleEndian>()?;
        let mut boundaries = Vec::new();
        for _ in 0..n {
            let compressed_offset = reader.read_u64::<LittleEndian>()?;
            let uncompressed_offset = reader.read_u64::<LittleEndian>()?;
            boundaries.push(IndexEntry {
                compressed_offset,
                uncompressed_offset,
            });
        }
        Ok(Self::from_entries(boundaries))
    }
}
impl BlockObserver for BlockIndex {
    fn on_block(&self, sizes: BlockSizes) {
        let mut entries = self.entries.lock();
        let last = entries.last().copied().unwrap_or_default();
        entries.push(IndexEntry {
            compressed_offset: last.compressed_offset + sizes.compressed as u64,
            uncompressed_offset: last.uncompressed_offset + sizes.uncompressed as u64,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn sizes(compressed: usize, uncompressed: usize) -> BlockSizes {
        BlockSizes {
            compressed,
            uncompressed,
        }
    }

    fn sample() -> BlockIndex {
        let index = BlockIndex::new();
        index.on_block(sizes(100, 1000));
        index.on_block(sizes(50, 1000));
        index.on_block(sizes(10, 24));
        index
    }

    #[test]
    fn test_accumulates_offsets() {
        let index = sample();
        let entries = index.entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0], IndexEntry::default());
        assert_eq!(
            entries[2],
            IndexEntry {
                compressed_offset: 150,
                uncompressed_offset: 2000
            }
        );
        assert_eq!(index.compressed_len(), 160);
        assert_eq!(index.uncompressed_len(), 2024);
    }

    #[test]
    fn test_locate() {
        let index = sample();
        assert_eq!(index.locate(0).unwrap().compressed_offset, 0);
        assert_eq!(index.locate(999).unwrap().compressed_offset, 0);
        assert_eq!(index.locate(1000).unwrap().compressed_offset, 100);
        assert_eq!(index.locate(2023).unwrap().compressed_offset, 150);
        assert!(index.locate(2024).is_none());
        assert!(BlockIndex::new().locate(0).is_none());

        assert_eq!(index.virtual_offset(1005), Some((100 << 16) | 5));
    }

    #[test]
    fn test_gzi_layout() -> anyhow::Result<()> {
        let index = sample();
        let mut gzi = Vec::new();
        index.write_gzi(&mut gzi)?;
        assert_eq!(gzi.len(), 8 + 3 * 16);
        assert_eq!(u64::from_le_bytes(gzi[..8].try_into()?), 3);
        assert_eq!(u64::from_le_bytes(gzi[8..16].try_into()?), 100);
        assert_eq!(u64::from_le_bytes(gzi[16..24].try_into()?), 1000);

        let restored = BlockIndex::from_gzi(&gzi[..])?;
        assert_eq!(restored.entries(), index.entries());
        Ok(())
    }

    #[test]
    fn test_truncated_gzi() {
        let gzi = [2u8, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3];
        assert!(BlockIndex::from_gzi(&gzi[..]).is_err());
    }

    #[test]
    fn test_shared_observer() {
        let index = Arc::new(BlockIndex::new());
        let observer: Box<dyn BlockObserver> = Box::new(Arc::clone(&index));
        observer.on_block(sizes(28, 7));
        assert_eq!(index.uncompressed_len(), 7);
    }
}
