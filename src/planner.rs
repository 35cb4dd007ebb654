//! Bounded flushing of raw buffers into BGZF blocks
//!
//! The planner is the only caller of [`Compressor::compress`] and guarantees that every
//! block it emits fits the 64 KiB ceiling:
//!
//! * In **full-flush** mode the whole buffer is consumed. The buffer is first tried as a
//!   single block; when it does not fit it is split into two near-equal halves
//!   (`ceil(n/2)` and the remainder) which are flushed the same way, back to back.
//! * In **partial** mode only the first `min(n, DEFLATE_BOUND)` bytes are compressed
//!   into one block and the number of unconsumed bytes is returned to the caller.

use crate::codec::{BlockSizes, Compressor, DEFLATE_BOUND};
use crate::error::{CapacityError, Result};
use crate::header::MAX_BLOCK_PAYLOAD;

/// Splits raw buffers into blocks that respect the block-size ceiling
pub struct FlushPlanner {
    compressor: Compressor,
}
impl FlushPlanner {
    #[must_use]
    pub fn new(level: u32) -> Self {
        Self {
            compressor: Compressor::new(level),
        }
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.compressor.level()
    }

    /// Flushes `input` as one or more blocks appended to `out`
    ///
    /// The sizes of every emitted block are pushed onto `sizes` in output order.
    ///
    /// Returns the number of trailing input bytes that were *not* consumed. This is
    /// always zero in full-flush mode; in partial mode the caller must keep those bytes
    /// for the next call.
    ///
    /// # Errors
    ///
    /// * `CapacityError::BlockOverflow` - If a chunk within [`DEFLATE_BOUND`] still does
    ///   not fit, which means the deflate backend broke its worst-case bound
    pub fn flush(
        &mut self,
        input: &[u8],
        full_flush: bool,
        out: &mut Vec<u8>,
        sizes: &mut Vec<BlockSizes>,
    ) -> Result<usize> {
        if full_flush {
            self.flush_split(input, out, sizes)?;
            return Ok(0);
        }

        let take = input.len().min(DEFLATE_BOUND);
        if take == 0 {
            return Ok(0);
        }
        let emitted = self.compress_bounded(&input[..take], out)?;
        sizes.push(emitted);
        Ok(input.len() - take)
    }

    fn flush_split(
        &mut self,
        input: &[u8],
        out: &mut Vec<u8>,
        sizes: &mut Vec<BlockSizes>,
    ) -> Result<()> {
        if input.is_empty() {
            return Ok(());
        }
        if input.len() <= DEFLATE_BOUND {
            sizes.push(self.compress_bounded(input, out)?);
            return Ok(());
        }
        if let Some(emitted) = self.compressor.compress(input, out)? {
            sizes.push(emitted);
            return Ok(());
        }

        log::trace!("splitting {} byte chunk into two blocks", input.len());
        let (head, tail) = input.split_at(input.len().div_ceil(2));
        self.flush_split(head, out, sizes)?;
        self.flush_split(tail, out, sizes)
    }

    fn compress_bounded(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<BlockSizes> {
        match self.compressor.compress(chunk, out)? {
            Some(emitted) => Ok(emitted),
            None => Err(CapacityError::BlockOverflow(chunk.len(), MAX_BLOCK_PAYLOAD).into()),
        }
    }
}
