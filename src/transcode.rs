//! # BGZF Transcoder
//!
//! Recompresses a BGZF stream (for instance at a different level or chunk size)
//! with a [`BgzfReader`] and a [`BgzfWriter`] running on one shared [`WorkerPool`].
//! The two halves exchange no data directly, only worker time; the pool's priority
//! order lets finished blocks drain to the sink before new blocks are read.
//!
//! An error on the inflate side terminates the shared pool, which aborts the deflate
//! side as well.

use std::io::{self, BufRead, Read, Write};
use std::sync::Arc;

use crate::error::Result;
use crate::index::BlockObserver;
use crate::pool::WorkerPool;
use crate::reader::{BgzfReader, BgzfReaderBuilder};
use crate::writer::{BgzfWriter, BgzfWriterBuilder};

/// A BGZF reader and writer sharing one worker pool
///
/// Implements [`Read`] (decompressed input) and [`Write`] (data to compress), so
/// records can be filtered or rewritten in between. [`run`](Self::run) copies the
/// whole input unchanged.
pub struct BgzfTranscoder<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    reader: BgzfReader<R>,
    writer: BgzfWriter<W>,
}
impl<R, W> BgzfTranscoder<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    /// The shared pool
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        self.reader.pool()
    }

    pub fn reader_mut(&mut self) -> &mut BgzfReader<R> {
        &mut self.reader
    }

    pub fn writer_mut(&mut self) -> &mut BgzfWriter<W> {
        &mut self.writer
    }

    /// Copies every remaining decompressed byte into the writer and finishes it
    ///
    /// Returns the number of uncompressed bytes copied.
    ///
    /// # Errors
    ///
    /// The first error of either half. An inflate error also aborts the writer.
    pub fn run(&mut self) -> Result<u64> {
        let mut copied = 0;
        loop {
            let buf = self.reader.buffered()?;
            if buf.is_empty() {
                break;
            }
            let n = buf.len();
            self.writer.write_bytes(buf)?;
            self.reader.consume(n);
            copied += n as u64;
        }
        self.writer.finish()?;
        Ok(copied)
    }

    /// Finishes the output stream
    pub fn finish(&mut self) -> Result<()> {
        self.writer.finish()
    }

    /// Finishes the output stream and returns its sink
    ///
    /// Any unread input is discarded.
    pub fn into_inner(self) -> Result<W> {
        let Self { reader, writer } = self;
        drop(reader);
        writer.into_inner()
    }
}
impl<R, W> Read for BgzfTranscoder<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}
impl<R, W> Write for BgzfTranscoder<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Builder for [`BgzfTranscoder`]
#[derive(Default)]
pub struct BgzfTranscoderBuilder {
    threads: Option<usize>,
    buffers: Option<usize>,
    level: Option<u32>,
    chunk_size: Option<usize>,
    observer: Option<Box<dyn BlockObserver>>,
}
impl BgzfTranscoderBuilder {
    /// Sets the number of worker threads shared by both halves (0 selects the default)
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Sets the number of buffer slots of each half
    #[must_use]
    pub fn buffers(mut self, buffers: usize) -> Self {
        self.buffers = Some(buffers);
        self
    }

    /// Sets the deflate level of the output
    #[must_use]
    pub fn level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    /// Sets the chunk size of the output
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Reports the sizes of every output block to `observer`
    #[must_use]
    pub fn observer<O: BlockObserver + 'static>(mut self, observer: O) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Starts transcoding from `input` to `output`
    ///
    /// # Errors
    ///
    /// Any configuration error of either half, or a failure to spawn the pool.
    pub fn build<R, W>(self, input: R, output: W) -> Result<BgzfTranscoder<R, W>>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let pool = WorkerPool::new(self.threads.unwrap_or(0))?;

        let mut writer = BgzfWriterBuilder::default().pool(Arc::clone(&pool));
        if let Some(level) = self.level {
            writer = writer.level(level);
        }
        if let Some(chunk_size) = self.chunk_size {
            writer = writer.chunk_size(chunk_size);
        }
        if let Some(buffers) = self.buffers {
            writer = writer.buffers(buffers);
        }
        if let Some(observer) = self.observer {
            writer = writer.observer(observer);
        }
        let writer = writer.build(output)?;

        let mut reader = BgzfReaderBuilder::default().pool(pool);
        if let Some(buffers) = self.buffers {
            reader = reader.buffers(buffers);
        }
        let reader = reader.build(input)?;

        Ok(BgzfTranscoder { reader, writer })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{compress, decompress, read_block_into};
    use crate::error::{Error, IntegrityError, PipelineError};
    use crate::header::{BlockHeader, EOF_MARKER, SIZE_FOOTER};
    use crate::index::BlockIndex;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use std::io::Cursor;

    fn random_text(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..len).map(|_| b"ACGTN"[rng.random_range(0..5)]).collect()
    }

    fn count_blocks(mut stream: &[u8]) -> anyhow::Result<usize> {
        let mut block = Vec::new();
        let mut n = 0;
        while read_block_into(&mut stream, &mut block)? {
            n += 1;
        }
        Ok(n)
    }

    #[test]
    fn test_recompress() -> anyhow::Result<()> {
        let data = random_text(800_000, 1);
        let input = compress(&data, 1)?;

        let index = Arc::new(BlockIndex::new());
        let mut transcoder = BgzfTranscoderBuilder::default()
            .threads(4)
            .level(9)
            .chunk_size(16_384)
            .observer(Arc::clone(&index))
            .build(Cursor::new(input), Vec::new())?;
        assert_eq!(transcoder.run()?, data.len() as u64);
        let output = transcoder.into_inner()?;

        assert_eq!(decompress(&output)?, data);
        assert_eq!(count_blocks(&output)?, data.len().div_ceil(16_384) + 1);
        assert_eq!(index.uncompressed_len(), data.len() as u64);
        Ok(())
    }

    #[test]
    fn test_manual_read_write() -> anyhow::Result<()> {
        let input = compress(b"keep: one\ndrop: two\nkeep: three\n", 6)?;
        let mut transcoder = BgzfTranscoderBuilder::default()
            .threads(2)
            .build(Cursor::new(input), Vec::new())?;

        let mut text = String::new();
        transcoder.read_to_string(&mut text)?;
        for line in text.lines().filter(|l| l.starts_with("keep")) {
            writeln!(transcoder, "{line}")?;
        }
        let output = transcoder.into_inner()?;
        assert_eq!(decompress(&output)?, b"keep: one\nkeep: three\n");
        Ok(())
    }

    #[test]
    fn test_empty_input() -> anyhow::Result<()> {
        let mut transcoder =
            BgzfTranscoderBuilder::default().build(Cursor::new(EOF_MARKER.to_vec()), Vec::new())?;
        assert_eq!(transcoder.run()?, 0);
        assert_eq!(transcoder.into_inner()?, EOF_MARKER.to_vec());
        Ok(())
    }

    #[test]
    fn test_inflate_error_aborts_both_halves() -> anyhow::Result<()> {
        let data = random_text(400_000, 2);
        let mut input = compress(&data, 6)?;
        // Corrupt the CRC of the third block
        let mut pos = 0;
        for _ in 0..3 {
            pos += BlockHeader::from_bytes(&input[pos..])?.block_size();
        }
        input[pos - SIZE_FOOTER] ^= 0xff;

        let mut transcoder = BgzfTranscoderBuilder::default()
            .threads(3)
            .build(Cursor::new(input), Vec::new())?;
        let err = transcoder.run().unwrap_err();
        assert!(matches!(
            err,
            Error::IntegrityError(IntegrityError::ChecksumMismatch { .. })
        ));
        assert!(transcoder.pool().is_terminated());
        assert!(matches!(
            transcoder.finish().unwrap_err(),
            Error::PipelineError(PipelineError::Aborted)
        ));
        Ok(())
    }
}
