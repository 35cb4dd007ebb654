//! # Parallel BGZF Writer
//!
//! [`BgzfWriter`] gathers written bytes into chunks, compresses the chunks on a
//! [`WorkerPool`] and writes the resulting blocks to the sink in the order the data
//! arrived.
//!
//! ## Pipeline
//!
//! ```text
//! write() ──fill──▶ slot ──Compress task──▶ compressed ──Write task──▶ sink ──▶ free
//! ```
//!
//! A chunk receives its sequence number when it is handed to the pool. Compressed
//! slots are reordered by a [`ConsecutiveReleaseQueue`] whose ready bound only
//! admits block `n + 1` once block `n` reached the sink. When every slot is in
//! flight, `write` blocks until one is reclaimed.
//!
//! ## Errors
//!
//! Failures in either stage are latched together with the sequence number of the
//! failing chunk; a failure on an earlier chunk replaces one on a later chunk. The
//! pipeline then stops accepting work, drains, and the latched error is returned by
//! the next call to `write`, `flush` or `finish`.

use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::codec::{BlockSizes, DEFAULT_LEVEL};
use crate::error::{ConfigError, Error, PipelineError, Result};
use crate::header::{DEFAULT_CHUNK_SIZE, EOF_MARKER, MAX_BLOCK_PAYLOAD};
use crate::index::BlockObserver;
use crate::planner::FlushPlanner;
use crate::pool::{Operation, Scheduler, Stage, WorkerPool, BUFFERS_PER_THREAD};
use crate::queue::{ConsecutiveReleaseQueue, Sequenced, TerminatableQueue};

struct Slot {
    raw: Vec<u8>,
    out: Vec<u8>,
    sizes: Vec<BlockSizes>,
    planner: FlushPlanner,
}

/// A compressed slot waiting for its turn at the sink
struct Compressed {
    seq: u64,
    slot: usize,
}
impl Sequenced for Compressed {
    fn sequence(&self) -> u64 {
        self.seq
    }
}

#[derive(Default)]
struct Progress {
    /// Chunks handed to the pool and not yet retired
    in_flight: usize,
    /// Error of the lowest failing sequence number
    latched: Option<(u64, Error)>,
    failed: bool,
    aborted: bool,
}

struct Shared<W> {
    sink: Mutex<Option<W>>,
    slots: Vec<Mutex<Slot>>,
    free: TerminatableQueue<usize>,
    compressed: ConsecutiveReleaseQueue<Compressed>,
    progress: Mutex<Progress>,
    drained: Condvar,
    observer: Option<Box<dyn BlockObserver>>,
    scheduler: Scheduler,
}
impl<W: Write + Send + 'static> Shared<W> {
    fn compress_block(self: &Arc<Self>, slot: usize, seq: u64) {
        let result = {
            let mut guard = self.slots[slot].lock();
            let Slot {
                raw,
                out,
                sizes,
                planner,
            } = &mut *guard;
            out.clear();
            sizes.clear();
            planner.flush(raw, true, out, sizes)
        };

        if let Err(e) = result {
            self.fail(seq, e);
            self.retire(slot);
            return;
        }
        log::trace!("compressed chunk {seq}");

        match self.compressed.enqueue(Compressed { seq, slot }) {
            Ok(()) => {
                self.scheduler
                    .submit(Operation::Write, seq, slot, Arc::clone(self) as Arc<dyn Stage>);
            }
            Err(rejected) => self.retire(rejected.slot),
        }
    }

    /// Writes every chunk that is next in line
    ///
    /// A worker never waits for the sink. If another worker holds it, that worker
    /// writes the released chunks, and it re-checks for new ones after unlocking.
    fn write_ready(&self) {
        loop {
            let Some(mut sink) = self.sink.try_lock() else {
                return;
            };
            while let Some(Compressed { seq, slot }) = self.compressed.try_dequeue() {
                let written = match sink.as_mut() {
                    Some(sink) => self.write_slot(sink, slot),
                    None => Err(PipelineError::Finished.into()),
                };
                if let Err(e) = written {
                    self.fail(seq, e);
                    self.retire(slot);
                    return;
                }
                log::trace!("wrote chunk {seq}");
                self.compressed.set_ready_for(seq + 1);
                self.retire(slot);
            }
            drop(sink);
            if !self.compressed.has_released() {
                return;
            }
        }
    }

    fn write_slot(&self, sink: &mut W, slot: usize) -> Result<()> {
        let guard = self.slots[slot].lock();
        sink.write_all(&guard.out)?;
        if let Some(observer) = &self.observer {
            guard.sizes.iter().for_each(|&sizes| observer.on_block(sizes));
        }
        Ok(())
    }

    /// Returns a slot to the free list and signals the drain when it was the last
    fn retire(&self, slot: usize) {
        self.free.enqueue(slot);
        let mut progress = self.progress.lock();
        progress.in_flight -= 1;
        if progress.in_flight == 0 {
            self.drained.notify_all();
        }
    }

    /// Latches `err` for chunk `seq` and stops accepting work
    fn fail(&self, seq: u64, err: Error) {
        {
            let mut progress = self.progress.lock();
            progress.failed = true;
            if !matches!(&progress.latched, Some((latched, _)) if *latched <= seq) {
                log::debug!("writer failed at chunk {seq}: {err}");
                progress.latched = Some((seq, err));
            }
        }
        self.free.terminate();
        for pending in self.compressed.terminate() {
            self.retire(pending.slot);
        }
    }

    fn is_failed(&self) -> bool {
        let progress = self.progress.lock();
        progress.failed || progress.aborted
    }

    /// Blocks until every chunk handed to the pool is retired
    ///
    /// Returns the latched error if the pipeline failed.
    fn drain(&self) -> Result<()> {
        let mut progress = self.progress.lock();
        while progress.in_flight > 0 && !progress.aborted {
            self.drained.wait(&mut progress);
        }
        if let Some((_, err)) = progress.latched.take() {
            return Err(err);
        }
        if progress.failed || progress.aborted {
            return Err(PipelineError::Aborted.into());
        }
        Ok(())
    }
}
impl<W: Write + Send + 'static> Stage for Shared<W> {
    fn run(self: Arc<Self>, op: Operation, slot: usize, seq: u64) {
        match op {
            Operation::Compress => self.compress_block(slot, seq),
            Operation::Write => self.write_ready(),
            Operation::Decompress | Operation::Read => {
                unreachable!("writer scheduled a {op:?} task")
            }
        }
    }

    fn abort(&self) {
        self.progress.lock().aborted = true;
        self.drained.notify_all();
        self.free.terminate();
        drop(self.compressed.terminate());
    }
}

/// Multi-threaded BGZF compressor
///
/// The stream is completed by [`finish`](Self::finish), which appends the
/// end-of-stream marker. Dropping an unfinished writer finishes it and logs any
/// error.
///
/// # Example
///
/// ```rust,no_run
/// use std::io::Write;
/// use parbgzf::BgzfWriterBuilder;
///
/// let file = std::fs::File::create("data.gz").unwrap();
/// let mut writer = BgzfWriterBuilder::default().level(9).build(file).unwrap();
/// writer.write_all(b"hello bgzf").unwrap();
/// writer.finish().unwrap();
/// ```
pub struct BgzfWriter<W: Write + Send + 'static> {
    shared: Arc<Shared<W>>,
    pool: Arc<WorkerPool>,
    /// Chunk currently being filled
    buffer: Vec<u8>,
    chunk_size: usize,
    next_seq: u64,
    finished: bool,
}
impl<W: Write + Send + 'static> BgzfWriter<W> {
    fn new(inner: W, pool: Arc<WorkerPool>, config: WriterConfig) -> Result<Self> {
        if pool.is_terminated() {
            return Err(PipelineError::Aborted.into());
        }

        let free = TerminatableQueue::new();
        (0..config.buffers).for_each(|slot| free.enqueue(slot));
        let slots = (0..config.buffers)
            .map(|_| {
                Mutex::new(Slot {
                    raw: Vec::with_capacity(config.chunk_size),
                    out: Vec::new(),
                    sizes: Vec::new(),
                    planner: FlushPlanner::new(config.level),
                })
            })
            .collect();
        let compressed = ConsecutiveReleaseQueue::new();
        compressed.set_ready_for(0);

        let shared = Arc::new(Shared {
            sink: Mutex::new(Some(inner)),
            slots,
            free,
            compressed,
            progress: Mutex::new(Progress::default()),
            drained: Condvar::new(),
            observer: config.observer,
            scheduler: pool.scheduler(),
        });
        let stage: Arc<dyn Stage> = shared.clone();
        pool.register(Arc::downgrade(&stage));

        Ok(Self {
            shared,
            pool,
            buffer: Vec::with_capacity(config.chunk_size),
            chunk_size: config.chunk_size,
            next_seq: 0,
            finished: false,
        })
    }

    /// The pool running this writer
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Number of chunks handed to the pool so far
    #[must_use]
    pub fn chunks_submitted(&self) -> u64 {
        self.next_seq
    }

    /// Buffers `buf`, handing full chunks to the pool
    ///
    /// Blocks while every buffer slot is in flight.
    ///
    /// # Errors
    ///
    /// * `PipelineError::Finished` - If the stream was already finished
    /// * Any error latched by the compress or write stage
    pub fn write_bytes(&mut self, mut buf: &[u8]) -> Result<()> {
        if self.finished {
            return Err(PipelineError::Finished.into());
        }
        if self.shared.is_failed() {
            return self.shared.drain();
        }
        while !buf.is_empty() {
            let take = (self.chunk_size - self.buffer.len()).min(buf.len());
            self.buffer.extend_from_slice(&buf[..take]);
            buf = &buf[take..];
            if self.buffer.len() == self.chunk_size {
                self.submit()?;
            }
        }
        Ok(())
    }

    /// Hands the current chunk to the pool
    fn submit(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let Ok(slot) = self.shared.free.dequeue() else {
            return self.shared.drain();
        };
        if self.shared.is_failed() {
            self.shared.free.enqueue(slot);
            return self.shared.drain();
        }

        {
            let mut guard = self.shared.slots[slot].lock();
            guard.raw.clear();
            std::mem::swap(&mut guard.raw, &mut self.buffer);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.shared.progress.lock().in_flight += 1;
        self.shared.scheduler.submit(
            Operation::Compress,
            seq,
            slot,
            Arc::clone(&self.shared) as Arc<dyn Stage>,
        );
        Ok(())
    }

    /// Compresses the partial chunk and waits until everything reached the sink
    fn drain(&mut self) -> Result<()> {
        self.submit()?;
        self.shared.drain()
    }

    /// Completes the stream
    ///
    /// Compresses any buffered bytes, waits for every block to be written, appends
    /// the end-of-stream marker and flushes the sink. Calling `finish` again on a
    /// completed stream has no effect.
    ///
    /// # Errors
    ///
    /// Returns the error of the earliest failing chunk, or any I/O error raised while
    /// writing the marker.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return if self.shared.is_failed() {
                Err(PipelineError::Aborted.into())
            } else {
                Ok(())
            };
        }
        self.finished = true;
        self.drain()?;

        let mut sink = self.shared.sink.lock();
        let inner = sink.as_mut().ok_or(PipelineError::Finished)?;
        inner.write_all(&EOF_MARKER)?;
        inner.flush()?;
        log::debug!("finished BGZF stream of {} chunks", self.next_seq);
        Ok(())
    }

    /// Finishes the stream and returns the sink
    pub fn into_inner(mut self) -> Result<W> {
        self.finish()?;
        self.shared
            .sink
            .lock()
            .take()
            .ok_or_else(|| PipelineError::Finished.into())
    }
}
impl<W: Write + Send + 'static> Write for BgzfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    /// Writes out every buffered byte and flushes the sink, without ending the stream
    fn flush(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.drain()?;
        if let Some(sink) = self.shared.sink.lock().as_mut() {
            sink.flush()?;
        }
        Ok(())
    }
}
impl<W: Write + Send + 'static> Drop for BgzfWriter<W> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.finish() {
            log::error!("BgzfWriter: failed to finish stream on drop: {e}");
        }
    }
}

struct WriterConfig {
    level: u32,
    buffers: usize,
    chunk_size: usize,
    observer: Option<Box<dyn BlockObserver>>,
}

/// Builder for [`BgzfWriter`]
#[derive(Default)]
pub struct BgzfWriterBuilder {
    level: Option<u32>,
    threads: Option<usize>,
    buffers: Option<usize>,
    chunk_size: Option<usize>,
    observer: Option<Box<dyn BlockObserver>>,
    pool: Option<Arc<WorkerPool>>,
}
impl BgzfWriterBuilder {
    /// Sets the deflate level
    ///
    /// # Parameters
    ///
    /// * `level` - 0 (stored) to 9 (best), defaults to 6
    #[must_use]
    pub fn level(mut self, level: u32) -> Self {
        self.level = Some(level);
        self
    }

    /// Sets the number of worker threads (0 selects the default)
    ///
    /// Ignored when a pool is supplied with [`pool`](Self::pool).
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Sets the number of buffer slots, defaults to four per worker thread
    #[must_use]
    pub fn buffers(mut self, buffers: usize) -> Self {
        self.buffers = Some(buffers);
        self
    }

    /// Sets the number of raw bytes gathered into each chunk
    ///
    /// Chunks that do not deflate into a single block are split in two, so any
    /// size up to the block payload limit (65510) is accepted. Defaults to 64512.
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Reports the sizes of every written data block to `observer`
    #[must_use]
    pub fn observer<O: BlockObserver + 'static>(mut self, observer: O) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Runs the writer on an existing pool instead of spawning one
    #[must_use]
    pub fn pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Starts a BGZF stream on `inner`
    ///
    /// # Errors
    ///
    /// * `ConfigError` - If the level, chunk size or buffer count is out of range
    /// * `PipelineError::Aborted` - If the supplied pool was terminated
    /// * `IoError` - If the worker threads could not be spawned
    pub fn build<W: Write + Send + 'static>(self, inner: W) -> Result<BgzfWriter<W>> {
        let level = self.level.unwrap_or(DEFAULT_LEVEL);
        if level > 9 {
            return Err(ConfigError::InvalidLevel(level).into());
        }
        let chunk_size = self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 || chunk_size > MAX_BLOCK_PAYLOAD {
            return Err(ConfigError::InvalidChunkSize(chunk_size, MAX_BLOCK_PAYLOAD).into());
        }
        if self.buffers == Some(0) {
            return Err(ConfigError::NoBuffers.into());
        }

        let pool = match self.pool {
            Some(pool) => pool,
            None => WorkerPool::new(self.threads.unwrap_or(0))?,
        };
        let buffers = self
            .buffers
            .unwrap_or(BUFFERS_PER_THREAD * pool.threads().max(1));

        BgzfWriter::new(
            inner,
            pool,
            WriterConfig {
                level,
                buffers,
                chunk_size,
                observer: self.observer,
            },
        )
    }
}
