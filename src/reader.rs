//! # Parallel BGZF Reader
//!
//! [`BgzfReader`] decompresses a BGZF stream on a [`WorkerPool`] and exposes the
//! uncompressed bytes through [`std::io::Read`] and [`std::io::BufRead`].
//!
//! ## Pipeline
//!
//! Every buffer slot cycles through the same states:
//!
//! ```text
//! free ──Read task──▶ raw block ──Decompress task──▶ decoded ──read()──▶ free
//! ```
//!
//! Reads are serialized on the source and assign monotonically increasing block
//! ids. Decompression runs out of order on any worker; decoded slots pass through a
//! [`ConsecutiveReleaseQueue`] so the consumer always receives block ids in
//! ascending order. Each consumed block immediately issues the next read, keeping
//! the pipeline full.
//!
//! The first error (I/O, framing or checksum) is stored on the failing slot and
//! returned by the `read` call that reaches that block. The pool is then terminated
//! and every later call fails with [`PipelineError::Aborted`].

use std::io::{self, BufRead, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::read_block_into;
use crate::codec::{BlockSizes, Decompressor};
use crate::error::{ConfigError, Error, PipelineError, Result};
use crate::header::is_eof_marker;
use crate::index::BlockObserver;
use crate::pool::{Operation, Scheduler, Stage, WorkerPool, BUFFERS_PER_THREAD};
use crate::queue::{ConsecutiveReleaseQueue, Sequenced, TerminatableQueue};

type CopySink = Box<dyn Write + Send>;

/// Called with the block id on the worker thread just before a block is inflated
#[cfg(test)]
type InflateHook = Arc<dyn Fn(u64) + Send + Sync>;

/// The compressed source, owned by whichever worker is reading
struct Source<R> {
    inner: R,
    next_block: u64,
    exhausted: bool,
    copy: Option<CopySink>,
}
impl<R: Read> Source<R> {
    /// Reads one block into `raw`, returning `false` at the end of the stream
    fn read_next(&mut self, raw: &mut Vec<u8>) -> Result<bool> {
        if !read_block_into(&mut self.inner, raw)? {
            log::warn!(
                "BGZF stream ended after {} blocks without an end-of-stream marker",
                self.next_block - 1
            );
            self.finish_copy()?;
            return Ok(false);
        }
        if let Some(copy) = self.copy.as_mut() {
            copy.write_all(raw)?;
        }
        if is_eof_marker(raw) {
            self.finish_copy()?;
            return Ok(false);
        }
        Ok(true)
    }

    fn finish_copy(&mut self) -> Result<()> {
        if let Some(copy) = self.copy.as_mut() {
            copy.flush()?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Slot {
    raw: Vec<u8>,
    data: Vec<u8>,
    decompressor: Decompressor,
    error: Option<Error>,
    block: u64,
}

/// A slot handed to the consumer, in block order
struct Decoded {
    block: u64,
    slot: usize,
    /// Set on the slot that observed the end of the stream
    end: bool,
}
impl Sequenced for Decoded {
    fn sequence(&self) -> u64 {
        self.block
    }
}

struct Shared<R> {
    source: Mutex<Source<R>>,
    /// Slots waiting for the source, served by whichever worker holds it
    reads: TerminatableQueue<usize>,
    slots: Vec<Mutex<Slot>>,
    free: TerminatableQueue<usize>,
    decoded: ConsecutiveReleaseQueue<Decoded>,
    scheduler: Scheduler,
    #[cfg(test)]
    before_inflate: Option<InflateHook>,
}
impl<R: Read + Send + 'static> Shared<R> {
    /// Schedules a read into a free slot, if one is available
    fn issue_read(self: &Arc<Self>) {
        if let Some(slot) = self.free.try_dequeue() {
            self.scheduler
                .submit(Operation::Read, 0, slot, Arc::clone(self) as Arc<dyn Stage>);
        }
    }

    /// Queues `slot` for reading and serves the queue if the source is free
    ///
    /// A worker never waits for the source. If another worker holds it, that worker
    /// picks up the queued slot, and it re-checks the queue after unlocking.
    fn read_blocks(self: &Arc<Self>, slot: usize) {
        self.reads.enqueue(slot);
        loop {
            let Some(mut source) = self.source.try_lock() else {
                return;
            };
            while let Some(slot) = self.reads.try_dequeue() {
                self.read_block(&mut source, slot);
            }
            drop(source);
            if self.reads.is_empty() {
                return;
            }
        }
    }

    fn read_block(self: &Arc<Self>, source: &mut Source<R>, slot: usize) {
        if source.exhausted {
            self.free.enqueue(slot);
            return;
        }

        let block = source.next_block;
        source.next_block += 1;

        let mut guard = self.slots[slot].lock();
        guard.block = block;
        let outcome = source.read_next(&mut guard.raw);
        if !matches!(outcome, Ok(true)) {
            source.exhausted = true;
        }

        match outcome {
            Ok(true) => {
                log::trace!("read block {block} ({} bytes)", guard.raw.len());
                drop(guard);
                self.scheduler
                    .submit(Operation::Decompress, block, slot, Arc::clone(self) as Arc<dyn Stage>);
            }
            Ok(false) => {
                drop(guard);
                self.release(Decoded {
                    block,
                    slot,
                    end: true,
                });
            }
            Err(e) => {
                guard.error = Some(e);
                drop(guard);
                self.release(Decoded {
                    block,
                    slot,
                    end: true,
                });
            }
        }
    }

    fn decompress_block(&self, slot: usize) {
        let mut guard = self.slots[slot].lock();
        #[cfg(test)]
        if let Some(hook) = &self.before_inflate {
            hook(guard.block);
        }
        let Slot {
            raw,
            data,
            decompressor,
            error,
            block,
        } = &mut *guard;
        if let Err(e) = decompressor.decompress(raw, data) {
            *error = Some(e);
        }
        let block = *block;
        drop(guard);

        self.release(Decoded {
            block,
            slot,
            end: false,
        });
    }

    fn release(&self, decoded: Decoded) {
        if let Err(rejected) = self.decoded.enqueue(decoded) {
            self.free.enqueue(rejected.slot);
        }
    }
}
impl<R: Read + Send + 'static> Stage for Shared<R> {
    fn run(self: Arc<Self>, op: Operation, slot: usize, _seq: u64) {
        match op {
            Operation::Read => self.read_blocks(slot),
            Operation::Decompress => self.decompress_block(slot),
            Operation::Compress | Operation::Write => {
                unreachable!("reader scheduled a {op:?} task")
            }
        }
    }

    fn abort(&self) {
        self.free.terminate();
        drop(self.reads.terminate_and_drain());
        drop(self.decoded.terminate());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Running,
    Finished,
    Failed,
}

/// Multi-threaded BGZF decompressor
///
/// # Example
///
/// ```rust,no_run
/// use std::io::Read;
/// use parbgzf::BgzfReaderBuilder;
///
/// let file = std::fs::File::open("data.gz").unwrap();
/// let mut reader = BgzfReaderBuilder::default().threads(4).build(file).unwrap();
/// let mut text = String::new();
/// reader.read_to_string(&mut text).unwrap();
/// ```
pub struct BgzfReader<R: Read + Send + 'static> {
    shared: Arc<Shared<R>>,
    pool: Arc<WorkerPool>,
    observer: Option<Box<dyn BlockObserver>>,
    /// Uncompressed bytes of the current block
    data: Vec<u8>,
    pos: usize,
    next_block: u64,
    state: State,
}
impl<R: Read + Send + 'static> BgzfReader<R> {
    fn new(inner: R, pool: Arc<WorkerPool>, config: ReaderConfig) -> Result<Self> {
        let ReaderConfig {
            buffers,
            copy,
            observer,
            #[cfg(test)]
            before_inflate,
        } = config;
        if buffers == 0 {
            return Err(ConfigError::NoBuffers.into());
        }
        if pool.is_terminated() {
            return Err(PipelineError::Aborted.into());
        }

        let free = TerminatableQueue::new();
        (0..buffers).for_each(|slot| free.enqueue(slot));
        let shared = Arc::new(Shared {
            source: Mutex::new(Source {
                inner,
                next_block: 0,
                exhausted: false,
                copy,
            }),
            reads: TerminatableQueue::new(),
            slots: (0..buffers).map(|_| Mutex::new(Slot::default())).collect(),
            free,
            decoded: ConsecutiveReleaseQueue::new(),
            scheduler: pool.scheduler(),
            #[cfg(test)]
            before_inflate,
        });
        let stage: Arc<dyn Stage> = shared.clone();
        pool.register(Arc::downgrade(&stage));

        for _ in 0..buffers {
            shared.issue_read();
        }

        Ok(Self {
            shared,
            pool,
            observer,
            data: Vec::new(),
            pos: 0,
            next_block: 0,
            state: State::Running,
        })
    }

    /// The pool running this reader
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Number of data blocks delivered so far
    #[must_use]
    pub fn blocks_read(&self) -> u64 {
        self.next_block
    }

    /// Makes the next decoded block current, returning `false` at the end of the stream
    fn fill(&mut self) -> Result<bool> {
        while self.pos >= self.data.len() {
            match self.state {
                State::Running => {}
                State::Finished => return Ok(false),
                State::Failed => return Err(PipelineError::Aborted.into()),
            }

            let Ok(decoded) = self.shared.decoded.dequeue() else {
                self.state = State::Failed;
                return Err(PipelineError::Aborted.into());
            };
            debug_assert_eq!(decoded.block, self.next_block, "decoded block out of order");

            let mut slot = self.shared.slots[decoded.slot].lock();
            if let Some(err) = slot.error.take() {
                drop(slot);
                log::debug!("aborting reader at block {}: {err}", decoded.block);
                self.state = State::Failed;
                self.shared.scheduler.terminate();
                return Err(err);
            }
            if decoded.end {
                drop(slot);
                self.shared.free.enqueue(decoded.slot);
                self.state = State::Finished;
                log::debug!("finished reading {} blocks", self.next_block);
                return Ok(false);
            }

            std::mem::swap(&mut self.data, &mut slot.data);
            let sizes = BlockSizes {
                compressed: slot.raw.len(),
                uncompressed: self.data.len(),
            };
            drop(slot);

            self.pos = 0;
            self.next_block += 1;
            self.shared.free.enqueue(decoded.slot);
            self.shared.issue_read();
            if let Some(observer) = &self.observer {
                observer.on_block(sizes);
            }
        }
        Ok(true)
    }

    /// Unconsumed bytes of the current block, empty at the end of the stream
    pub(crate) fn buffered(&mut self) -> Result<&[u8]> {
        if self.fill()? {
            Ok(&self.data[self.pos..])
        } else {
            Ok(&[])
        }
    }
}
impl<R: Read + Send + 'static> Read for BgzfReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}
impl<R: Read + Send + 'static> BufRead for BgzfReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        Ok(self.buffered()?)
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.data.len());
    }
}
impl<R: Read + Send + 'static> Drop for BgzfReader<R> {
    fn drop(&mut self) {
        // Stop reading ahead; in-flight blocks drain on their own
        self.shared.source.lock().exhausted = true;
    }
}

struct ReaderConfig {
    buffers: usize,
    copy: Option<CopySink>,
    observer: Option<Box<dyn BlockObserver>>,
    #[cfg(test)]
    before_inflate: Option<InflateHook>,
}

/// Builder for [`BgzfReader`]
#[derive(Default)]
pub struct BgzfReaderBuilder {
    threads: Option<usize>,
    buffers: Option<usize>,
    copy_to: Option<CopySink>,
    observer: Option<Box<dyn BlockObserver>>,
    pool: Option<Arc<WorkerPool>>,
    #[cfg(test)]
    before_inflate: Option<InflateHook>,
}
impl BgzfReaderBuilder {
    /// Sets the number of worker threads (0 selects the default)
    ///
    /// Ignored when a pool is supplied with [`pool`](Self::pool).
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Sets the number of buffer slots
    ///
    /// Defaults to four slots per worker thread. This bounds how many blocks are
    /// held in memory at once.
    #[must_use]
    pub fn buffers(mut self, buffers: usize) -> Self {
        self.buffers = Some(buffers);
        self
    }

    /// Copies every raw compressed block to `sink` as it is read
    ///
    /// The sink receives the stream verbatim, up to and including the end-of-stream
    /// marker, and is flushed when the end of the stream is reached.
    #[must_use]
    pub fn copy_to<W: Write + Send + 'static>(mut self, sink: W) -> Self {
        self.copy_to = Some(Box::new(sink));
        self
    }

    /// Reports the sizes of every decoded data block to `observer`
    #[must_use]
    pub fn observer<O: BlockObserver + 'static>(mut self, observer: O) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Runs the reader on an existing pool instead of spawning one
    #[must_use]
    pub fn pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    #[cfg(test)]
    fn before_inflate(mut self, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.before_inflate = Some(Arc::new(hook));
        self
    }

    /// Starts decompressing `inner`
    ///
    /// # Errors
    ///
    /// * `ConfigError::NoBuffers` - If zero buffers were requested
    /// * `PipelineError::Aborted` - If the supplied pool was terminated
    /// * `IoError` - If the worker threads could not be spawned
    pub fn build<R: Read + Send + 'static>(self, inner: R) -> Result<BgzfReader<R>> {
        let pool = match self.pool {
            Some(pool) => pool,
            None => WorkerPool::new(self.threads.unwrap_or(0))?,
        };
        let buffers = self
            .buffers
            .unwrap_or(BUFFERS_PER_THREAD * pool.threads().max(1));
        let config = ReaderConfig {
            buffers,
            copy: self.copy_to,
            observer: self.observer,
            #[cfg(test)]
            before_inflate: self.before_inflate,
        };
        BgzfReader::new(inner, pool, config)
    }
}
