//! # Shared Worker Pool
//!
//! A fixed set of OS threads servicing one prioritized task heap. Engines never own
//! threads directly; they register themselves as a [`Stage`] and submit tasks tagged
//! with an [`Operation`], a sequence number and a buffer slot. Several engines may
//! share a single pool (see [`crate::BgzfTranscoder`]).
//!
//! Tasks are popped smallest-first by `(operation, sequence, slot)`, so work that
//! completes a block (writing it out) always runs before work that brings new data
//! into memory (reading the next block). This bounds the number of buffers held by
//! the pipeline.

use std::cmp::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::error::Result;
use crate::queue::TerminatableHeap;

/// Kind of work carried by a task, in descending priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    /// Write a compressed block to the sink
    Write,
    /// Compress a filled raw buffer
    Compress,
    /// Inflate a raw block
    Decompress,
    /// Read the next raw block from the source
    Read,
}

/// An engine whose tasks are executed by the pool
pub(crate) trait Stage: Send + Sync {
    /// Executes one task on a worker thread
    fn run(self: Arc<Self>, op: Operation, slot: usize, seq: u64);

    /// Called once when the pool is terminated, so blocked callers can be released
    fn abort(&self);
}

pub(crate) struct Task {
    op: Operation,
    seq: u64,
    slot: usize,
    stage: Arc<dyn Stage>,
}
impl Task {
    fn key(&self) -> (Operation, u64, usize) {
        (self.op, self.seq, self.slot)
    }
}
impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for Task {}
impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Task {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
struct PoolShared {
    tasks: TerminatableHeap<Task>,
    stages: Mutex<Vec<Weak<dyn Stage>>>,
}
impl PoolShared {
    fn work(&self) {
        while let Ok(task) = self.tasks.dequeue() {
            let Task {
                op,
                seq,
                slot,
                stage,
            } = task;
            stage.run(op, slot, seq);
        }
    }

    fn terminate(&self) {
        if self.tasks.is_terminated() {
            return;
        }
        let discarded = self.tasks.terminate_and_drain();
        log::debug!("worker pool terminated, discarding {} tasks", discarded.len());
        drop(discarded);

        let stages: Vec<Arc<dyn Stage>> =
            self.stages.lock().iter().filter_map(Weak::upgrade).collect();
        for stage in stages {
            stage.abort();
        }
    }
}

/// Handle engines use to submit work to their pool
#[derive(Clone)]
pub(crate) struct Scheduler {
    shared: Arc<PoolShared>,
}
impl Scheduler {
    pub(crate) fn submit(&self, op: Operation, seq: u64, slot: usize, stage: Arc<dyn Stage>) {
        self.shared.tasks.enqueue(Task {
            op,
            seq,
            slot,
            stage,
        });
    }

    /// Terminates the whole pool, aborting every registered engine
    pub(crate) fn terminate(&self) {
        self.shared.terminate();
    }
}

/// Buffer slots allocated per worker thread when an engine sets no buffer count
pub const BUFFERS_PER_THREAD: usize = 4;

/// Number of worker threads used when none is configured
#[must_use]
pub fn default_threads() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

/// A fixed pool of worker threads shared by one or more engines
///
/// The threads are stopped and joined when the last handle is dropped.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
}
impl WorkerPool {
    /// Spawns a pool of `threads` workers (0 selects [`default_threads`])
    ///
    /// # Errors
    ///
    /// * `IoError` - If the operating system refuses to spawn a thread
    pub fn new(threads: usize) -> Result<Arc<Self>> {
        let threads = if threads == 0 {
            default_threads()
        } else {
            threads
        };

        let shared = Arc::new(PoolShared::default());
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let worker = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("parbgzf-worker-{i}"))
                .spawn(move || worker.work());
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    shared.terminate();
                    return Err(e.into());
                }
            }
        }
        log::debug!("started worker pool with {threads} threads");

        Ok(Arc::new(Self { shared, handles }))
    }

    /// Number of worker threads
    #[must_use]
    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Stops the pool: pending tasks are discarded and every engine using it is aborted
    ///
    /// Tasks already running are allowed to complete.
    pub fn terminate(&self) {
        self.shared.terminate();
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.tasks.is_terminated()
    }

    pub(crate) fn scheduler(&self) -> Scheduler {
        Scheduler {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Registers an engine so it is aborted when the pool terminates
    pub(crate) fn register(&self, stage: Weak<dyn Stage>) {
        let mut stages = self.shared.stages.lock();
        stages.retain(|s| s.strong_count() > 0);
        stages.push(stage);
    }
}
impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.tasks.terminate();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("a parbgzf worker thread panicked");
            }
        }
        // Tasks submitted while the workers wound down
        drop(self.shared.tasks.terminate_and_drain());
        log::debug!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::{mpsc, Barrier};

    struct Recorder {
        gate: Barrier,
        done: Mutex<mpsc::Sender<(Operation, u64)>>,
        aborted: AtomicBool,
    }
    impl Stage for Recorder {
        fn run(self: Arc<Self>, op: Operation, _slot: usize, seq: u64) {
            if op == Operation::Write && seq == 0 {
                self.gate.wait();
            }
            self.done.lock().send((op, seq)).unwrap();
        }
        fn abort(&self) {
            self.aborted.store(true, AtomicOrdering::SeqCst);
        }
    }

    fn recorder() -> (Arc<Recorder>, mpsc::Receiver<(Operation, u64)>) {
        let (tx, rx) = mpsc::channel();
        let stage = Arc::new(Recorder {
            gate: Barrier::new(2),
            done: Mutex::new(tx),
            aborted: AtomicBool::new(false),
        });
        (stage, rx)
    }

    #[test]
    fn test_operation_priority() {
        assert!(Operation::Write < Operation::Compress);
        assert!(Operation::Compress < Operation::Decompress);
        assert!(Operation::Decompress < Operation::Read);
    }

    #[test]
    fn test_tasks_run_by_priority() -> anyhow::Result<()> {
        let pool = WorkerPool::new(1)?;
        let scheduler = pool.scheduler();
        let (stage, rx) = recorder();

        // The single worker parks on the gate while the heap fills up
        scheduler.submit(Operation::Write, 0, 0, stage.clone());
        for (op, seq) in [
            (Operation::Read, 1),
            (Operation::Compress, 5),
            (Operation::Write, 3),
            (Operation::Decompress, 2),
            (Operation::Compress, 4),
        ] {
            scheduler.submit(op, seq, 0, stage.clone());
        }
        stage.gate.wait();

        let order: Vec<_> = (0..6).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(
            order,
            vec![
                (Operation::Write, 0),
                (Operation::Write, 3),
                (Operation::Compress, 4),
                (Operation::Compress, 5),
                (Operation::Decompress, 2),
                (Operation::Read, 1),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_terminate_aborts_registered_stages() -> anyhow::Result<()> {
        let pool = WorkerPool::new(2)?;
        let (stage, _rx) = recorder();
        let weak: Weak<dyn Stage> = Arc::downgrade(&(stage.clone() as Arc<dyn Stage>));
        pool.register(weak);

        assert!(!pool.is_terminated());
        pool.terminate();
        pool.terminate();
        assert!(pool.is_terminated());
        assert!(stage.aborted.load(AtomicOrdering::SeqCst));
        Ok(())
    }

    #[test]
    fn test_default_threads() -> anyhow::Result<()> {
        assert!(default_threads() >= 1);
        let pool = WorkerPool::new(0)?;
        assert_eq!(pool.threads(), default_threads());
        drop(pool);
        Ok(())
    }
}
