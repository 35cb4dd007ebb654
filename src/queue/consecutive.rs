use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};

use parking_lot::{Condvar, Mutex};

use super::Terminated;

/// Items that carry a position in a gap-free sequence starting at zero
pub trait Sequenced {
    fn sequence(&self) -> u64;
}

/// Heap wrapper ordering items by their sequence number
struct Pending<T>(T);
impl<T: Sequenced> PartialEq for Pending<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.sequence() == other.0.sequence()
    }
}
impl<T: Sequenced> Eq for Pending<T> {}
impl<T: Sequenced> PartialOrd for Pending<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl<T: Sequenced> Ord for Pending<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.sequence().cmp(&other.0.sequence())
    }
}

struct State<T> {
    /// Out-of-order arrivals
    pre: BinaryHeap<Reverse<Pending<T>>>,
    /// Items released in sequence, visible to consumers
    ready: VecDeque<T>,
    /// Next sequence number to release
    next: u64,
    /// Highest sequence number currently admitted, if gated
    bound: Option<u64>,
    terminated: bool,
}
impl<T: Sequenced> State<T> {
    fn promote(&mut self) -> bool {
        let mut promoted = false;
        while let Some(Reverse(Pending(top))) = self.pre.peek() {
            let seq = top.sequence();
            debug_assert!(seq >= self.next, "sequence {seq} enqueued twice");
            if seq != self.next || self.bound.is_some_and(|bound| seq > bound) {
                break;
            }
            if let Some(Reverse(Pending(item))) = self.pre.pop() {
                self.ready.push_back(item);
            }
            self.next += 1;
            promoted = true;
        }
        promoted
    }
}

/// Reorder buffer releasing items strictly in sequence order
///
/// Producers may enqueue in any order; consumers observe sequence numbers
/// `0, 1, 2, ...` with no gaps. An optional admission bound set through
/// [`set_ready_for`](Self::set_ready_for) holds back items beyond a watermark.
pub struct ConsecutiveReleaseQueue<T> {
    state: Mutex<State<T>>,
    available: Condvar,
}
impl<T: Sequenced> Default for ConsecutiveReleaseQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
impl<T: Sequenced> ConsecutiveReleaseQueue<T> {
    /// Creates a queue expecting sequence number zero first
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                pre: BinaryHeap::new(),
                ready: VecDeque::new(),
                next: 0,
                bound: None,
                terminated: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Adds an item and releases every item that is now consecutive
    ///
    /// Hands the item back if the queue has been terminated.
    pub fn enqueue(&self, item: T) -> Result<(), T> {
        let promoted = {
            let mut state = self.state.lock();
            if state.terminated {
                return Err(item);
            }
            state.pre.push(Reverse(Pending(item)));
            state.promote()
        };
        if promoted {
            self.available.notify_all();
        }
        Ok(())
    }

    /// Only releases items whose sequence number is at most `bound`
    pub fn set_ready_for(&self, bound: u64) {
        let promoted = {
            let mut state = self.state.lock();
            state.bound = Some(bound);
            state.promote()
        };
        if promoted {
            self.available.notify_all();
        }
    }

    /// Removes the next released item, blocking until it is available
    pub fn dequeue(&self) -> Result<T, Terminated> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Ok(item);
            }
            if state.terminated {
                return Err(Terminated);
            }
            self.available.wait(&mut state);
        }
    }

    /// Removes the next released item if one is immediately available
    pub fn try_dequeue(&self) -> Option<T> {
        self.state.lock().ready.pop_front()
    }

    /// Terminates the queue, returning every item it still holds
    ///
    /// Blocked consumers are woken and fail with [`Terminated`].
    pub fn terminate(&self) -> Vec<T> {
        let drained = {
            let mut state = self.state.lock();
            state.terminated = true;
            let mut drained: Vec<T> = state.ready.drain(..).collect();
            drained.extend(state.pre.drain().map(|Reverse(Pending(item))| item));
            drained
        };
        self.available.notify_all();
        drained
    }

    /// Returns true if an item is released and waiting for a consumer
    pub fn has_released(&self) -> bool {
        !self.state.lock().ready.is_empty()
    }

    /// Sequence number of the next item to be released
    pub fn next_expected(&self) -> u64 {
        self.state.lock().next
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// Number of held items, released or not
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.pre.len() + state.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
