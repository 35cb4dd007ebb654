use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

use parking_lot::{Condvar, Mutex};

use super::Terminated;

/// Backing storage of a [`Terminatable`] queue
///
/// The store decides which element a dequeue returns.
pub trait Store: Default {
    type Item;

    fn push(&mut self, item: Self::Item);
    fn pop(&mut self) -> Option<Self::Item>;
    fn len(&self) -> usize;
    fn drain_all(&mut self) -> Vec<Self::Item>;
}

/// First-in first-out storage
pub struct Fifo<T>(VecDeque<T>);
impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self(VecDeque::new())
    }
}
impl<T> Store for Fifo<T> {
    type Item = T;

    fn push(&mut self, item: T) {
        self.0.push_back(item);
    }
    fn pop(&mut self) -> Option<T> {
        self.0.pop_front()
    }
    fn len(&self) -> usize {
        self.0.len()
    }
    fn drain_all(&mut self) -> Vec<T> {
        self.0.drain(..).collect()
    }
}

/// Storage that always yields its smallest element
pub struct MinHeap<T: Ord>(BinaryHeap<Reverse<T>>);
impl<T: Ord> Default for MinHeap<T> {
    fn default() -> Self {
        Self(BinaryHeap::new())
    }
}
impl<T: Ord> Store for MinHeap<T> {
    type Item = T;

    fn push(&mut self, item: T) {
        self.0.push(Reverse(item));
    }
    fn pop(&mut self) -> Option<T> {
        self.0.pop().map(|Reverse(item)| item)
    }
    fn len(&self) -> usize {
        self.0.len()
    }
    fn drain_all(&mut self) -> Vec<T> {
        self.0.drain().map(|Reverse(item)| item).collect()
    }
}

/// FIFO blocking queue with a termination signal
pub type TerminatableQueue<T> = Terminatable<Fifo<T>>;

/// Min-ordered blocking queue with a termination signal
pub type TerminatableHeap<T> = Terminatable<MinHeap<T>>;

struct State<S> {
    items: S,
    terminated: bool,
}

/// Blocking queue whose waiting consumers can be released by [`terminate`](Self::terminate)
pub struct Terminatable<S: Store> {
    state: Mutex<State<S>>,
    available: Condvar,
}
impl<S: Store> Default for Terminatable<S> {
    fn default() -> Self {
        Self::new()
    }
}
impl<S: Store> Terminatable<S> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: S::default(),
                terminated: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Adds an item and wakes one waiting consumer
    ///
    /// Items enqueued after termination are still stored and can be drained.
    pub fn enqueue(&self, item: S::Item) {
        self.state.lock().items.push(item);
        self.available.notify_one();
    }

    /// Removes the next item, blocking until one is available
    ///
    /// Fails with [`Terminated`] once the queue is both terminated and empty.
    pub fn dequeue(&self) -> Result<S::Item, Terminated> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop() {
                return Ok(item);
            }
            if state.terminated {
                return Err(Terminated);
            }
            self.available.wait(&mut state);
        }
    }

    /// Removes the next item if one is immediately available
    pub fn try_dequeue(&self) -> Option<S::Item> {
        self.state.lock().items.pop()
    }

    /// Marks the queue terminated and wakes every waiting consumer
    ///
    /// Calling this more than once has no further effect.
    pub fn terminate(&self) {
        self.state.lock().terminated = true;
        self.available.notify_all();
    }

    /// Terminates the queue and hands back every item still stored
    pub fn terminate_and_drain(&self) -> Vec<S::Item> {
        let drained = {
            let mut state = self.state.lock();
            state.terminated = true;
            state.items.drain_all()
        };
        self.available.notify_all();
        drained
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = TerminatableQueue::new();
        for i in 0..5 {
            queue.enqueue(i);
        }
        let out: Vec<_> = (0..5).map(|_| queue.dequeue().unwrap()).collect();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
        assert!(queue.try_dequeue().is_none());
    }

    #[test]
    fn test_heap_pops_minimum() {
        let heap = TerminatableHeap::new();
        for i in [5, 1, 4, 2, 3] {
            heap.enqueue(i);
        }
        let out: Vec<_> = (0..5).map(|_| heap.dequeue().unwrap()).collect();
        assert_eq!(out, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_terminate_drains_then_fails() {
        let queue = TerminatableQueue::new();
        queue.enqueue("a");
        queue.terminate();
        queue.terminate();
        assert!(queue.is_terminated());
        assert_eq!(queue.dequeue(), Ok("a"));
        assert_eq!(queue.dequeue(), Err(Terminated));
    }

    #[test]
    fn test_terminate_wakes_blocked_consumers() {
        let queue: Arc<TerminatableQueue<u32>> = Arc::new(TerminatableQueue::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.dequeue())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        queue.terminate();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Err(Terminated));
        }
    }

    #[test]
    fn test_terminate_and_drain() {
        let heap = TerminatableHeap::new();
        heap.enqueue(3);
        heap.enqueue(1);
        let mut drained = heap.terminate_and_drain();
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 3]);
        assert!(heap.is_empty());
        assert_eq!(heap.dequeue(), Err(Terminated));
    }

    #[test]
    fn test_many_producers_many_consumers() {
        let queue: Arc<TerminatableQueue<usize>> = Arc::new(TerminatableQueue::new());
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut sum = 0;
                    while let Ok(x) = queue.dequeue() {
                        sum += x;
                    }
                    sum
                })
            })
            .collect();
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || (0..1000).for_each(|i| queue.enqueue(p * 1000 + i)))
            })
            .collect();
        producers.into_iter().for_each(|h| h.join().unwrap());
        queue.terminate();
        let total: usize = consumers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, (0..4000).sum());
    }
}
