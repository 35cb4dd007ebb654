//! # Work Queues
//!
//! Blocking queues used to coordinate the worker pool and the engines:
//!
//! * [`TerminatableQueue`] - FIFO queue whose blocked consumers can be released by
//!   [`terminate`](Terminatable::terminate).
//! * [`TerminatableHeap`] - Same contract, but pops the minimum element by `Ord`.
//! * [`ConsecutiveReleaseQueue`] - Accepts sequence-tagged items in any order and
//!   releases them strictly in sequence order, without gaps.
//!
//! All queues are built on a `parking_lot` mutex and condition variable. Once a queue
//! is terminated its remaining items can still be drained, after which dequeues fail
//! with [`Terminated`] instead of blocking.

mod consecutive;
mod terminatable;

pub use consecutive::{ConsecutiveReleaseQueue, Sequenced};
pub use terminatable::{Fifo, MinHeap, Store, Terminatable, TerminatableHeap, TerminatableQueue};

/// Signal returned by a dequeue on a terminated, empty queue
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Queue has been terminated")]
pub struct Terminated;
