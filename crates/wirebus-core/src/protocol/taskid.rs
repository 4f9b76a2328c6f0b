//! Thread-safe counter for minting correlation task ids.
//!
//! Every request frame carries a `task_id` minted by the sender; acks and
//! query answers echo it back so the response can be paired with the request
//! that caused it. Uniqueness within one sender process is all that is
//! required; the counter never coordinates across processes.

use std::sync::atomic::{AtomicU32, Ordering};

/// A monotonically increasing task id source.
///
/// Ids start at 1 and increment by 1 with each call to [`next`](Self::next),
/// wrapping at `u32::MAX` without panicking.
///
/// # Examples
///
/// ```rust
/// use wirebus_core::protocol::TaskIdCounter;
///
/// let counter = TaskIdCounter::new();
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// ```
pub struct TaskIdCounter {
    inner: AtomicU32,
}

impl TaskIdCounter {
    /// Creates a counter whose first id is 1.
    pub fn new() -> Self {
        Self {
            inner: AtomicU32::new(1),
        }
    }

    /// Returns the next task id.
    ///
    /// `Ordering::Relaxed` suffices: ids only need to be distinct, they never
    /// synchronize memory between threads.
    pub fn next(&self) -> u32 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the id the next call to [`next`](Self::next) would produce.
    /// Diagnostic use only; another thread may claim it first.
    pub fn peek(&self) -> u32 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for TaskIdCounter {
    fn default() -> Self {
        Self::new()
    }
}
