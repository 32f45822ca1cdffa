//! Wait Queue
//!
//! A FIFO queue of blocked threads. Futexes own one each; the scheduler's
//! wake and requeue primitives operate on them.
//!
//! The queue itself never blocks or wakes anything; it is pure bookkeeping.
//! All mutation happens while the global dispatch lock is held, which is
//! what serializes a waiter's enqueue against wakes on the same queue. The
//! inner lock only makes the container safe to share.

use alloc::collections::VecDeque;
use spin::Mutex;

use crate::sched::ThreadId;

/// A queue of waiting threads.
pub struct WaitQueue {
    waiting: Mutex<VecDeque<ThreadId>>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiting: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a thread at the tail.
    pub(crate) fn push(&self, tid: ThreadId) {
        self.waiting.lock().push_back(tid);
    }

    /// Pop the thread that has waited longest.
    pub(crate) fn pop(&self) -> Option<ThreadId> {
        self.waiting.lock().pop_front()
    }

    /// Remove a specific thread. Returns false if it was not queued,
    /// meaning a wake or requeue got to it first.
    pub(crate) fn remove(&self, tid: ThreadId) -> bool {
        let mut waiting = self.waiting.lock();
        if let Some(pos) = waiting.iter().position(|&t| t == tid) {
            waiting.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.lock().is_empty()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let q = WaitQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_remove_absent() {
        let q = WaitQueue::new();
        q.push(7);
        assert!(!q.remove(9));
        assert!(q.remove(7));
        assert!(q.is_empty());
    }
}
