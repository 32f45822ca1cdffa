//! Scheduling core consumed by the futex and clone paths
//!
//! This module owns the one lock that matters: the global dispatch lock.
//! Any sequence that inspects state and then blocks, wakes, requeues or
//! resumes a thread runs to completion with the lock held, so a wake can
//! never slip between a waiter's check and its enqueue.
//!
//! Threads are tracked in a registry keyed by `ThreadId`: lifecycle state,
//! a per-thread parker the blocking primitives spin on, and a backpointer
//! to the wait queue currently holding the thread (a requeue retargets the
//! backpointer, which is how a timed-out waiter finds itself after being
//! moved). Run-queue selection and context switching are the platform's
//! business; a blocked thread here simply parks until some primitive flips
//! its parker.
//!
//! All futex and clone state across all tasks serializes through this one
//! lock. That is a scalability ceiling, not a correctness problem.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::sync::WaitQueue;

pub type ThreadId = u64;

/// Thread lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, not yet released to the scheduler.
    Creating,
    /// Runnable.
    Ready,
    /// Currently executing.
    Running,
    /// Parked on a wait queue (futex wait).
    Blocked,
    /// Taken out of scheduling until an explicit resume (vfork parent).
    Suspended,
    /// Gone; the registry entry remains until the task is torn down.
    Exited,
}

impl ThreadState {
    pub fn is_schedulable(self) -> bool {
        matches!(self, Self::Ready | Self::Running)
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "Creating"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::Blocked => write!(f, "Blocked"),
            Self::Suspended => write!(f, "Suspended"),
            Self::Exited => write!(f, "Exited"),
        }
    }
}

/// Outcome of a bounded sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Woken,
    TimedOut,
    Interrupted,
}

const PK_PARKED: u32 = 0;
const PK_WOKEN: u32 = 1;
const PK_INTERRUPTED: u32 = 2;

/// Per-thread park flag. First wake wins; a reset arms it again.
struct Parker {
    state: AtomicU32,
}

impl Parker {
    const fn new() -> Self {
        Self {
            state: AtomicU32::new(PK_PARKED),
        }
    }

    fn reset(&self) {
        self.state.store(PK_PARKED, Ordering::SeqCst);
    }

    fn wake(&self, reason: u32) {
        let _ = self
            .state
            .compare_exchange(PK_PARKED, reason, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn poll(&self) -> u32 {
        self.state.load(Ordering::SeqCst)
    }
}

struct SchedEntry {
    state: ThreadState,
    parker: Arc<Parker>,
    /// Queue currently holding this thread, if blocked. Requeue updates it.
    waiting_on: Option<Arc<WaitQueue>>,
}

/// Registry behind the dispatch lock.
pub struct SchedState {
    threads: BTreeMap<ThreadId, SchedEntry>,
}

static SCHEDULER: Mutex<SchedState> = Mutex::new(SchedState {
    threads: BTreeMap::new(),
});

/// Guard over the global dispatch lock.
pub type SchedGuard = spin::MutexGuard<'static, SchedState>;

/// Take the global dispatch lock.
pub fn lock() -> SchedGuard {
    SCHEDULER.lock()
}

/// Snapshot of a thread's state, for callers outside the locked paths.
pub fn thread_state(tid: ThreadId) -> Option<ThreadState> {
    lock().threads.get(&tid).map(|e| e.state)
}

impl SchedState {
    /// Add a thread to the registry. It stays `Creating` until resumed.
    pub fn register_thread(&mut self, tid: ThreadId) {
        self.threads.insert(
            tid,
            SchedEntry {
                state: ThreadState::Creating,
                parker: Arc::new(Parker::new()),
                waiting_on: None,
            },
        );
    }

    pub fn set_running(&mut self, tid: ThreadId) {
        if let Some(e) = self.threads.get_mut(&tid) {
            e.state = ThreadState::Running;
        }
    }

    /// Release a created thread, or reactivate a suspended one.
    pub fn resume(&mut self, tid: ThreadId) {
        if let Some(e) = self.threads.get_mut(&tid) {
            match e.state {
                ThreadState::Creating | ThreadState::Suspended => {
                    e.state = ThreadState::Ready;
                    e.parker.wake(PK_WOKEN);
                }
                _ => {}
            }
        }
    }

    /// Take a thread out of scheduling until `resume`. The caller keeps
    /// executing until it parks; the re-armed parker is what actually
    /// holds it.
    pub fn suspend(&mut self, tid: ThreadId) {
        if let Some(e) = self.threads.get_mut(&tid) {
            e.state = ThreadState::Suspended;
            e.parker.reset();
        }
    }

    /// Deliver a signal to a blocked thread: dequeue it and let its sleep
    /// return `Interrupted`. No effect on threads that are not blocked.
    pub fn interrupt(&mut self, tid: ThreadId) {
        if let Some(e) = self.threads.get_mut(&tid) {
            if e.state == ThreadState::Blocked {
                if let Some(q) = e.waiting_on.take() {
                    q.remove(tid);
                }
                e.state = ThreadState::Ready;
                e.parker.wake(PK_INTERRUPTED);
            }
        }
    }

    /// Wake the longest-waiting thread on `q`. Entries for threads that
    /// exited while queued are skipped. Returns whether one was woken.
    pub fn wake_one(&mut self, q: &Arc<WaitQueue>) -> bool {
        while let Some(tid) = q.pop() {
            if let Some(e) = self.threads.get_mut(&tid) {
                if e.state == ThreadState::Blocked {
                    e.waiting_on = None;
                    e.state = ThreadState::Ready;
                    e.parker.wake(PK_WOKEN);
                    return true;
                }
            }
        }
        false
    }

    /// Wake every thread on `q`; returns how many.
    pub fn wake_all(&mut self, q: &Arc<WaitQueue>) -> usize {
        let mut woken = 0;
        while self.wake_one(q) {
            woken += 1;
        }
        woken
    }

    /// Move one thread from `src` to `dst` without waking it. The thread
    /// stays blocked, now associated with `dst`.
    pub fn requeue(&mut self, src: &Arc<WaitQueue>, dst: &Arc<WaitQueue>) -> bool {
        while let Some(tid) = src.pop() {
            if let Some(e) = self.threads.get_mut(&tid) {
                if e.state == ThreadState::Blocked {
                    e.waiting_on = Some(dst.clone());
                    dst.push(tid);
                    return true;
                }
            }
        }
        false
    }

    /// Mark a thread gone, dropping any queue entry it still holds.
    pub fn mark_exited(&mut self, tid: ThreadId) {
        if let Some(e) = self.threads.get_mut(&tid) {
            if let Some(q) = e.waiting_on.take() {
                q.remove(tid);
            }
            e.state = ThreadState::Exited;
            // A parked sleeper must not hang forever on a dead entry.
            e.parker.wake(PK_WOKEN);
        }
    }

    /// Drop a registry entry entirely (task teardown).
    pub fn unregister_thread(&mut self, tid: ThreadId) {
        self.mark_exited(tid);
        self.threads.remove(&tid);
    }
}

/// Block the calling thread on `q`, releasing the dispatch lock.
///
/// The enqueue happens before the guard is dropped; a concurrent waker must
/// take the lock first and therefore always sees the waiter. `timeout_ns`
/// of `None` or zero means unbounded.
///
/// On return the thread may have been requeued: it is not necessarily
/// associated with the queue it joined, and callers must not assume so.
pub fn sleep_on(
    mut guard: SchedGuard,
    tid: ThreadId,
    q: &Arc<WaitQueue>,
    timeout_ns: Option<u64>,
) -> WaitResult {
    let parker = match guard.threads.get_mut(&tid) {
        Some(e) => {
            e.state = ThreadState::Blocked;
            e.parker.reset();
            e.waiting_on = Some(q.clone());
            e.parker.clone()
        }
        // Unknown thread: nothing to block.
        None => return WaitResult::Woken,
    };
    q.push(tid);

    let deadline = timeout_ns
        .filter(|ns| *ns > 0)
        .map(|ns| clock::now_ns().saturating_add(ns));

    drop(guard);

    let result = loop {
        match parker.poll() {
            PK_WOKEN => break WaitResult::Woken,
            PK_INTERRUPTED => break WaitResult::Interrupted,
            _ => {}
        }

        if let Some(d) = deadline {
            if clock::now_ns() >= d {
                // Expiry races against wake and requeue; decide under the
                // lock. If a waker already popped us, the wake wins.
                let mut s = lock();
                match parker.poll() {
                    PK_WOKEN => break WaitResult::Woken,
                    PK_INTERRUPTED => break WaitResult::Interrupted,
                    _ => {
                        if let Some(e) = s.threads.get_mut(&tid) {
                            if let Some(held_by) = e.waiting_on.take() {
                                held_by.remove(tid);
                            }
                        }
                        break WaitResult::TimedOut;
                    }
                }
            }
        }

        core::hint::spin_loop();
    };

    let mut s = lock();
    s.set_running(tid);
    drop(s);

    result
}

/// Park the calling thread until `resume`. Used by the vfork path: the
/// parent suspends itself under the lock, drops it, then parks here until
/// the child's exec or exit releases it. Signals do not cut this short.
pub fn park_current(tid: ThreadId) {
    let parker = {
        let s = lock();
        match s.threads.get(&tid) {
            Some(e) => e.parker.clone(),
            None => return,
        }
    };

    while parker.poll() != PK_WOKEN {
        core::hint::spin_loop();
    }

    let mut s = lock();
    s.set_running(tid);
}

/// Monotonic clock, advanced by the platform timer tick.
pub mod clock {
    use super::{AtomicU64, Ordering};

    static MONOTONIC_NS: AtomicU64 = AtomicU64::new(0);

    pub fn now_ns() -> u64 {
        MONOTONIC_NS.load(Ordering::SeqCst)
    }

    /// Timer-tick hook: move the clock forward.
    pub fn advance(ns: u64) {
        MONOTONIC_NS.fetch_add(ns, Ordering::SeqCst);
    }
}
