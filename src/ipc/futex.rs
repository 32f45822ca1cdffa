//! Futex (fast userspace mutex)
//!
//! Blocking synchronization keyed by the physical address of a 32-bit user
//! word. Uncontended lock/unlock never enters the kernel; contended paths
//! land here and block on a per-futex wait queue.
//!
//! Futexes are per-task: the table lives in the owning `Task`, keyed by
//! translated physical address, one futex per distinct contended word.
//! Objects are created lazily on first wait (or first use as a requeue
//! target) and reclaimed only when the task is destroyed.
//!
//! The whole check-then-block sequence of a wait (read the word, compare,
//! enqueue) runs under the global dispatch lock, as do wake and requeue,
//! so a wake can never fall between a waiter's value check and its enqueue.
//!
//! Cross-process (non-private) futexes are not supported; the private flag
//! is assumed and its absence only logs a warning.

use alloc::sync::Arc;
use hashbrown::HashMap;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mem::{AddressSpace, PhysAddr, UserAddr};
use crate::sched::{self, SchedGuard, SchedState, ThreadId, WaitResult};
use crate::sync::WaitQueue;
use crate::task::Task;
use crate::time::TimeSpec;

pub const FUTEX_WAIT: u32 = 0;
pub const FUTEX_WAKE: u32 = 1;
pub const FUTEX_REQUEUE: u32 = 3;
// Reserved, not implemented.
pub const FUTEX_LOCK_PI: u32 = 6;
pub const FUTEX_UNLOCK_PI: u32 = 7;

pub const FUTEX_OP_MASK: u32 = 0x7f;
pub const FUTEX_PRIVATE: u32 = 0x80;
pub const FUTEX_CLOCK_REALTIME: u32 = 0x100;

/// Sentinel count meaning "wake every waiter".
pub const FUTEX_WAKE_ALL: i64 = i32::MAX as i64;

/// One futex: a wait queue bound to the physical address of a user word.
pub struct Futex {
    addr: PhysAddr,
    pub queue: Arc<WaitQueue>,
}

impl Futex {
    fn new(addr: PhysAddr) -> Self {
        Self {
            addr,
            queue: Arc::new(WaitQueue::new()),
        }
    }

    pub fn addr(&self) -> PhysAddr {
        self.addr
    }
}

/// Per-task futex collection, keyed by physical address.
pub struct FutexTable {
    inner: Mutex<HashMap<u64, Arc<Futex>>>,
}

impl FutexTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Look a futex up by user address. No side effects.
    pub fn find(&self, space: &AddressSpace, uaddr: UserAddr) -> Option<Arc<Futex>> {
        let pa = space.translate(uaddr)?;
        self.inner.lock().get(&pa.0).cloned()
    }

    /// Look a futex up, creating it if the word has never been contended.
    /// Two calls for the same word return the same object.
    pub fn get_or_create(
        &self,
        space: &AddressSpace,
        uaddr: UserAddr,
    ) -> KernelResult<Arc<Futex>> {
        let pa = space.translate(uaddr).ok_or(KernelError::Fault)?;
        let mut inner = self.inner.lock();
        if let Some(f) = inner.get(&pa.0) {
            return Ok(f.clone());
        }
        inner
            .try_reserve(1)
            .map_err(|_| KernelError::OutOfMemory)?;
        let f = Arc::new(Futex::new(pa));
        inner.insert(pa.0, f.clone());
        Ok(f)
    }

    /// Number of distinct contended words so far.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// FUTEX_WAIT: block until the word at `uaddr` is woken, provided it still
/// holds `val`.
///
/// Consumes the dispatch-lock guard: the value check and the enqueue are
/// one critical section, and the guard is released inside the sleep.
///
/// After waking, this thread may have been requeued to a different futex
/// than the one it joined; nothing here assumes otherwise.
pub fn futex_wait(
    guard: SchedGuard,
    task: &Arc<Task>,
    cur: ThreadId,
    uaddr: UserAddr,
    val: u32,
    ts: Option<TimeSpec>,
) -> KernelResult<i64> {
    let space = task.space();

    let uval = space.read_u32(uaddr)?;
    if uval != val {
        return Err(KernelError::Retry);
    }

    if let Some(ts) = &ts {
        if !ts.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
    }

    log::trace!(
        "futex_wait tid={} uaddr={:#x} val={:#x} timeout_ns={}",
        cur,
        uaddr.0,
        val,
        ts.map(|t| t.to_ns()).unwrap_or(0)
    );

    let futex = task.futexes.get_or_create(&space, uaddr)?;
    match sched::sleep_on(guard, cur, &futex.queue, ts.map(|t| t.to_ns())) {
        WaitResult::Woken => Ok(0),
        WaitResult::TimedOut => Err(KernelError::TimedOut),
        WaitResult::Interrupted => Err(KernelError::Interrupted),
    }
}

/// FUTEX_WAKE: wake up to `n` waiters on the word at `uaddr`; `n` of
/// [`FUTEX_WAKE_ALL`] empties the queue. Returns how many were woken.
pub fn futex_wake(
    s: &mut SchedState,
    task: &Arc<Task>,
    uaddr: UserAddr,
    n: i64,
) -> KernelResult<i64> {
    if n < 0 {
        return Err(KernelError::InvalidArgument);
    }
    if n == 0 {
        return Ok(0);
    }

    // No futex means the word was never contended: nothing to wake, and
    // waking must not create one.
    let space = task.space();
    let futex = match task.futexes.find(&space, uaddr) {
        Some(f) => f,
        None => return Ok(0),
    };

    log::trace!("futex_wake uaddr={:#x} n={}", uaddr.0, n);

    if n == 1 {
        return Ok(if s.wake_one(&futex.queue) { 1 } else { 0 });
    }

    if n == FUTEX_WAKE_ALL {
        return Ok(s.wake_all(&futex.queue) as i64);
    }

    let mut left = n;
    while left > 0 && s.wake_one(&futex.queue) {
        left -= 1;
    }
    Ok(n - left)
}

/// FUTEX_REQUEUE: wake up to `val` waiters on `uaddr`, then move up to
/// `val2` of the remaining ones onto the futex at `uaddr2` without waking
/// them. Returns the woken count only.
pub fn futex_requeue(
    s: &mut SchedState,
    task: &Arc<Task>,
    uaddr: UserAddr,
    val: i64,
    val2: i64,
    uaddr2: UserAddr,
) -> KernelResult<i64> {
    if val < 0 || val2 < 0 {
        return Err(KernelError::InvalidArgument);
    }

    let space = task.space();
    let src = match task.futexes.find(&space, uaddr) {
        Some(f) => f,
        None => return Ok(0),
    };

    log::trace!(
        "futex_requeue uaddr={:#x} val={} val2={} uaddr2={:#x}",
        uaddr.0,
        val,
        val2,
        uaddr2.0
    );

    let mut left = val;
    while left > 0 && s.wake_one(&src.queue) {
        left -= 1;
    }

    if val2 > 0 {
        let dst = task.futexes.get_or_create(&space, uaddr2)?;
        let mut moved = val2;
        while moved > 0 && s.requeue(&src.queue, &dst.queue) {
            moved -= 1;
        }
    }

    Ok(val - left)
}

/// Futex dispatcher. Validates op flags, then routes to WAIT / WAKE /
/// REQUEUE under the global dispatch lock. `timeout` must already be in
/// kernel space; `val2` carries the requeue move count.
pub fn futex(
    task: &Arc<Task>,
    cur: &Arc<crate::task::Thread>,
    uaddr: UserAddr,
    op: u32,
    val: i64,
    val2: i64,
    timeout: Option<TimeSpec>,
    uaddr2: UserAddr,
) -> KernelResult<i64> {
    if op & FUTEX_OP_MASK == FUTEX_REQUEUE && !task.space().is_user_addr(uaddr2) {
        return Err(KernelError::Fault);
    }

    // No support for the realtime clock.
    if op & FUTEX_CLOCK_REALTIME != 0 {
        return Err(KernelError::NotSupported);
    }

    if op & FUTEX_PRIVATE == 0 {
        log::warn!("shared futexes not supported, treating uaddr={:#x} as private", uaddr.0);
    }

    let mut guard = sched::lock();
    match op & FUTEX_OP_MASK {
        FUTEX_WAIT => futex_wait(guard, task, cur.tid(), uaddr, val as u32, timeout),
        FUTEX_WAKE => futex_wake(&mut guard, task, uaddr, val),
        FUTEX_REQUEUE => futex_requeue(&mut guard, task, uaddr, val, val2, uaddr2),
        // FUTEX_LOCK_PI / FUTEX_UNLOCK_PI reserved for priority
        // inheritance, which this kernel does not implement.
        _ => Err(KernelError::NotSupported),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::PAGE_SIZE;
    use crate::sched::ThreadState;
    use crate::task::{self, Thread};
    use std::thread::JoinHandle;
    use std::time::Duration;

    const WORD_A: UserAddr = UserAddr(0x1000);
    const WORD_B: UserAddr = UserAddr(0x1040);

    fn fixture() -> (Arc<Task>, Arc<Thread>) {
        let space = AddressSpace::new();
        space.map(UserAddr(0x1000), 2 * PAGE_SIZE).unwrap();
        task::bootstrap(space).unwrap()
    }

    fn spin_until(pred: impl Fn() -> bool) {
        for _ in 0..10_000 {
            if pred() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("condition not reached within 10s");
    }

    fn queue_len(task: &Arc<Task>, uaddr: UserAddr) -> usize {
        task.futexes
            .find(&task.space(), uaddr)
            .map(|f| f.queue.len())
            .unwrap_or(0)
    }

    /// Run a waiter on its own host thread, as its own kernel thread.
    fn spawn_waiter(
        task: &Arc<Task>,
        uaddr: UserAddr,
        expected: u32,
        ts: Option<TimeSpec>,
    ) -> (JoinHandle<KernelResult<i64>>, ThreadId) {
        let th = task::thread_create_for(task, UserAddr(0x2000)).unwrap();
        {
            let mut s = sched::lock();
            s.resume(th.tid());
            s.set_running(th.tid());
        }
        let tid = th.tid();
        let task = task.clone();
        let handle = std::thread::spawn(move || {
            futex(
                &task.clone(),
                &th,
                uaddr,
                FUTEX_WAIT | FUTEX_PRIVATE,
                expected as i64,
                0,
                ts,
                UserAddr::NULL,
            )
        });
        (handle, tid)
    }

    fn wake(task: &Arc<Task>, uaddr: UserAddr, cur: &Arc<Thread>, n: i64) -> KernelResult<i64> {
        futex(
            task,
            cur,
            uaddr,
            FUTEX_WAKE | FUTEX_PRIVATE,
            n,
            0,
            None,
            UserAddr::NULL,
        )
    }

    #[test]
    fn test_get_or_create_idempotent() {
        let (task, _cur) = fixture();
        let space = task.space();
        let a = task.futexes.get_or_create(&space, WORD_A).unwrap();
        let b = task.futexes.get_or_create(&space, WORD_A).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(task.futexes.len(), 1);

        let c = task.futexes.get_or_create(&space, WORD_B).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(task.futexes.len(), 2);
    }

    #[test]
    fn test_wait_value_mismatch_returns_retry() {
        let (task, cur) = fixture();
        task.space().write_u32(WORD_A, 5).unwrap();
        let r = futex(
            &task,
            &cur,
            WORD_A,
            FUTEX_WAIT | FUTEX_PRIVATE,
            6,
            0,
            None,
            UserAddr::NULL,
        );
        assert_eq!(r, Err(KernelError::Retry));
        // Never blocked, never created a futex.
        assert!(task.futexes.is_empty());
    }

    #[test]
    fn test_wait_unmapped_address_faults() {
        let (task, cur) = fixture();
        let r = futex(
            &task,
            &cur,
            UserAddr(0x9000),
            FUTEX_WAIT | FUTEX_PRIVATE,
            0,
            0,
            None,
            UserAddr::NULL,
        );
        assert_eq!(r, Err(KernelError::Fault));
    }

    #[test]
    fn test_wait_invalid_timespec() {
        let (task, cur) = fixture();
        task.space().write_u32(WORD_A, 0).unwrap();
        for ts in [TimeSpec::new(-1, 0), TimeSpec::new(0, 1_000_000_000)] {
            let r = futex(
                &task,
                &cur,
                WORD_A,
                FUTEX_WAIT | FUTEX_PRIVATE,
                0,
                0,
                Some(ts),
                UserAddr::NULL,
            );
            assert_eq!(r, Err(KernelError::InvalidArgument));
        }
    }

    #[test]
    fn test_wake_zero_is_noop() {
        let (task, cur) = fixture();
        assert_eq!(wake(&task, WORD_A, &cur, 0), Ok(0));
        // n == 0 must not create a futex for a word that had none.
        assert!(task.futexes.is_empty());
    }

    #[test]
    fn test_wake_negative_invalid() {
        let (task, cur) = fixture();
        assert_eq!(wake(&task, WORD_A, &cur, -1), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_wake_without_waiters_returns_zero() {
        let (task, cur) = fixture();
        assert_eq!(wake(&task, WORD_A, &cur, 1), Ok(0));
        assert_eq!(wake(&task, WORD_A, &cur, FUTEX_WAKE_ALL), Ok(0));
    }

    #[test]
    fn test_wake_one_of_two() {
        let (task, cur) = fixture();
        task.space().write_u32(WORD_A, 0).unwrap();

        let (h1, _t1) = spawn_waiter(&task, WORD_A, 0, None);
        let (h2, _t2) = spawn_waiter(&task, WORD_A, 0, None);
        spin_until(|| queue_len(&task, WORD_A) == 2);

        assert_eq!(wake(&task, WORD_A, &cur, 1), Ok(1));
        spin_until(|| queue_len(&task, WORD_A) == 1);

        // Exactly one waiter is gone; the other is still blocked.
        assert_eq!(wake(&task, WORD_A, &cur, 1), Ok(1));
        assert_eq!(h1.join().unwrap(), Ok(0));
        assert_eq!(h2.join().unwrap(), Ok(0));
        assert_eq!(wake(&task, WORD_A, &cur, 1), Ok(0));
    }

    #[test]
    fn test_wake_all_returns_exact_count() {
        let (task, cur) = fixture();
        task.space().write_u32(WORD_A, 0).unwrap();

        let handles: Vec<_> = (0..3).map(|_| spawn_waiter(&task, WORD_A, 0, None)).collect();
        spin_until(|| queue_len(&task, WORD_A) == 3);

        assert_eq!(wake(&task, WORD_A, &cur, FUTEX_WAKE_ALL), Ok(3));
        for (h, _) in handles {
            assert_eq!(h.join().unwrap(), Ok(0));
        }
    }

    #[test]
    fn test_wake_n_stops_when_queue_empties() {
        let (task, cur) = fixture();
        task.space().write_u32(WORD_A, 0).unwrap();

        let (h, _tid) = spawn_waiter(&task, WORD_A, 0, None);
        spin_until(|| queue_len(&task, WORD_A) == 1);

        // Asked for five, only one was there.
        assert_eq!(wake(&task, WORD_A, &cur, 5), Ok(1));
        assert_eq!(h.join().unwrap(), Ok(0));
    }

    #[test]
    fn test_requeue_wakes_one_moves_one() {
        let (task, cur) = fixture();
        task.space().write_u32(WORD_A, 0).unwrap();

        let (h1, t1) = spawn_waiter(&task, WORD_A, 0, None);
        let (h2, t2) = spawn_waiter(&task, WORD_A, 0, None);
        spin_until(|| queue_len(&task, WORD_A) == 2);

        let r = futex(
            &task,
            &cur,
            WORD_A,
            FUTEX_REQUEUE | FUTEX_PRIVATE,
            1,
            1,
            None,
            WORD_B,
        );
        assert_eq!(r, Ok(1));

        // Source drained: one woken, one moved to the target queue where it
        // stays blocked.
        assert_eq!(queue_len(&task, WORD_A), 0);
        assert_eq!(queue_len(&task, WORD_B), 1);
        spin_until(|| {
            sched::thread_state(t1) == Some(ThreadState::Running)
                || sched::thread_state(t2) == Some(ThreadState::Running)
        });
        let blocked = [t1, t2]
            .iter()
            .filter(|&&t| sched::thread_state(t) == Some(ThreadState::Blocked))
            .count();
        assert_eq!(blocked, 1);

        // Wake on the old word reaches nobody; the mover is on WORD_B now.
        assert_eq!(wake(&task, WORD_A, &cur, FUTEX_WAKE_ALL), Ok(0));
        assert_eq!(wake(&task, WORD_B, &cur, FUTEX_WAKE_ALL), Ok(1));
        assert_eq!(h1.join().unwrap(), Ok(0));
        assert_eq!(h2.join().unwrap(), Ok(0));
    }

    #[test]
    fn test_requeue_negative_counts_invalid() {
        let (task, cur) = fixture();
        for (val, val2) in [(-1, 0), (0, -1)] {
            let r = futex(
                &task,
                &cur,
                WORD_A,
                FUTEX_REQUEUE | FUTEX_PRIVATE,
                val,
                val2,
                None,
                WORD_B,
            );
            assert_eq!(r, Err(KernelError::InvalidArgument));
        }
    }

    #[test]
    fn test_requeue_missing_source_returns_zero() {
        let (task, cur) = fixture();
        let r = futex(
            &task,
            &cur,
            WORD_A,
            FUTEX_REQUEUE | FUTEX_PRIVATE,
            1,
            1,
            None,
            WORD_B,
        );
        assert_eq!(r, Ok(0));
        // And the target was not created either.
        assert!(task.futexes.find(&task.space(), WORD_B).is_none());
    }

    #[test]
    fn test_requeue_invalid_target_faults() {
        let (task, cur) = fixture();
        let r = futex(
            &task,
            &cur,
            WORD_A,
            FUTEX_REQUEUE | FUTEX_PRIVATE,
            1,
            1,
            None,
            UserAddr(0x9000),
        );
        assert_eq!(r, Err(KernelError::Fault));
    }

    #[test]
    fn test_unknown_and_pi_ops_not_supported() {
        let (task, cur) = fixture();
        for op in [FUTEX_LOCK_PI, FUTEX_UNLOCK_PI, 42] {
            let r = futex(
                &task,
                &cur,
                WORD_A,
                op | FUTEX_PRIVATE,
                0,
                0,
                None,
                UserAddr::NULL,
            );
            assert_eq!(r, Err(KernelError::NotSupported));
        }
    }

    #[test]
    fn test_realtime_clock_not_supported() {
        let (task, cur) = fixture();
        let r = futex(
            &task,
            &cur,
            WORD_A,
            FUTEX_WAIT | FUTEX_PRIVATE | FUTEX_CLOCK_REALTIME,
            0,
            0,
            None,
            UserAddr::NULL,
        );
        assert_eq!(r, Err(KernelError::NotSupported));
    }

    #[test]
    fn test_wait_timeout_expires() {
        let (task, _cur) = fixture();
        task.space().write_u32(WORD_A, 0).unwrap();

        let ts = TimeSpec::new(0, 50_000_000);
        let (h, tid) = spawn_waiter(&task, WORD_A, 0, Some(ts));
        spin_until(|| sched::thread_state(tid) == Some(ThreadState::Blocked));

        sched::clock::advance(100_000_000);
        assert_eq!(h.join().unwrap(), Err(KernelError::TimedOut));
        assert_eq!(queue_len(&task, WORD_A), 0);
    }

    #[test]
    fn test_wait_interrupted_by_signal() {
        let (task, _cur) = fixture();
        task.space().write_u32(WORD_A, 0).unwrap();

        let (h, tid) = spawn_waiter(&task, WORD_A, 0, None);
        spin_until(|| sched::thread_state(tid) == Some(ThreadState::Blocked));

        sched::lock().interrupt(tid);
        assert_eq!(h.join().unwrap(), Err(KernelError::Interrupted));
    }
}
