//! Thread and process creation (clone)
//!
//! One entry point, two shapes:
//!
//! - **thread clone** (`CLONE_THREAD`): a new schedulable thread in the
//!   caller's task. This kernel never creates a thread with partially
//!   shared resources, so the full sharing set (files, fs, signal
//!   handlers, SysV semaphores, VM) is mandatory.
//! - **process clone**: a new task plus its initial thread, sharing the
//!   address space (`CLONE_VM`) or copying it, optionally with the vfork
//!   borrow/suspend protocol: the child runs in the borrowed space while
//!   the parent stays suspended until the child's exec or exit releases it
//!   via [`super::vfork_done`].
//!
//! Flag validation is set containment over named flag sets, so the allowed
//! combinations are auditable in one place.

use alloc::sync::Arc;
use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::error::{KernelError, KernelResult};
use crate::mem::UserAddr;
use crate::sched;
use crate::task::{self, Thread, VmMode};

bitflags! {
    /// Linux-compatible clone flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CloneFlags: u64 {
        /// Low byte: signal sent to the parent when the child exits.
        const CSIGNAL        = 0x0000_00ff;
        /// Share the address space.
        const VM             = 0x0000_0100;
        /// Share cwd, umask, etc.
        const FS             = 0x0000_0200;
        /// Share the file descriptor table.
        const FILES          = 0x0000_0400;
        /// Share signal handlers.
        const SIGHAND        = 0x0000_0800;
        /// Suspend the parent until the child execs or exits.
        const VFORK          = 0x0000_4000;
        /// Create a thread in the caller's task, not a new task.
        const THREAD         = 0x0001_0000;
        /// Share SysV semaphore adjustment values.
        const SYSVSEM        = 0x0004_0000;
        /// Install the given TLS pointer in the child.
        const SETTLS         = 0x0008_0000;
        /// Write the child's tid through the parent-tid pointer.
        const PARENT_SETTID  = 0x0010_0000;
        /// Zero and futex-wake the child-tid word on thread exit.
        const CHILD_CLEARTID = 0x0020_0000;
    }
}

pub const SIGCHLD: u64 = 17;

/// Thread creation shares everything or nothing is created: there is no
/// way to make a thread with partially shared resources.
pub const THREAD_MANDATORY: CloneFlags = CloneFlags::FILES
    .union(CloneFlags::FS)
    .union(CloneFlags::SIGHAND)
    .union(CloneFlags::SYSVSEM)
    .union(CloneFlags::VM);

/// The only bits process creation accepts.
pub const PROCESS_ALLOWED: CloneFlags = CloneFlags::VM
    .union(CloneFlags::VFORK)
    .union(CloneFlags::CSIGNAL);

const_assert_eq!(THREAD_MANDATORY.bits(), 0x0004_0f00);
const_assert_eq!(PROCESS_ALLOWED.bits() & CloneFlags::THREAD.bits(), 0);

/// Create a new thread in the caller's task.
///
/// Returns the new thread id. On success the thread has been released to
/// the scheduler; tid reporting and TLS installation happen first, so the
/// child never observes them half-done.
pub fn clone_thread(
    cur: &Arc<Thread>,
    flags: CloneFlags,
    sp: UserAddr,
    ptid: UserAddr,
    tls: UserAddr,
    ctid: UserAddr,
) -> KernelResult<i64> {
    if !flags.contains(THREAD_MANDATORY) {
        return Err(KernelError::InvalidArgument);
    }

    let task = cur.task();
    let space = task.space();

    // Sanity-check user pointers before creating anything.
    if flags.contains(CloneFlags::CHILD_CLEARTID) && !space.is_user_addr(ctid) {
        return Err(KernelError::Fault);
    }
    if flags.contains(CloneFlags::PARENT_SETTID) && !space.is_user_addr(ptid) {
        return Err(KernelError::Fault);
    }
    if flags.contains(CloneFlags::SETTLS) && !space.is_user_addr(tls) {
        return Err(KernelError::Fault);
    }

    let thread = task::thread_create_for(&task, sp)?;
    let tid = thread.tid();

    if flags.contains(CloneFlags::CHILD_CLEARTID) {
        thread.set_clear_child_tid(ctid);
    }
    if flags.contains(CloneFlags::PARENT_SETTID) {
        space.write_u32(ptid, tid as u32)?;
    }
    if flags.contains(CloneFlags::SETTLS) {
        thread.set_tls(tls);
    }

    sched::lock().resume(tid);

    log::trace!("clone_thread pid={} tid={} flags={:?}", task.pid(), tid, flags);
    Ok(tid as i64)
}

/// Create a new task and its initial thread.
///
/// Returns the new task's pid. A thread-creation failure destroys the
/// freshly created task first: no partially constructed task survives.
pub fn clone_process(cur: &Arc<Thread>, flags: CloneFlags, sp: UserAddr) -> KernelResult<i64> {
    if !PROCESS_ALLOWED.contains(flags) {
        return Err(KernelError::InvalidArgument);
    }

    let parent = cur.task();
    let mode = if flags.contains(CloneFlags::VM) {
        VmMode::Share
    } else {
        VmMode::Copy
    };

    let child = task::task_create(&parent, mode)?;
    let thread = match task::thread_create_for(&child, sp) {
        Ok(t) => t,
        Err(e) => {
            task::task_destroy(&child);
            return Err(e);
        }
    };

    child.set_term_signal((flags & CloneFlags::CSIGNAL).bits() as u32);
    task::fs_fork(&parent, &child);

    let pid = child.pid();
    log::trace!("clone_process pid={} -> {} flags={:?}", parent.pid(), pid, flags);

    let vfork = flags.contains(CloneFlags::VFORK);
    {
        let mut s = sched::lock();
        if vfork {
            debug_assert!(child.vfork_parent().is_none());
            child.set_vfork_parent(cur.tid());
            s.suspend(cur.tid());
        }
        s.resume(thread.tid());
    }

    if vfork {
        // Parked until the child's exec or exit calls vfork_done.
        sched::park_current(cur.tid());
    }

    // Under VM-share + vfork the child may have fully executed in the
    // borrowed space before we got here; re-sync our view of it.
    cur.restore_space_view();

    Ok(pid as i64)
}
