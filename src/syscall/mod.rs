//! Syscall boundary
//!
//! Thin wrappers over the futex and clone cores: raw register-sized
//! arguments in, errno-style `i64` out (negative errno on failure, payload
//! otherwise). User-space structures such as the WAIT timeout are copied
//! into kernel space here, before anything can block.
//!
//! The calling thread is passed explicitly; the platform's syscall entry
//! resolves it from per-CPU state before landing here.

use alloc::sync::Arc;

use crate::error::KernelResult;
use crate::ipc::futex::{self, FUTEX_OP_MASK, FUTEX_WAIT};
use crate::mem::UserAddr;
use crate::task::clone::{self, CloneFlags, SIGCHLD};
use crate::task::Thread;
use crate::time::TimeSpec;

/// Stack pointers handed to clone are aligned down to 16 bytes.
const USTACK_ALIGN: u64 = 16;

fn ustack_align(sp: u64) -> UserAddr {
    UserAddr(sp & !(USTACK_ALIGN - 1))
}

fn ret(r: KernelResult<i64>) -> i64 {
    match r {
        Ok(v) => v,
        Err(e) => e.errno(),
    }
}

/// futex(uaddr, op, val, timeout_or_val2, uaddr2)
///
/// For WAIT the fourth argument is a user pointer to a relative timespec,
/// copied in here; for REQUEUE it is the move count.
pub fn sc_futex(cur: &Arc<Thread>, uaddr: u64, op: u32, val: i64, val2: u64, uaddr2: u64) -> i64 {
    let task = cur.task();

    let mut timeout = None;
    let mut requeue_count = val2 as i64;
    if op & FUTEX_OP_MASK == FUTEX_WAIT {
        requeue_count = 0;
        if val2 != 0 {
            match TimeSpec::read_from_user(&task.space(), UserAddr(val2)) {
                Ok(ts) => timeout = Some(ts),
                Err(e) => return e.errno(),
            }
        }
    }

    ret(futex::futex(
        &task,
        cur,
        UserAddr(uaddr),
        op,
        val,
        requeue_count,
        timeout,
        UserAddr(uaddr2),
    ))
}

/// clone(flags, stack, parent_tid_ptr, tls_ptr, child_tid_ptr)
pub fn sc_clone(cur: &Arc<Thread>, flags: u64, sp: u64, ptid: u64, tls: u64, ctid: u64) -> i64 {
    let sp = ustack_align(sp);
    let flags = CloneFlags::from_bits_retain(flags);
    let r = if flags.contains(CloneFlags::THREAD) {
        clone::clone_thread(cur, flags, sp, UserAddr(ptid), UserAddr(tls), UserAddr(ctid))
    } else {
        clone::clone_process(cur, flags, sp)
    };
    ret(r)
}

/// fork(): process clone with only the termination signal set.
pub fn sc_fork(cur: &Arc<Thread>) -> i64 {
    sc_clone(cur, SIGCHLD, 0, 0, 0, 0)
}

/// vfork(): fork sharing the address space, with the parent suspended
/// until the child execs or exits.
pub fn sc_vfork(cur: &Arc<Thread>) -> i64 {
    sc_clone(
        cur,
        CloneFlags::VM.bits() | CloneFlags::VFORK.bits() | SIGCHLD,
        0,
        0,
        0,
        0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::futex::{FUTEX_PRIVATE, FUTEX_WAKE};
    use crate::mem::{AddressSpace, PAGE_SIZE};
    use crate::task::{self, Task};

    fn fixture() -> (Arc<Task>, Arc<Thread>) {
        let space = AddressSpace::new();
        space.map(UserAddr(0x1000), 2 * PAGE_SIZE).unwrap();
        task::bootstrap(space).unwrap()
    }

    #[test]
    fn test_sc_futex_wait_value_mismatch_is_eagain() {
        let (task, cur) = fixture();
        task.space().write_u32(UserAddr(0x1000), 1).unwrap();
        assert_eq!(sc_futex(&cur, 0x1000, FUTEX_WAIT | FUTEX_PRIVATE, 2, 0, 0), -11);
    }

    #[test]
    fn test_sc_futex_copies_in_timespec() {
        let (task, cur) = fixture();
        let space = task.space();
        space.write_u32(UserAddr(0x1000), 7).unwrap();

        // Malformed timespec in user memory: nsec a full second.
        let ts_addr = 0x1800u64;
        space
            .write_bytes(UserAddr(ts_addr), &0i64.to_le_bytes())
            .unwrap();
        space
            .write_bytes(UserAddr(ts_addr + 8), &1_000_000_000i64.to_le_bytes())
            .unwrap();
        assert_eq!(
            sc_futex(&cur, 0x1000, FUTEX_WAIT | FUTEX_PRIVATE, 7, ts_addr, 0),
            -22
        );

        // Unmapped timespec pointer faults before any blocking.
        assert_eq!(
            sc_futex(&cur, 0x1000, FUTEX_WAIT | FUTEX_PRIVATE, 7, 0x9000, 0),
            -14
        );
    }

    #[test]
    fn test_sc_futex_wake_errno_path() {
        let (_task, cur) = fixture();
        assert_eq!(sc_futex(&cur, 0x1000, FUTEX_WAKE | FUTEX_PRIVATE, -3, 0, 0), -22);
        assert_eq!(sc_futex(&cur, 0x1000, FUTEX_WAKE | FUTEX_PRIVATE, 1, 0, 0), 0);
    }

    #[test]
    fn test_sc_clone_rejects_foreign_process_flags() {
        let (_task, cur) = fixture();
        let flags = CloneFlags::FILES.bits() | SIGCHLD;
        assert_eq!(sc_clone(&cur, flags, 0x2000, 0, 0, 0), -22);
    }

    #[test]
    fn test_sc_fork_returns_child_pid() {
        let (task, cur) = fixture();
        let pid = sc_fork(&cur);
        assert!(pid > 0);
        assert_ne!(pid as u64, task.pid());

        let child = task::task_lookup(pid as u64).unwrap();
        assert_eq!(child.term_signal() as u64, SIGCHLD);
        task::task_destroy(&child);
    }

    #[test]
    fn test_stack_alignment() {
        assert_eq!(ustack_align(0x2fff), UserAddr(0x2ff0));
        assert_eq!(ustack_align(0x3000), UserAddr(0x3000));
    }
}
