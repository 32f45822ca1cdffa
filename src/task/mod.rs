//! Tasks and threads
//!
//! A `Task` is the process-level container: address space, futex table,
//! filesystem context, termination signal, and the vfork linkage back to a
//! suspended parent. A `Thread` is a schedulable execution context that
//! belongs to exactly one task.
//!
//! Lifecycle entry points live here (`task_create`, `task_destroy`,
//! `thread_create_for`, `thread_exit`, `vfork_done`); the clone flavors on
//! top of them are in [`clone`].

pub mod clone;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, RwLock};

use crate::error::KernelResult;
use crate::ipc::futex::FutexTable;
use crate::mem::{AddressSpace, UserAddr};
use crate::sched::{self, ThreadId};

pub type Pid = u64;

/// Address-space disposition for a new task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmMode {
    /// Child shares the parent's space (CLONE_VM, vfork).
    Share,
    /// Child gets a full copy (fork).
    Copy,
}

/// Filesystem context: what `fork` derives from the parent.
#[derive(Debug, Clone)]
pub struct FsContext {
    pub cwd: String,
    pub umask: u32,
}

impl FsContext {
    fn root() -> Self {
        Self {
            cwd: String::from("/"),
            umask: 0o022,
        }
    }
}

/// Process-level container.
pub struct Task {
    pid: Pid,
    ppid: Pid,
    space: RwLock<Arc<AddressSpace>>,
    /// Futexes of this task, keyed by physical address. Entries accumulate
    /// for the lifetime of the task; only task destruction reclaims them.
    pub futexes: FutexTable,
    term_signal: AtomicU32,
    /// Thread suspended in vfork until this task execs or exits.
    vfork_parent: Mutex<Option<ThreadId>>,
    fs: Mutex<FsContext>,
    threads: Mutex<Vec<Arc<Thread>>>,
}

impl Task {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn ppid(&self) -> Pid {
        self.ppid
    }

    /// The task's current address space.
    pub fn space(&self) -> Arc<AddressSpace> {
        self.space.read().clone()
    }

    /// Signal delivered to the parent when this task exits.
    pub fn term_signal(&self) -> u32 {
        self.term_signal.load(Ordering::Relaxed)
    }

    pub fn set_term_signal(&self, sig: u32) {
        self.term_signal.store(sig, Ordering::Relaxed);
    }

    pub fn fs(&self) -> FsContext {
        self.fs.lock().clone()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn thread_by_tid(&self, tid: ThreadId) -> Option<Arc<Thread>> {
        self.threads.lock().iter().find(|t| t.tid == tid).cloned()
    }

    /// The initial (oldest surviving) thread of the task.
    pub fn main_thread(&self) -> Option<Arc<Thread>> {
        self.threads.lock().first().cloned()
    }

    pub fn vfork_parent(&self) -> Option<ThreadId> {
        *self.vfork_parent.lock()
    }

    pub(crate) fn set_vfork_parent(&self, tid: ThreadId) {
        *self.vfork_parent.lock() = Some(tid);
    }

    pub(crate) fn take_vfork_parent(&self) -> Option<ThreadId> {
        self.vfork_parent.lock().take()
    }
}

/// Execution context carried by a thread.
pub struct ThreadContext {
    pub stack_pointer: UserAddr,
    pub tls: Option<UserAddr>,
    /// The address space this thread currently executes in. Normally the
    /// task's own; resynchronized after a vfork child has run in it.
    pub space_view: Arc<AddressSpace>,
}

/// One schedulable execution context.
pub struct Thread {
    tid: ThreadId,
    task: Arc<Task>,
    ctx: Mutex<ThreadContext>,
    /// User word zeroed and futex-woken when this thread exits
    /// (CLONE_CHILD_CLEARTID).
    clear_child_tid: Mutex<Option<UserAddr>>,
}

impl Thread {
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn task(&self) -> Arc<Task> {
        self.task.clone()
    }

    pub fn stack_pointer(&self) -> UserAddr {
        self.ctx.lock().stack_pointer
    }

    pub fn tls(&self) -> Option<UserAddr> {
        self.ctx.lock().tls
    }

    pub fn set_tls(&self, tls: UserAddr) {
        self.ctx.lock().tls = Some(tls);
    }

    pub fn clear_child_tid(&self) -> Option<UserAddr> {
        *self.clear_child_tid.lock()
    }

    pub fn set_clear_child_tid(&self, addr: UserAddr) {
        *self.clear_child_tid.lock() = Some(addr);
    }

    pub(crate) fn take_clear_child_tid(&self) -> Option<UserAddr> {
        self.clear_child_tid.lock().take()
    }

    /// Re-sync this thread's address-space view from its task. After a
    /// vfork the child may have executed (and exited) in the borrowed
    /// space before we resume; the view must not be assumed current.
    pub fn restore_space_view(&self) {
        self.ctx.lock().space_view = self.task.space();
    }
}

static TASK_TABLE: RwLock<alloc::collections::BTreeMap<Pid, Arc<Task>>> =
    RwLock::new(alloc::collections::BTreeMap::new());

static NEXT_PID: AtomicU64 = AtomicU64::new(1);
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

pub fn task_lookup(pid: Pid) -> Option<Arc<Task>> {
    TASK_TABLE.read().get(&pid).cloned()
}

pub fn task_count() -> usize {
    TASK_TABLE.read().len()
}

/// Tasks whose parent is `pid`.
pub fn children_of(pid: Pid) -> Vec<Arc<Task>> {
    TASK_TABLE
        .read()
        .values()
        .filter(|t| t.ppid == pid)
        .cloned()
        .collect()
}

fn insert_task(ppid: Pid, space: Arc<AddressSpace>) -> Arc<Task> {
    let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
    let task = Arc::new(Task {
        pid,
        ppid,
        space: RwLock::new(space),
        futexes: FutexTable::new(),
        term_signal: AtomicU32::new(0),
        vfork_parent: Mutex::new(None),
        fs: Mutex::new(FsContext::root()),
        threads: Mutex::new(Vec::new()),
    });
    TASK_TABLE.write().insert(pid, task.clone());
    task
}

/// Create the initial task/thread pair for a fresh address space. The
/// thread comes back already `Running`: this is the caller that will be
/// issuing syscalls.
pub fn bootstrap(space: Arc<AddressSpace>) -> KernelResult<(Arc<Task>, Arc<Thread>)> {
    let task = insert_task(0, space);
    let thread = thread_create_for(&task, UserAddr::NULL)?;
    let mut s = sched::lock();
    s.resume(thread.tid());
    s.set_running(thread.tid());
    drop(s);
    Ok((task, thread))
}

/// Create a child task of `parent`, sharing or copying its address space.
pub fn task_create(parent: &Arc<Task>, mode: VmMode) -> KernelResult<Arc<Task>> {
    let space = match mode {
        VmMode::Share => parent.space(),
        VmMode::Copy => parent.space().fork_copy()?,
    };
    Ok(insert_task(parent.pid, space))
}

/// Tear a task down: unregister its threads and drop it from the table.
/// The futex table goes with it.
pub fn task_destroy(task: &Arc<Task>) {
    let threads: Vec<Arc<Thread>> = task.threads.lock().drain(..).collect();
    {
        let mut s = sched::lock();
        for th in &threads {
            s.unregister_thread(th.tid());
        }
        if let Some(parent) = task.take_vfork_parent() {
            s.resume(parent);
        }
    }
    TASK_TABLE.write().remove(&task.pid);
    log::trace!("task_destroy pid={}", task.pid);
}

/// Create a thread inside `task` at the given stack pointer. The thread is
/// registered with the scheduler but held in `Creating` until resumed.
pub fn thread_create_for(task: &Arc<Task>, sp: UserAddr) -> KernelResult<Arc<Thread>> {
    let tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
    let thread = Arc::new(Thread {
        tid,
        task: task.clone(),
        ctx: Mutex::new(ThreadContext {
            stack_pointer: sp,
            tls: None,
            space_view: task.space(),
        }),
        clear_child_tid: Mutex::new(None),
    });
    sched::lock().register_thread(tid);
    task.threads.lock().push(thread.clone());
    log::trace!("thread_create_for pid={} tid={}", task.pid, tid);
    Ok(thread)
}

/// Thread exit path.
///
/// Clears the child-tid word and wakes one futex waiter on it (the
/// pthread_join handshake), releases a pending vfork parent when the last
/// thread of a vfork child goes away, and retires the thread.
pub fn thread_exit(cur: &Arc<Thread>) {
    let task = cur.task();

    if let Some(ctid) = cur.take_clear_child_tid() {
        let space = task.space();
        if space.write_u32(ctid, 0).is_ok() {
            let mut s = sched::lock();
            let _ = crate::ipc::futex::futex_wake(&mut s, &task, ctid, 1);
        }
    }

    let last = {
        let mut threads = task.threads.lock();
        threads.retain(|t| t.tid != cur.tid);
        threads.is_empty()
    };

    sched::lock().mark_exited(cur.tid);

    if last {
        vfork_done(&task);
    }
    log::trace!("thread_exit pid={} tid={}", task.pid, cur.tid);
}

/// Release a vfork-suspended parent, if any. Called on the child's exec or
/// exit; harmless when no parent is waiting.
pub fn vfork_done(task: &Arc<Task>) {
    let mut s = sched::lock();
    if let Some(parent) = task.take_vfork_parent() {
        s.resume(parent);
    }
}

/// Derive the child's filesystem context from the parent's.
pub fn fs_fork(parent: &Task, child: &Task) {
    *child.fs.lock() = parent.fs.lock().clone();
}
