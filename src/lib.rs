//! Helix kernel concurrency core.
//!
//! The two subsystems every multitasking program leans on:
//!
//! - **futex**: blocking synchronization keyed by the physical address of a
//!   user-space word (`ipc::futex`). Non-contended paths never enter the
//!   kernel; contended paths block on a per-futex wait queue.
//! - **clone**: thread and process creation (`task::clone`), including
//!   `fork` and the borrow/suspend/release protocol of `vfork`.
//!
//! Everything races through one dispatch lock (`sched`): any sequence that
//! checks state and then blocks, wakes or resumes runs with the lock held,
//! which is what makes a futex wait's check-then-block atomic with respect
//! to wakes on the same word.
//!
//! Platform pieces the core needs (address translation, user-memory access,
//! the timer tick) are modelled in-crate in `mem` and `sched::clock`, so the
//! core runs and tests on the host exactly as it does on target.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod error;
pub mod ipc;
pub mod mem;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod time;

pub use error::{KernelError, KernelResult};
pub use mem::{AddressSpace, PhysAddr, UserAddr};
pub use task::{Task, Thread};
