//! Kernel error types
//!
//! One typed error enum for the whole concurrency core. Every failure
//! surfaces unchanged at the syscall boundary as a negative errno; nothing
//! in this subsystem is fatal to the kernel.

use core::fmt;

/// Errors produced by the futex and clone subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Bad flags, malformed timeout, negative count.
    InvalidArgument,

    /// Inaccessible or invalid user pointer.
    Fault,

    /// Allocation failed (futex object, table growth).
    OutOfMemory,

    /// Unimplemented operation or clock mode.
    NotSupported,

    /// Futex word changed before the wait could be queued. An expected
    /// fast-path outcome, not a true error: the caller re-checks and
    /// re-waits if it still wants to block.
    Retry,

    /// Timed wait expired.
    TimedOut,

    /// Wait cancelled by signal delivery.
    Interrupted,
}

pub type KernelResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Negative errno value returned at the syscall boundary.
    pub fn errno(self) -> i64 {
        match self {
            Self::InvalidArgument => -22, // EINVAL
            Self::Fault => -14,           // EFAULT
            Self::OutOfMemory => -12,     // ENOMEM
            Self::NotSupported => -95,    // ENOTSUP
            Self::Retry => -11,           // EAGAIN
            Self::TimedOut => -110,       // ETIMEDOUT
            Self::Interrupted => -4,      // EINTR
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Fault => write!(f, "bad user address"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::Retry => write!(f, "value mismatch, retry"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Interrupted => write!(f, "interrupted by signal"),
        }
    }
}
