//! Time types shared by the futex path and the syscall boundary.

use crate::error::{KernelError, KernelResult};
use crate::mem::{AddressSpace, UserAddr};

pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// Relative timeout as passed by userspace: seconds + nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeSpec {
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    /// Valid relative timeouts: non-negative seconds, nanoseconds below one
    /// second.
    pub fn is_valid(&self) -> bool {
        self.sec >= 0 && self.nsec < NSEC_PER_SEC
    }

    /// Total nanoseconds. Zero means "no bound" to the sleep primitives.
    pub fn to_ns(&self) -> u64 {
        (self.sec as u64)
            .saturating_mul(NSEC_PER_SEC as u64)
            .saturating_add(self.nsec.max(0) as u64)
    }

    /// Copy a timespec in from user memory (two little-endian i64 words).
    pub fn read_from_user(space: &AddressSpace, addr: UserAddr) -> KernelResult<Self> {
        let mut raw = [0u8; 16];
        space.read_bytes(addr, &mut raw).map_err(|_| KernelError::Fault)?;
        let sec = i64::from_le_bytes(raw[0..8].try_into().unwrap_or([0; 8]));
        let nsec = i64::from_le_bytes(raw[8..16].try_into().unwrap_or([0; 8]));
        Ok(Self { sec, nsec })
    }
}
