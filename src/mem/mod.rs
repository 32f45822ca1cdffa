//! User address spaces
//!
//! Page-granular user address spaces backed by kernel-owned frames. This is
//! the minimal surface the concurrency core consumes: translation of user
//! virtual addresses to physical addresses (futexes are keyed by physical
//! address), user-memory reads and writes, validity checks, and the
//! share-vs-copy split that `clone` needs for `CLONE_VM` and `fork`.
//!
//! Frames come from a bump allocator so every mapped page has a unique,
//! stable physical address for the lifetime of the space.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use hashbrown::HashMap;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};

pub const PAGE_SIZE: u64 = 4096;

/// A user-space virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserAddr(pub u64);

impl UserAddr {
    pub const NULL: UserAddr = UserAddr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    fn page(self) -> u64 {
        self.0 / PAGE_SIZE
    }

    fn offset(self) -> u64 {
        self.0 % PAGE_SIZE
    }
}

/// A physical address, the key a futex is identified by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhysAddr(pub u64);

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Frame allocator: monotonically increasing physical page addresses.
static NEXT_FRAME: AtomicU64 = AtomicU64::new(0x1_0000_0000);

fn alloc_frame_base() -> u64 {
    NEXT_FRAME.fetch_add(PAGE_SIZE, Ordering::Relaxed)
}

struct Frame {
    phys_base: u64,
    data: Box<[u8]>,
}

impl Frame {
    fn new_zeroed() -> Self {
        Self {
            phys_base: alloc_frame_base(),
            data: vec![0u8; PAGE_SIZE as usize].into_boxed_slice(),
        }
    }
}

/// A user address space: map of virtual page number to backing frame.
pub struct AddressSpace {
    pages: Mutex<HashMap<u64, Frame>>,
}

impl AddressSpace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(HashMap::new()),
        })
    }

    /// Map `len` bytes starting at `base`, rounding out to page boundaries.
    /// Already-mapped pages are left untouched.
    pub fn map(&self, base: UserAddr, len: u64) -> KernelResult<()> {
        if len == 0 {
            return Ok(());
        }
        let first = base.page();
        let last = UserAddr(base.0 + len - 1).page();
        let mut pages = self.pages.lock();
        for pn in first..=last {
            if !pages.contains_key(&pn) {
                pages
                    .try_reserve(1)
                    .map_err(|_| KernelError::OutOfMemory)?;
                pages.insert(pn, Frame::new_zeroed());
            }
        }
        Ok(())
    }

    /// Translate a user virtual address to its physical address.
    pub fn translate(&self, addr: UserAddr) -> Option<PhysAddr> {
        if addr.is_null() {
            return None;
        }
        let pages = self.pages.lock();
        pages
            .get(&addr.page())
            .map(|frame| PhysAddr(frame.phys_base + addr.offset()))
    }

    /// Is `addr` a valid, mapped user address?
    pub fn is_user_addr(&self, addr: UserAddr) -> bool {
        self.translate(addr).is_some()
    }

    /// Read bytes from user memory. Faults if any byte is unmapped.
    pub fn read_bytes(&self, addr: UserAddr, buf: &mut [u8]) -> KernelResult<()> {
        let pages = self.pages.lock();
        for (i, out) in buf.iter_mut().enumerate() {
            let a = UserAddr(addr.0.wrapping_add(i as u64));
            let frame = pages.get(&a.page()).ok_or(KernelError::Fault)?;
            *out = frame.data[a.offset() as usize];
        }
        Ok(())
    }

    /// Write bytes to user memory. Faults if any byte is unmapped.
    pub fn write_bytes(&self, addr: UserAddr, buf: &[u8]) -> KernelResult<()> {
        let mut pages = self.pages.lock();
        for (i, b) in buf.iter().enumerate() {
            let a = UserAddr(addr.0.wrapping_add(i as u64));
            let frame = pages.get_mut(&a.page()).ok_or(KernelError::Fault)?;
            frame.data[a.offset() as usize] = *b;
        }
        Ok(())
    }

    pub fn read_u32(&self, addr: UserAddr) -> KernelResult<u32> {
        let mut raw = [0u8; 4];
        self.read_bytes(addr, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn write_u32(&self, addr: UserAddr, val: u32) -> KernelResult<()> {
        self.write_bytes(addr, &val.to_le_bytes())
    }

    /// Deep-copy the space onto fresh frames for `fork`: new physical
    /// addresses, same virtual layout and contents.
    pub fn fork_copy(&self) -> KernelResult<Arc<AddressSpace>> {
        let src = self.pages.lock();
        let mut dst: HashMap<u64, Frame> = HashMap::new();
        dst.try_reserve(src.len())
            .map_err(|_| KernelError::OutOfMemory)?;
        for (pn, frame) in src.iter() {
            let mut copy = Frame::new_zeroed();
            copy.data.copy_from_slice(&frame.data);
            dst.insert(*pn, copy);
        }
        Ok(Arc::new(AddressSpace {
            pages: Mutex::new(dst),
        }))
    }
}
