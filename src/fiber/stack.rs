//! Fiber stack allocation.
//!
//! Stacks are mmap'd anonymous regions with a PROT_NONE guard page at the
//! low end, so runaway recursion faults instead of silently corrupting a
//! neighbouring allocation. Deallocation is RAII.

use std::ptr;

use crate::constants::DEFAULT_STACK_SIZE;
use crate::error::{ Result, WeftError };

const PAGE_SIZE: usize = 4096;

/// An owned, guard-paged stack region.
pub struct FiberStack {
    base: *mut u8,
    /// Full mapped length, guard page included.
    len: usize,
}

// Safety: the mapping is plain anonymous memory owned by this handle.
unsafe impl Send for FiberStack {}

impl FiberStack {
    /// Highest usable address; the platform call-boundary alignment is
    /// applied by the context priming code.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.len) }
    }

    /// Usable size (guard page excluded).
    #[inline]
    pub fn size(&self) -> usize {
        self.len - PAGE_SIZE
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

/// Maps fiber stacks. Stateless; reuse of retired stacks is the scheduler's
/// free-list concern.
pub struct StackAllocator;

impl StackAllocator {
    pub fn default_stack_size() -> usize {
        DEFAULT_STACK_SIZE
    }

    pub fn allocate(size: usize) -> Result<FiberStack> {
        let usable = size.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
        let len = usable + PAGE_SIZE;

        unsafe {
            let base = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if base == libc::MAP_FAILED {
                return Err(WeftError::unexpected("fiber stack mmap failed"));
            }

            // Guard page at the low end; stacks grow downward.
            if libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) != 0 {
                libc::munmap(base, len);
                return Err(WeftError::unexpected("fiber stack guard mprotect failed"));
            }

            Ok(FiberStack {
                base: base as *mut u8,
                len,
            })
        }
    }
}
