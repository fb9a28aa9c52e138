//! One-time spin lock.
//!
//! Guards the first access to state that, once initialised, is free to read
//! forever: promise publication. A CAS loop would pay two potential cache
//! hits and a branch-misprediction-prone retry loop; here the winner is
//! decided by a single `fetch_add` that cannot fail, and after the first
//! unlock every caller short-circuits on one load.
//!
//! `unlock` stores a large negative sentinel: it releases the lock and
//! permanently opens it in the same store.

use std::sync::atomic::{ AtomicI32, Ordering };

/// Sentinel stored on unlock; any negative state means "open forever".
const OPEN: i32 = -100_000;

pub struct OnceSpinLock {
    state: AtomicI32,
}

impl OnceSpinLock {
    pub fn new() -> Self {
        Self { state: AtomicI32::new(0) }
    }

    /// Acquire if this is the first contender, or succeed trivially once the
    /// lock has opened.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.ready() || self.state.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Spin until `try_lock` succeeds. The critical sections guarded by this
    /// lock are a handful of loads and stores, so a pause-hinted spin beats
    /// any parking machinery.
    #[inline]
    pub fn lock(&self) {
        while !self.try_lock() {
            std::hint::spin_loop();
        }
    }

    /// Release and permanently open the lock.
    #[inline]
    pub fn unlock(&self) {
        self.state.store(OPEN, Ordering::Release);
    }

    /// True after any successful lock/unlock cycle.
    #[inline]
    pub fn ready(&self) -> bool {
        self.state.load(Ordering::Acquire) < 0
    }
}

impl Default for OnceSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped acquisition: locks on construction, opens on drop.
pub struct OnceGuard<'a> {
    lock: &'a OnceSpinLock,
}

impl<'a> OnceGuard<'a> {
    pub fn new(lock: &'a OnceSpinLock) -> Self {
        lock.lock();
        Self { lock }
    }
}

impl Drop for OnceGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
