//! Promise / future - one-shot result passing between strands.
//!
//! A promise is set exactly once (`set_value` or `set_panic`) and waited on
//! by at most one context. The registration race between the waiter and the
//! setter is decided by the [`OnceSpinLock`]: whichever loses the
//! `fetch_add` spins for the winner's handful of stores, and once either
//! side has unlocked, the lock is open forever and every later check is a
//! single load.
//!
//! Supporting more than one waiter would need broadcast bookkeeping on
//! every promise; the single-waiter fast path is the whole point, so a
//! second waiter is a programming error (asserted).

use std::any::Any;
use std::cell::UnsafeCell;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };

use crate::disruptor::wait_strategy::SpinWait;
use crate::fiber::context;
use crate::fiber::fiber::Fiber;
use crate::sched::strand::Strand;
use crate::sync::once_lock::{ OnceGuard, OnceSpinLock };

struct Waiter {
    strand: *const Strand,
    fiber: *mut Fiber,
}

pub struct Promise<T> {
    lock: OnceSpinLock,
    /// Set after the value or panic slot is written; the waiter's fast path.
    completed: AtomicBool,
    value: UnsafeCell<Option<T>>,
    panic: UnsafeCell<Option<Box<dyn Any + Send>>>,
    waiter: UnsafeCell<Option<Waiter>>,
    /// Diagnostic label; becomes the waiting context's block description.
    what: &'static str,
}

// Safety: the interior slots are published under the once-lock / completed
// flag protocol described in the module docs.
unsafe impl<T: Send> Send for Promise<T> {}
unsafe impl<T: Send> Sync for Promise<T> {}

impl<T: Send> Promise<T> {
    pub fn new(what: &'static str) -> Self {
        Self {
            lock: OnceSpinLock::new(),
            completed: AtomicBool::new(false),
            value: UnsafeCell::new(None),
            panic: UnsafeCell::new(None),
            waiter: UnsafeCell::new(None),
            what,
        }
    }

    pub fn what(&self) -> &'static str {
        self.what
    }

    /// True once a value or panic has been published.
    pub fn ready(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn set_value(&self, value: T) {
        // Safety: once-only contract; no reader observes the slot until the
        // completed flag (or the waiter wake-up) publishes it.
        unsafe {
            *self.value.get() = Some(value);
        }
        self.completed.store(true, Ordering::Release);
        self.notify();
    }

    /// Publish a captured panic; the waiter re-raises it.
    pub fn set_panic(&self, payload: Box<dyn Any + Send>) {
        unsafe {
            *self.panic.get() = Some(payload);
        }
        self.completed.store(true, Ordering::Release);
        self.notify();
    }

    fn notify(&self) {
        let guard = OnceGuard::new(&self.lock);
        // Safety: waiter registration happens under the same lock.
        if let Some(waiter) = unsafe { (*self.waiter.get()).take() } {
            unsafe { (*waiter.strand).unblock(waiter.fiber) };
        }
        drop(guard);
    }

    /// Block until the promise settles; returns the value or re-raises the
    /// published panic. At most one context may ever call this.
    pub fn wait(&self) -> T {
        if self.ready() {
            return self.take_outcome();
        }

        let ctx = context::current_ptr();
        let (strand, fiber) = unsafe { ((*ctx).strand, (*ctx).fiber) };

        if strand.is_null() {
            // Not on a runtime strand: nothing to suspend, spin it out.
            let mut wait = SpinWait::new();
            while !self.ready() {
                wait.snooze();
            }
            return self.take_outcome();
        }

        let mut registered = false;
        {
            let guard = OnceGuard::new(&self.lock);
            if !self.ready() {
                // Safety: we hold the lock; the setter's notify cannot be
                // inside its critical section concurrently.
                unsafe {
                    let waiter = &mut *self.waiter.get();
                    assert!(waiter.is_none(), "promise already has a waiting context");
                    *waiter = Some(Waiter { strand, fiber });
                    (*strand).block(fiber, self.what);
                }
                registered = true;
            }
            drop(guard);
        }

        if registered {
            unsafe { (*strand).suspend_current(fiber) };
        }
        self.take_outcome()
    }

    fn take_outcome(&self) -> T {
        // Safety: completion was observed with acquire ordering (directly or
        // through the unblock hand-off), and the single-waiter contract
        // makes us the only consumer.
        unsafe {
            if let Some(payload) = (*self.panic.get()).take() {
                panic::resume_unwind(payload);
            }
            (*self.value.get()).take().expect("promise settled twice or value taken twice")
        }
    }
}

/// Shareable view of a promise's eventual result.
pub struct Future<T> {
    promise: Arc<Promise<T>>,
}

impl<T: Send> Future<T> {
    pub fn new(promise: Arc<Promise<T>>) -> Self {
        Self { promise }
    }

    pub fn what(&self) -> &'static str {
        self.promise.what()
    }

    /// True once the result is available (wait will not suspend).
    pub fn try_ready(&self) -> bool {
        self.promise.ready()
    }

    /// Block the calling context until the result arrives.
    pub fn wait(self) -> T {
        self.promise.wait()
    }
}
