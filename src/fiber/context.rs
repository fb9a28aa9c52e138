//! Per-OS-thread execution context.
//!
//! A `Context` records which thread, strand, and fiber are currently active
//! on this OS thread, plus a diagnostic description of what the context is
//! blocked on. Every fiber switch rewrites the fiber field (through the one
//! transfer routine), and the switch primitive's data word carries the
//! context pointer across jumps.
//!
//! The slot is exposed through explicit accessors rather than a hidden
//! global. A thread that was not started by this runtime gets a context (and
//! a root fiber standing in for its native stack) installed lazily on first
//! use; both live for the duration of the process, as there is no safe point
//! to tear them down.

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{ AtomicU64, Ordering };

use crate::fiber::fiber::Fiber;
use crate::sched::strand::Strand;
use crate::sched::thread::ThreadCore;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

pub struct Context {
    pub(crate) thread: *const ThreadCore,
    pub(crate) strand: *const Strand,
    pub(crate) fiber: *mut Fiber,
    pub(crate) block_desc: &'static str,
    id: u64,
}

impl Context {
    fn new(thread: *const ThreadCore, strand: *const Strand, fiber: *mut Fiber) -> Self {
        Self {
            thread,
            strand,
            fiber,
            block_desc: "",
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Context for a thread the runtime does not own.
    pub(crate) fn foreign() -> Self {
        let root = Box::into_raw(Box::new(Fiber::root()));
        Self::new(ptr::null(), ptr::null(), root)
    }

    /// Context for a runtime-owned thread; the root fiber stands in for the
    /// OS thread's native stack.
    pub(crate) fn for_thread(thread: *const ThreadCore, root: *mut Fiber) -> Self {
        Self::new(thread, ptr::null(), root)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// What this context last blocked on, or `""`.
    pub fn block_desc(&self) -> &'static str {
        self.block_desc
    }

    /// True when running on a thread owned by this runtime.
    pub fn on_runtime_thread(&self) -> bool {
        !self.thread.is_null()
    }
}

thread_local! {
    static CURRENT: Cell<*mut Context> = const { Cell::new(ptr::null_mut()) };
}

/// The current thread's context, installing a foreign one on first use.
pub(crate) fn current_ptr() -> *mut Context {
    CURRENT.with(|slot| {
        let p = slot.get();
        if !p.is_null() {
            return p;
        }
        let ctx = Box::into_raw(Box::new(Context::foreign()));
        slot.set(ctx);
        ctx
    })
}

/// Install a runtime thread's context. The pointer must stay valid for the
/// thread's lifetime.
pub(crate) fn install(ctx: *mut Context) {
    CURRENT.with(|slot| slot.set(ctx));
}

/// Snapshot accessor for diagnostics.
pub fn with_current<R>(f: impl FnOnce(&Context) -> R) -> R {
    unsafe { f(&*current_ptr()) }
}
