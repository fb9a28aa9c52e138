//! Thread - the OS-level host that drains strands.
//!
//! Each thread owns:
//!
//! - a 1024-slot unblock ring (multi-writer, single-reader) through which
//!   foreign threads cheaply signal that a local fiber became runnable;
//! - a binary heap of sleep timers ordered by expiry;
//! - a free list of retired worker fibers, consulted before mapping a new
//!   stack;
//! - the park/notify gate that lets it sleep when fully idle.
//!
//! ## The notify discipline
//!
//! A thread wishing to park takes its mutex, swaps 0 into the
//! `posted_messages` gate, re-checks for work one last time, and only then
//! waits on the condvar. A producer posts its work first and then
//! `fetch_add(1)`s the gate: the one that observes the 0 -> 1 transition
//! takes the mutex and signals; everyone else knows the thread has already
//! been (or will be) woken. Both sides touch the gate with a
//! read-modify-write, which always sees the latest value, so the parked
//! thread cannot miss a post, and concurrent posters do not pile up on the
//! mutex.
//!
//! Every thread carries a main strand (`post`/`spawn`/`call` delegate to
//! it); further strands can be pinned to the thread with
//! [`Thread::new_strand`].

use std::cell::UnsafeCell;
use std::collections::BinaryHeap;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, AtomicI64, AtomicUsize, Ordering };
use std::time::{ Duration, Instant };

use parking_lot::{ Condvar, Mutex, RwLock };

use crate::constants::{ PARK_SPIN_LIMIT, UNBLOCK_RING_SLOTS };
use crate::disruptor::cursor::{ ReadCursor, SharedWriteCursor };
use crate::disruptor::ring_buffer::RingBuffer;
use crate::error::Result;
use crate::fiber::context::{ self, Context };
use crate::fiber::fiber::Fiber;
use crate::fiber::stack::StackAllocator;
use crate::sched::strand::Strand;
use crate::sync::promise::Future;
use crate::task::FiberBody;

/// One pending cross-thread wake-up.
struct UnblockSlot {
    strand: *const Strand,
    fiber: *mut Fiber,
}

// Safety: raw pointers into structures owned by the receiving thread.
unsafe impl Send for UnblockSlot {}

impl Default for UnblockSlot {
    fn default() -> Self {
        Self {
            strand: ptr::null(),
            fiber: ptr::null_mut(),
        }
    }
}

struct SleepTimer {
    expires: Instant,
    strand: *const Strand,
    fiber: *mut Fiber,
}

// BinaryHeap is a max-heap; invert the ordering so the earliest expiry
// surfaces first.
impl PartialEq for SleepTimer {
    fn eq(&self, other: &Self) -> bool {
        self.expires == other.expires
    }
}
impl Eq for SleepTimer {}
impl PartialOrd for SleepTimer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SleepTimer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.expires.cmp(&self.expires)
    }
}

/// Host-thread-only state.
struct ThreadLocalState {
    /// Arena owning every worker fiber this thread ever created; boxes are
    /// never moved, so raw fiber pointers stay stable for the thread's
    /// lifetime.
    fibers: Vec<Box<Fiber>>,
    /// Finished fibers whose stacks are ready to re-prime.
    free: Vec<*mut Fiber>,
    timers: BinaryHeap<SleepTimer>,
}

pub(crate) struct ThreadCore {
    name: &'static str,
    unblock_ring: RingBuffer<UnblockSlot>,
    unblock_write: SharedWriteCursor,
    unblock_read: ReadCursor,
    done: AtomicBool,
    posted_messages: AtomicI64,
    park_mutex: Mutex<()>,
    park_cond: Condvar,
    strands: RwLock<Vec<Arc<Strand>>>,
    strands_epoch: AtomicUsize,
    local: UnsafeCell<ThreadLocalState>,
}

// Safety: `local` is only touched from the hosted OS thread; everything
// else is atomics, cursors, or lock-guarded.
unsafe impl Send for ThreadCore {}
unsafe impl Sync for ThreadCore {}

impl ThreadCore {
    fn new(name: &'static str) -> Self {
        let unblock_ring = RingBuffer::new(UNBLOCK_RING_SLOTS);
        let unblock_write = SharedWriteCursor::new("unblock", UNBLOCK_RING_SLOTS);
        let unblock_read = ReadCursor::new("unblock");
        unblock_read.follows(&unblock_write);
        unblock_write.follows(&unblock_read);
        Self {
            name,
            unblock_ring,
            unblock_write,
            unblock_read,
            done: AtomicBool::new(false),
            posted_messages: AtomicI64::new(0),
            park_mutex: Mutex::new(()),
            park_cond: Condvar::new(),
            strands: RwLock::new(Vec::new()),
            strands_epoch: AtomicUsize::new(0),
            local: UnsafeCell::new(ThreadLocalState {
                fibers: Vec::new(),
                free: Vec::new(),
                timers: BinaryHeap::new(),
            }),
        }
    }

    fn add_strand(&self, strand: Arc<Strand>) {
        self.strands.write().push(strand);
        self.strands_epoch.fetch_add(1, Ordering::Release);
    }

    /// Wake the hosted thread if it parked (or is about to). See the module
    /// docs for the gate argument.
    ///
    /// The gate op must be the read-modify-write itself, not a shortcut
    /// load: an RMW always observes the latest gate value, so the post that
    /// follows the parker's reset cannot miss the 0 -> 1 transition.
    pub(crate) fn notify(&self) {
        let ctx = context::current_ptr();
        if ptr::eq(unsafe { (*ctx).thread }, self as *const ThreadCore) {
            return; // the host sees its own work without signalling
        }
        if self.posted_messages.fetch_add(1, Ordering::AcqRel) == 0 {
            let _lock = self.park_mutex.lock();
            self.park_cond.notify_one();
        }
    }

    /// Queue a cross-thread wake-up for one of this thread's fibers.
    pub(crate) fn post_unblock(&self, strand: *const Strand, fiber: *mut Fiber) {
        let slot = match self.unblock_write.claim(1) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(target: "weft::thread", thread = self.name, %err, "unblock dropped");
                return;
            }
        };
        // Safety: the claim gives exclusive slot ownership until publish.
        unsafe {
            *self.unblock_ring.get_mut(slot) = UnblockSlot { strand, fiber };
        }
        if self.unblock_write.publish_after(slot, slot - 1).is_ok() {
            self.notify();
        }
    }

    /// Route queued unblock notifications to their strands. Host only.
    pub(crate) fn drain_unblocks(&self) {
        let mut pos = self.unblock_read.begin();
        let end = self.unblock_read.check_end();
        while pos < end {
            // Safety: slot published, and this thread is the only reader.
            let (strand, fiber) = unsafe {
                let slot = self.unblock_ring.get(pos);
                (slot.strand, slot.fiber)
            };
            self.unblock_read.publish(pos);
            unsafe { (*strand).unblock_local(fiber) };
            pos += 1;
        }
    }

    /// Wake every timer at or past its expiry; a cancelled strand's timers
    /// fire immediately. Host only.
    pub(crate) fn process_timers(&self) {
        let now = Instant::now();
        let local = unsafe { &mut *self.local.get() };
        while let Some(timer) = local.timers.peek() {
            let due = timer.expires <= now || unsafe { (*timer.strand).is_cancelled() };
            if !due {
                break;
            }
            let timer = local.timers.pop().expect("peeked timer");
            unsafe { (*timer.strand).unblock_local(timer.fiber) };
        }
    }

    /// Register a sleep timer for a blocked fiber. Host only.
    pub(crate) fn push_timer(&self, expires: Instant, strand: *const Strand, fiber: *mut Fiber) {
        let local = unsafe { &mut *self.local.get() };
        local.timers.push(SleepTimer { expires, strand, fiber });
    }

    /// Draw a fiber for a new worker body: free list first, else a freshly
    /// mapped stack. Host only.
    pub(crate) fn obtain_fiber(&self, body: FiberBody) -> *mut Fiber {
        let local = unsafe { &mut *self.local.get() };
        if let Some(fiber) = local.free.pop() {
            unsafe { (*fiber).reset(body) };
            return fiber;
        }
        let stack = StackAllocator::allocate(StackAllocator::default_stack_size())
            .expect("fiber stack allocation failed");
        let mut boxed = Fiber::spawn(body, stack);
        let fiber = &mut *boxed as *mut Fiber;
        local.fibers.push(boxed);
        fiber
    }

    /// Return a finished fiber to the free list. Host only.
    pub(crate) fn recycle_fiber(&self, fiber: *mut Fiber) {
        debug_assert!(unsafe { (*fiber).done() });
        let local = unsafe { &mut *self.local.get() };
        local.free.push(fiber);
    }

    fn has_immediate_work(&self, strands: &[Arc<Strand>]) -> bool {
        if self.unblock_read.begin() < self.unblock_read.check_end() {
            return true;
        }
        let now = Instant::now();
        let local = unsafe { &*self.local.get() };
        if let Some(timer) = local.timers.peek() {
            if timer.expires <= now || unsafe { (*timer.strand).is_cancelled() } {
                return true;
            }
        }
        strands.iter().any(|s| s.has_runnable_work())
    }

    /// Gate-reset, final re-check, then wait (bounded by the nearest
    /// timer). Host only.
    ///
    /// The reset is a `swap`, not a store: reading the gate's latest value
    /// synchronises with the posters' `fetch_add`s, so any post made before
    /// the reset is visible to the re-check below.
    fn park(&self, strands: &[Arc<Strand>]) {
        let mut guard = self.park_mutex.lock();
        let pending = self.posted_messages.swap(0, Ordering::AcqRel);
        if pending != 0 || self.done.load(Ordering::Acquire) || self.has_immediate_work(strands) {
            return;
        }
        let deadline = unsafe { &*self.local.get() }.timers.peek().map(|t| t.expires);
        tracing::trace!(target: "weft::thread", thread = self.name, "parking");
        match deadline {
            Some(d) => {
                self.park_cond.wait_until(&mut guard, d);
            }
            None => {
                self.park_cond.wait(&mut guard);
            }
        }
    }

    /// The hosted OS thread's main loop.
    fn run(core: Arc<ThreadCore>) {
        let mut root = Box::new(Fiber::root());
        let mut ctx = Box::new(Context::for_thread(&*core as *const ThreadCore, &mut *root));
        context::install(&mut *ctx as *mut Context);
        tracing::info!(target: "weft::thread", thread = core.name, "started");

        let mut strands: Vec<Arc<Strand>> = Vec::new();
        let mut seen_epoch = usize::MAX;
        let mut spin: u32 = 0;

        while !core.done.load(Ordering::Acquire) {
            let epoch = core.strands_epoch.load(Ordering::Acquire);
            if epoch != seen_epoch {
                strands = core.strands.read().clone();
                seen_epoch = epoch;
            }

            core.drain_unblocks();
            core.process_timers();

            let mut progress = false;
            for strand in &strands {
                progress |= strand.run();
            }
            if progress {
                spin = 0;
                continue;
            }

            spin += 1;
            if spin > PARK_SPIN_LIMIT {
                core.park(&strands);
                spin = 0;
            }
        }

        for strand in &strands {
            for desc in strand.stuck_block_descs() {
                tracing::debug!(
                    target: "weft::thread",
                    thread = core.name,
                    strand = strand.name(),
                    blocked_on = desc,
                    "dropping blocked context at shutdown"
                );
            }
        }
        tracing::info!(target: "weft::thread", thread = core.name, "exiting");
        // Pending timers and blocked contexts die with the thread: the
        // fiber arena (and every stack in it) is dropped with `core`'s last
        // reference, after this frame unwinds.
    }
}

/// Handle to a runtime-owned OS thread. The thread starts immediately and
/// is joined on drop.
pub struct Thread {
    core: Arc<ThreadCore>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
    main_strand: Arc<Strand>,
}

impl Thread {
    pub fn new(name: &'static str) -> Self {
        let core = Arc::new(ThreadCore::new(name));
        let main_strand = Arc::new(Strand::with_host(name, Arc::downgrade(&core)));
        core.add_strand(main_strand.clone());

        let worker_core = core.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || ThreadCore::run(worker_core))
            .expect("failed to spawn weft thread");

        Self {
            core,
            handle: Mutex::new(Some(handle)),
            main_strand,
        }
    }

    pub fn name(&self) -> &'static str {
        self.core.name
    }

    /// The thread's built-in strand.
    pub fn strand(&self) -> &Arc<Strand> {
        &self.main_strand
    }

    /// Pin an additional strand to this thread.
    pub fn new_strand(&self, name: &'static str) -> Arc<Strand> {
        let strand = Arc::new(Strand::with_host(name, Arc::downgrade(&self.core)));
        self.core.add_strand(strand.clone());
        self.core.notify();
        strand
    }

    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.main_strand.post(f)
    }

    pub fn spawn<F, R>(&self, f: F) -> Result<Future<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.main_strand.spawn(f)
    }

    pub fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.main_strand.call(f)
    }

    /// Stop the run loop and wait for the OS thread to exit. Pending timers
    /// and blocked contexts are dropped. Idempotent.
    pub fn join(&self) {
        self.core.done.store(true, Ordering::Release);
        {
            let _lock = self.core.park_mutex.lock();
            self.core.park_cond.notify_one();
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!(target: "weft::thread", thread = self.core.name, "host thread panicked");
            }
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.join();
    }
}

/// Suspend the calling fiber until `deadline`. On a thread the runtime does
/// not own, this is a plain OS sleep.
pub fn sleep_until(deadline: Instant) {
    let ctx = context::current_ptr();
    unsafe {
        let strand = (*ctx).strand;
        if strand.is_null() {
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            }
            return;
        }
        let core = (*ctx).thread;
        debug_assert!(!core.is_null());
        let fiber = (*ctx).fiber;
        (*strand).block(fiber, "sleep");
        (*core).push_timer(deadline, strand, fiber);
        (*strand).suspend_current(fiber);
    }
}

/// Suspend the calling fiber for `duration`.
pub fn sleep_for(duration: Duration) {
    sleep_until(Instant::now() + duration);
}
