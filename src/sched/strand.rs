//! Strand - a serialised task queue with its own fiber pool.
//!
//! Closures posted to a strand may come from any thread, but only the
//! strand's host thread ever executes them, and only one at a time. Tasks
//! may cooperatively block (on a promise, a timer, or a synchronous
//! cross-strand call), so the strand keeps a small pool of worker fibers:
//! when the running fiber suspends, dispatch continues on another.
//!
//! The post path is the multi-writer ring discipline: `claim(1)` on the
//! shared write cursor, move the closure into the slot, `publish_after`,
//! then notify the host thread. The consume path is a single read cursor
//! advanced by whichever worker fiber currently drains the ring.
//!
//! Dispatch priority inside [`Strand::suspend_current`] (the scheduler's
//! heart): unblock notifications, then expired timers, then ready fibers,
//! then new work from the task ring, and finally back to the host's run
//! loop.

use std::any::Any;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::panic::{ self, AssertUnwindSafe };
use std::ptr;
use std::sync::Weak;
use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering };

use crate::constants::STRAND_RING_SLOTS;
use crate::disruptor::cursor::{ ReadCursor, SharedWriteCursor };
use crate::disruptor::ring_buffer::RingBuffer;
use crate::disruptor::wait_strategy::SpinWait;
use crate::error::{ Result, WeftError };
use crate::fiber::context;
use crate::fiber::fiber::{ self, Fiber };
use crate::sched::thread::ThreadCore;
use crate::sync::promise::{ Future, Promise };
use crate::task::PostedTask;

struct BlockedEntry {
    fiber: *mut Fiber,
    desc: &'static str,
}

/// Owner-thread scheduling state. Touched only by the host thread.
struct StrandState {
    ready: VecDeque<*mut Fiber>,
    blocked: Vec<BlockedEntry>,
    /// The fiber to fall back to when nothing in this strand is runnable;
    /// set on entry to [`Strand::run`].
    run_loop: *mut Fiber,
}

pub struct Strand {
    name: &'static str,
    ring: RingBuffer<PostedTask>,
    post_cursor: SharedWriteCursor,
    read_cursor: ReadCursor,
    host: Weak<ThreadCore>,
    state: UnsafeCell<StrandState>,
    /// Worker fibers drawn and not yet retired (blocked ones included).
    active_fibers: AtomicUsize,
    /// Mirror of `state.blocked.len()` readable from any thread.
    blocked_count: AtomicUsize,
    cancelled: AtomicBool,
}

// Safety: `state` is only ever touched by the strand's host thread (all
// entry points either assert that or route through the host's rings); the
// shared surfaces are the cursors, the ring (under cursor discipline) and
// plain atomics.
unsafe impl Send for Strand {}
unsafe impl Sync for Strand {}

impl Strand {
    pub(crate) fn with_host(name: &'static str, host: Weak<ThreadCore>) -> Self {
        let ring = RingBuffer::new(STRAND_RING_SLOTS);
        let post_cursor = SharedWriteCursor::new(name, STRAND_RING_SLOTS);
        let read_cursor = ReadCursor::new(name);
        read_cursor.follows(&post_cursor);
        post_cursor.follows(&read_cursor);
        Self {
            name,
            ring,
            post_cursor,
            read_cursor,
            host,
            state: UnsafeCell::new(StrandState {
                ready: VecDeque::new(),
                blocked: Vec::new(),
                run_loop: ptr::null_mut(),
            }),
            active_fibers: AtomicUsize::new(0),
            blocked_count: AtomicUsize::new(0),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Contexts currently parked in this strand's blocked set.
    pub fn blocked_len(&self) -> usize {
        self.blocked_count.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Posting (any thread)
    // ------------------------------------------------------------------

    /// Post a fire-and-forget closure. Fails once the strand is cancelled.
    /// The closure captures must fit the inline slot payload.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_task(PostedTask::new(f))
    }

    fn post_task(&self, task: PostedTask) -> Result<()> {
        let slot = self.post_cursor.claim(1)?;
        // Safety: the claim gives us exclusive ownership of this slot until
        // it is published; the previous occupant was consumed by a worker.
        unsafe {
            *self.ring.get_mut(slot) = task;
        }
        self.post_cursor.publish_after(slot, slot - 1)?;
        self.notify();
        Ok(())
    }

    /// Post a closure and get a [`Future`] for its result. A panic inside
    /// the closure is captured into the promise and re-raised in the waiter.
    pub fn spawn<F, R>(&self, f: F) -> Result<Future<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let promise = std::sync::Arc::new(Promise::new("spawn"));
        let settled = promise.clone();
        self.post(move || {
            match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(v) => settled.set_value(v),
                Err(e) => settled.set_panic(e),
            }
        })?;
        Ok(Future::new(promise))
    }

    /// Synchronous cross-strand call: run `f` on this strand and block the
    /// calling context until it completes. The closure is posted *by
    /// reference* - no copy of the captures and no allocation - which is
    /// sound because the caller stays suspended (or spinning, from a
    /// foreign thread) until the task has finished with them.
    pub fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        let ctx = context::current_ptr();
        let mut result: Option<R> = None;
        let mut caught: Option<Box<dyn Any + Send>> = None;

        enum Waker {
            Fiber {
                strand: *const Strand,
                fiber: *mut Fiber,
            },
            Flag(*const AtomicBool),
        }
        // Safety: only raw pointers to the caller's pinned stack.
        unsafe impl Send for Waker {}

        let done = AtomicBool::new(false);
        let (waker, my_strand, my_fiber) = unsafe {
            let strand = (*ctx).strand;
            if strand.is_null() {
                (Waker::Flag(&done as *const AtomicBool), ptr::null(), ptr::null_mut())
            } else {
                let fiber = (*ctx).fiber;
                (Waker::Fiber { strand, fiber }, strand, fiber)
            }
        };

        let result_ptr = &mut result as *mut Option<R> as usize;
        let caught_ptr = &mut caught as *mut Option<Box<dyn Any + Send>> as usize;

        // Block before posting: the task may complete (and unblock us) from
        // another thread before we ever reach the suspend loop.
        if !my_strand.is_null() {
            unsafe { (*my_strand).block(my_fiber, "call") };
        }

        // Safety: the captures outlive the task because the caller does not
        // return from this frame until the waker has fired.
        let task = unsafe {
            PostedTask::new_unchecked(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(f));
                // Safety: the caller's frame is pinned until the waker
                // below fires, so these pointers are live.
                unsafe {
                    match outcome {
                        Ok(v) => *(result_ptr as *mut Option<R>) = Some(v),
                        Err(e) => *(caught_ptr as *mut Option<Box<dyn Any + Send>>) = Some(e),
                    }
                    match waker {
                        Waker::Fiber { strand, fiber } => (*strand).unblock(fiber),
                        Waker::Flag(flag) => (*flag).store(true, Ordering::Release),
                    }
                }
            })
        };

        if let Err(err) = self.post_task(task) {
            // Nothing was posted; take ourselves back off the blocked list.
            if !my_strand.is_null() {
                unsafe { (*my_strand).cancel_block(my_fiber) };
            }
            return Err(err);
        }

        if my_strand.is_null() {
            let mut wait = SpinWait::new();
            while !done.load(Ordering::Acquire) {
                wait.snooze();
            }
        } else {
            unsafe { (*my_strand).suspend_current(my_fiber) };
        }

        if let Some(payload) = caught {
            panic::resume_unwind(payload);
        }
        Ok(result.expect("call task completed without a result"))
    }

    /// Alert the post cursor: further posts fail, in-flight waits on the
    /// cursor unblock with the alert, and pending sleep timers for this
    /// strand fire immediately.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.post_cursor.set_alert(WeftError::Cancelled);
        tracing::debug!(target: "weft::strand", strand = self.name, "cancelled");
        self.notify();
    }

    /// Block until every worker fiber has exited and the task ring is
    /// drained. Must not be called from the strand's own host thread - the
    /// wait would starve the scheduler it is waiting on.
    pub fn wait(&self) {
        let ctx = context::current_ptr();
        if let Some(host) = self.host.upgrade() {
            assert!(
                !ptr::eq(unsafe { (*ctx).thread }, &*host as *const ThreadCore),
                "strand.wait() called from its own host thread"
            );
        }
        let mut wait = SpinWait::new();
        while self.active_fibers.load(Ordering::Acquire) > 0 || self.tasks_pending() {
            wait.snooze();
        }
    }

    // ------------------------------------------------------------------
    // Host-thread scheduling
    // ------------------------------------------------------------------

    /// True when posted slots are waiting to be consumed. Callable from any
    /// thread (used by `wait` and the host's park re-check).
    pub(crate) fn tasks_pending(&self) -> bool {
        let begin = self.read_cursor.begin();
        begin < self.read_cursor.end() || begin < self.read_cursor.check_end()
    }

    /// True when the host should not park: runnable fibers or posted tasks.
    /// Host thread only (reads owner state).
    pub(crate) fn has_runnable_work(&self) -> bool {
        let ready = unsafe { !(*self.state.get()).ready.is_empty() };
        ready || self.tasks_pending()
    }

    /// What the still-blocked contexts are waiting on; shutdown
    /// diagnostics. Host thread only.
    pub(crate) fn stuck_block_descs(&self) -> Vec<&'static str> {
        let state = unsafe { &*self.state.get() };
        state.blocked.iter().map(|e| e.desc).collect()
    }

    /// Drain ready fibers and posted tasks until nothing in this strand is
    /// runnable. Returns true if any progress was made. Host thread only.
    pub fn run(&self) -> bool {
        debug_assert!(self.on_host_thread(), "strand.run() from a foreign thread");
        let ctx = context::current_ptr();
        self.make_current();
        let prev_run_loop = unsafe {
            debug_assert!(!(*ctx).fiber.is_null());
            let state = &mut *self.state.get();
            let prev = state.run_loop;
            state.run_loop = (*ctx).fiber;
            prev
        };

        let mut progress = false;
        loop {
            let next = unsafe { (*self.state.get()).ready.pop_front() };
            if let Some(fiber) = next {
                progress = true;
                self.resume_fiber(fiber);
                continue;
            }
            if self.tasks_pending() {
                progress = true;
                let worker = self.obtain_worker();
                self.resume_fiber(worker);
                continue;
            }
            break;
        }

        unsafe {
            (*self.state.get()).run_loop = prev_run_loop;
            (*ctx).strand = ptr::null();
        }
        progress
    }

    /// Park `fiber` in the blocked set. Host thread only; the fiber must
    /// then suspend via [`Strand::suspend_current`].
    pub(crate) fn block(&self, fiber: *mut Fiber, desc: &'static str) {
        let ctx = context::current_ptr();
        unsafe {
            debug_assert!(self.on_host_thread(), "block() from a foreign thread");
            (*ctx).block_desc = desc;
            (*self.state.get()).blocked.push(BlockedEntry { fiber, desc });
        }
        self.blocked_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Make a blocked fiber runnable again. Safe to call from any thread:
    /// the foreign path goes through the host's unblock ring.
    pub(crate) fn unblock(&self, fiber: *mut Fiber) {
        let host = match self.host.upgrade() {
            Some(h) => h,
            None => return, // host thread already torn down
        };
        if self.on_host_thread() {
            self.unblock_local(fiber);
        } else {
            host.post_unblock(self as *const Strand, fiber);
        }
    }

    /// Undo a [`Strand::block`] that never suspended (the paired post
    /// failed). Host thread only.
    pub(crate) fn cancel_block(&self, fiber: *mut Fiber) {
        let state = unsafe { &mut *self.state.get() };
        if let Some(i) = state.blocked.iter().position(|e| ptr::eq(e.fiber, fiber)) {
            state.blocked.remove(i);
            self.blocked_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Move a fiber from the blocked set to the front of the ready deque.
    /// Host thread only.
    pub(crate) fn unblock_local(&self, fiber: *mut Fiber) {
        let state = unsafe { &mut *self.state.get() };
        match state.blocked.iter().position(|e| ptr::eq(e.fiber, fiber)) {
            Some(i) => {
                state.blocked.remove(i);
                self.blocked_count.fetch_sub(1, Ordering::AcqRel);
                state.ready.push_front(fiber);
            }
            None => {
                // Raced with another wake path (e.g. a timer for a fiber a
                // cancel already expired); nothing to do.
                tracing::trace!(target: "weft::strand", strand = self.name, "spurious unblock");
            }
        }
    }

    /// Suspend the current fiber until it leaves the blocked set, running
    /// other work from this strand in the meantime. The priority order here
    /// is the scheduler's core discipline: unblocks, timers, ready fibers,
    /// new workers, then fall back to the host run loop.
    pub(crate) fn suspend_current(&self, me: *mut Fiber) {
        loop {
            if let Some(host) = self.host.upgrade() {
                host.drain_unblocks();
                host.process_timers();
            }
            let state = self.state.get();
            let still_blocked = unsafe {
                (*state).blocked.iter().any(|e| ptr::eq(e.fiber, me))
            };
            if !still_blocked {
                self.make_current();
                return;
            }

            let next = unsafe { (*state).ready.pop_front() };
            if let Some(fiber) = next {
                debug_assert!(!ptr::eq(fiber, me));
                self.resume_fiber(fiber);
                continue;
            }
            if self.tasks_pending() {
                let worker = self.obtain_worker();
                self.resume_fiber(worker);
                continue;
            }

            let run_loop = unsafe { (*state).run_loop };
            debug_assert!(!run_loop.is_null() && !ptr::eq(run_loop, me));
            // Safety: both fibers are live for the thread's lifetime; `me`
            // is the executing fiber.
            unsafe { fiber::transfer(me, run_loop) };
            self.make_current();
        }
    }

    fn resume_fiber(&self, fiber: *mut Fiber) {
        unsafe {
            (*fiber).resume();
        }
        self.make_current();
        if unsafe { (*fiber).done() } {
            self.active_fibers.fetch_sub(1, Ordering::AcqRel);
            if let Some(host) = self.host.upgrade() {
                host.recycle_fiber(fiber);
            }
        }
    }

    /// Draw a worker fiber: the host's free list first, a fresh stack only
    /// when the list is empty.
    fn obtain_worker(&self) -> *mut Fiber {
        let host = self.host.upgrade().expect("strand host thread is gone");
        let strand_addr = self as *const Strand as usize;
        let body = crate::task::FiberBody::new(move || {
            // Safety: the strand outlives its host thread's run loop, which
            // is the only place worker fibers execute.
            unsafe { (*(strand_addr as *const Strand)).worker_loop() }
        });
        self.active_fibers.fetch_add(1, Ordering::AcqRel);
        host.obtain_fiber(body)
    }

    /// Worker fiber body: take tasks in slot order until the ring is empty.
    /// The closure is moved out of its slot and the read cursor advanced
    /// *before* invocation, so a task that suspends does not hold its slot
    /// (or a stale read position) hostage.
    fn worker_loop(&self) {
        self.make_current();
        loop {
            let pos = self.read_cursor.begin();
            if pos >= self.read_cursor.end() && pos >= self.read_cursor.check_end() {
                break;
            }
            // Safety: the slot at `pos` was published by the post cursor and
            // this strand's workers are the only consumers, serialised on
            // the host thread.
            let mut task = unsafe { self.ring.take(pos) };
            self.read_cursor.publish(pos);
            if task.is_empty() {
                continue;
            }
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.call())) {
                tracing::error!(
                    target: "weft::strand",
                    strand = self.name,
                    panic = panic_message(payload.as_ref()),
                    "posted task panicked"
                );
            }
            self.make_current();
        }
    }

    fn notify(&self) {
        if let Some(host) = self.host.upgrade() {
            host.notify();
        }
    }

    fn on_host_thread(&self) -> bool {
        let ctx = context::current_ptr();
        match self.host.upgrade() {
            Some(host) => ptr::eq(unsafe { (*ctx).thread }, &*host as *const ThreadCore),
            None => false,
        }
    }

    fn make_current(&self) {
        let ctx = context::current_ptr();
        unsafe {
            (*ctx).strand = self as *const Strand;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
