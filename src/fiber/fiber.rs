//! Stackful cooperative fibers.
//!
//! A fiber is a saved machine context plus an inline body on a private,
//! guard-paged stack. Control moves between fibers with `start` / `resume`
//! (which record the caller, so an exiting fiber hands control back) and
//! `yield_to` (which deliberately does not, preserving the caller chain).
//!
//! A body that returns or panics finishes the fiber: the panic payload is
//! parked in the fiber's exit slot, `done` is set, and the payload is
//! re-raised in whoever called `start`/`resume` next. A finished fiber's
//! stack can be re-primed with a new body via [`Fiber::reset`], which is how
//! the scheduler's free list reuses stacks instead of growing without bound.

use std::any::Any;
use std::panic::{ self, AssertUnwindSafe };
use std::ptr;

use crate::fiber::arch;
use crate::fiber::context::{ self, Context };
use crate::fiber::stack::FiberStack;
use crate::task::FiberBody;

pub struct Fiber {
    /// Saved stack pointer; opaque machine context.
    sp: usize,
    /// `None` for a root fiber (an OS thread's native stack).
    stack: Option<FiberStack>,
    body: Option<FiberBody>,
    /// Who last entered this fiber via `start`/`resume`; control returns
    /// here when the body finishes.
    caller: *mut Fiber,
    exit_panic: Option<Box<dyn Any + Send>>,
    done: bool,
}

impl Fiber {
    /// A fiber wrapping the current native stack. Never primed; its context
    /// is written by the first switch away from it.
    pub fn root() -> Self {
        Self {
            sp: 0,
            stack: None,
            body: None,
            caller: ptr::null_mut(),
            exit_panic: None,
            done: false,
        }
    }

    /// A fresh fiber that will run `body` on `stack`.
    pub fn spawn(body: FiberBody, stack: FiberStack) -> Box<Self> {
        let mut fiber = Box::new(Self {
            sp: 0,
            stack: Some(stack),
            body: Some(body),
            caller: ptr::null_mut(),
            exit_panic: None,
            done: false,
        });
        fiber.prime();
        fiber
    }

    /// Re-prime a finished fiber with a new body, reusing its stack.
    pub fn reset(&mut self, body: FiberBody) {
        assert!(self.done, "reset of a fiber that has not finished");
        self.done = false;
        self.exit_panic = None;
        self.body = Some(body);
        self.prime();
    }

    fn prime(&mut self) {
        let top = self.stack.as_ref().expect("root fibers cannot be primed").top();
        let data = self as *mut Fiber as *mut u8;
        self.sp = unsafe { arch::prepare_stack(top, fiber_entry, data) };
    }

    pub fn done(&self) -> bool {
        self.done
    }

    /// Run the fiber until it yields or finishes. Returns `done`, or
    /// re-raises the panic that escaped the body.
    pub fn start(&mut self) -> bool {
        assert!(!self.done, "start of a finished fiber");
        let ctx = context::current_ptr();
        let caller = unsafe { (*ctx).fiber };
        debug_assert!(!ptr::eq(caller, self as *mut Fiber), "fiber cannot start itself");
        self.caller = caller;
        unsafe { transfer(caller, self as *mut Fiber) };
        self.finish_switch()
    }

    /// Same as [`Fiber::start`]: the caller is whatever fiber is current.
    pub fn resume(&mut self) -> bool {
        self.start()
    }

    /// Jump to another fiber without updating its caller, so that when it
    /// exits, control returns to whoever originally entered it. May only be
    /// called from the current fiber.
    pub fn yield_to(&mut self, other: &mut Fiber) {
        let me = self as *mut Fiber;
        debug_assert!(
            ptr::eq(unsafe { (*context::current_ptr()).fiber }, me),
            "yield_to from a fiber that is not current"
        );
        unsafe { transfer(me, other as *mut Fiber) };
    }

    /// Yield back to this fiber's caller.
    pub fn yield_now(&mut self) {
        let caller = self.caller;
        assert!(!caller.is_null(), "fiber has no caller to yield to");
        unsafe { self.yield_to(&mut *caller) };
    }

    fn finish_switch(&mut self) -> bool {
        if let Some(payload) = self.exit_panic.take() {
            debug_assert!(self.done);
            panic::resume_unwind(payload);
        }
        self.done
    }
}

/// The single place that switches machine contexts and the only writer of
/// the context's current-fiber field.
///
/// # Safety
/// Both pointers must be valid fibers; `from` must be the fiber actually
/// executing on this thread.
pub(crate) unsafe fn transfer(from: *mut Fiber, to: *mut Fiber) {
    let ctx = context::current_ptr();
    debug_assert!(ptr::eq((*ctx).fiber, from));
    (*ctx).fiber = to;

    let word = arch::switch_context(&mut (*from).sp, &(*to).sp, ctx as usize);

    // `from` is running again. The context may in principle have moved with
    // it, so re-derive it from the transfer word rather than trusting the
    // stack frame.
    let ctx = word as *mut Context;
    debug_assert!(ptr::eq(ctx, context::current_ptr()));
    (*ctx).fiber = from;
}

extern "C" fn fiber_entry(word: usize, data: *mut u8) -> ! {
    let fiber = data as *mut Fiber;
    unsafe {
        let ctx = word as *mut Context;
        debug_assert!(ptr::eq(ctx, context::current_ptr()));
        debug_assert!(ptr::eq((*ctx).fiber, fiber));

        if let Some(mut body) = (*fiber).body.take() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| body.call())) {
                tracing::debug!(target: "weft::fiber", "fiber body panicked; parking payload");
                (*fiber).exit_panic = Some(payload);
            }
        }
        (*fiber).done = true;

        let caller = (*fiber).caller;
        debug_assert!(!caller.is_null(), "finished fiber has no caller");
        transfer(fiber, caller);
    }
    unreachable!("finished fiber was resumed");
}
