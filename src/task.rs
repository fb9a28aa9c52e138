//! Fixed-capacity inline callable.
//!
//! [`InlineTask`] stores a `FnOnce()` closure inside a fixed byte payload so
//! strand post rings and fiber bodies never touch the heap. A closure whose
//! captures exceed the payload (or its 16-byte alignment) is rejected at
//! compile time.
//!
//! The container is move-only: invoking it moves the closure out of the
//! slot, so a ring slot can be recycled the moment the task has been taken.

use std::mem::{ self, MaybeUninit };

use crate::constants::{ FIBER_BODY_BYTES, POSTED_TASK_BYTES };

/// Task posted to a strand's ring.
pub type PostedTask = InlineTask<POSTED_TASK_BYTES>;

/// A fiber's body.
pub type FiberBody = InlineTask<FIBER_BODY_BYTES>;

/// Maximum closure alignment the payload supports.
const PAYLOAD_ALIGN: usize = 16;

#[repr(align(16))]
struct Payload<const N: usize>([MaybeUninit<u8>; N]);

pub struct InlineTask<const N: usize> {
    call_fn: Option<unsafe fn(*mut u8)>,
    drop_fn: Option<unsafe fn(*mut u8)>,
    payload: Payload<N>,
}

// Safety: constructors only accept `F: Send`, and the payload is just the
// moved closure's bytes.
unsafe impl<const N: usize> Send for InlineTask<N> {}

impl<const N: usize> InlineTask<N> {
    /// An empty task (the state of every fresh ring slot).
    pub fn empty() -> Self {
        Self {
            call_fn: None,
            drop_fn: None,
            payload: Payload([MaybeUninit::uninit(); N]),
        }
    }

    /// Wrap a closure. Fails to compile if the captures do not fit the
    /// payload.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        // Safety: 'static closure, nothing borrowed.
        unsafe { Self::new_unchecked(f) }
    }

    /// Wrap a closure without the `'static` bound.
    ///
    /// # Safety
    /// Caller must guarantee everything the closure borrows outlives its
    /// invocation. Used by the strand's by-reference synchronous call,
    /// where the borrowing fiber stays suspended until the task completes.
    pub unsafe fn new_unchecked<F>(f: F) -> Self
    where
        F: FnOnce() + Send,
    {
        const {
            assert!(mem::size_of::<F>() <= N, "closure captures exceed the inline task payload");
            assert!(mem::align_of::<F>() <= PAYLOAD_ALIGN, "closure over-aligned for an inline task");
        }

        let mut task = Self::empty();
        let dst = task.payload.0.as_mut_ptr() as *mut F;
        std::ptr::write(dst, f);
        task.call_fn = Some(call_shim::<F>);
        task.drop_fn = Some(drop_shim::<F>);
        task
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.call_fn.is_none()
    }

    /// Invoke the stored closure, leaving the task empty. The closure is
    /// moved out of the payload before it runs, so the slot may be reused
    /// even if the closure suspends its fiber.
    pub fn call(&mut self) {
        let f = self.call_fn.take().expect("inline task invoked twice or never filled");
        self.drop_fn = None;
        unsafe { f(self.payload.0.as_mut_ptr() as *mut u8) }
    }
}

impl<const N: usize> Default for InlineTask<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> Drop for InlineTask<N> {
    fn drop(&mut self) {
        if let Some(d) = self.drop_fn.take() {
            unsafe { d(self.payload.0.as_mut_ptr() as *mut u8) }
        }
    }
}

unsafe fn call_shim<F: FnOnce()>(payload: *mut u8) {
    let f = std::ptr::read(payload as *mut F);
    f();
}

unsafe fn drop_shim<F>(payload: *mut u8) {
    std::ptr::drop_in_place(payload as *mut F);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{ AtomicUsize, Ordering };

    #[test]
    fn test_call_runs_closure_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let mut task = PostedTask::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!task.is_empty());
        task.call();
        assert!(task.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_uncalled_task_drops_captures() {
        let witness = Arc::new(());
        let w = witness.clone();
        let task = PostedTask::new(move || {
            let _ = &w;
        });
        drop(task);
        assert_eq!(Arc::strong_count(&witness), 1);
    }

    #[test]
    fn test_moved_task_still_callable() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = FiberBody::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let mut moved = task;
        moved.call();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "invoked twice")]
    fn test_double_call_panics() {
        let mut task = PostedTask::new(|| {});
        task.call();
        task.call();
    }

    #[test]
    fn test_payload_holds_a_full_capture_set() {
        // 96 bytes of captures fits the 104-byte posted-task payload.
        let blob = [0u64; 12];
        let mut task = PostedTask::new(move || {
            assert_eq!(blob[11], 0);
        });
        task.call();
    }
}
