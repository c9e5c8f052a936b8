//! Task descriptors.
//!
//! Three shapes of work flow through a worker's deque:
//!
//! - `Dispatch`: a boxed, heap-owned `FnOnce()` submitted via
//!   [`crate::pool::Pool::dispatch`]. Nobody waits on it.
//! - `Join`: one half of a `join(a, b)` call, represented as a raw pointer
//!   to a [`JoinDescriptor`] that lives on the calling thread's stack. The
//!   pointee outlives every use of the pointer because the caller blocks
//!   (or helps steal work) until [`TaskState::is_done`] is observed true.
//! - `ParallelForSlice`: similarly a raw pointer to a stack-resident
//!   [`ParallelForSlice`] describing one half of a recursively-halved
//!   range.
//!
//! The boxed-vs-stack split mirrors a LIFO slot holding a thin handle to a
//! heap task alongside a `StackJob`-style descriptor: a job reference built
//! from a borrow of stack-resident state, run by whichever thread pops it,
//! with the caller spinning on its completion flag until it flips.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::pool::state::TaskState;
use crate::pool::ComputePool;

/// A boxed, type-erased `FnOnce()`, heap-allocated so it can outlive the
/// call that created it. The raw-pointer `Join`/`ParallelFor` variants
/// below are the unmanaged counterpart; a plain `dispatch` closure is
/// simply owned.
pub(crate) struct DispatchTaskHolder {
    f: Box<dyn FnOnce() + Send + 'static>,
}

impl DispatchTaskHolder {
    fn run(self) {
        (self.f)();
    }
}

/// One half of a `join(a, b)` invocation. Lives on the stack of the thread
/// that called `join`; the other half may be picked up and run by a
/// different worker via a raw pointer, so every field the worker touches is
/// behind `TaskState`'s atomics or written only before publication / read
/// only after `TaskState::is_done`.
pub(crate) struct JoinDescriptor {
    state: TaskState,
    closure: Option<Box<dyn FnOnce() + Send>>,
    panic: Option<Box<dyn std::any::Any + Send + 'static>>,
}

impl JoinDescriptor {
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send,
    {
        Self {
            state: TaskState::new(),
            closure: Some(Box::new(f)),
            panic: None,
        }
    }

    pub(crate) fn state(&self) -> &TaskState {
        &self.state
    }

    /// Run the closure, catching panics so the other half of the `join`
    /// always observes completion — a panicking side must not deadlock the
    /// cooperating side.
    ///
    /// # Safety
    /// Caller must guarantee no other thread calls `execute` concurrently
    /// and that `self` stays alive until `state().is_done()` is observed.
    pub(crate) unsafe fn execute(ptr: *const JoinDescriptor) {
        let this = &mut *(ptr as *mut JoinDescriptor);
        let closure = this.closure.take().expect("JoinDescriptor executed twice");
        let result = catch_unwind(AssertUnwindSafe(closure));
        if let Err(payload) = result {
            this.panic = Some(payload);
        }
        if let Some(waiter) = this.state.mark_done() {
            super::park::notify_thread(waiter);
        }
    }

    /// Takes the recorded panic payload, if the closure panicked. Call only
    /// after `state().is_done()`.
    pub(crate) fn take_panic(&mut self) -> Option<Box<dyn std::any::Any + Send + 'static>> {
        self.panic.take()
    }
}

/// One half of a recursively-halved `parallel_for` range (grain size
/// `n / parallelism`, adaptive down to 1).
pub(crate) struct ParallelForSlice<'a> {
    state: TaskState,
    start: usize,
    end: usize,
    grain: usize,
    total: usize,
    body: &'a (dyn Fn(usize) + Sync),
    pool: &'a ComputePool,
    panic: Option<Box<dyn std::any::Any + Send + 'static>>,
}

impl<'a> ParallelForSlice<'a> {
    pub(crate) fn new(
        start: usize,
        end: usize,
        grain: usize,
        total: usize,
        body: &'a (dyn Fn(usize) + Sync),
        pool: &'a ComputePool,
    ) -> Self {
        Self {
            state: TaskState::new(),
            start,
            end,
            grain,
            total,
            body,
            pool,
            panic: None,
        }
    }

    pub(crate) fn state(&self) -> &TaskState {
        &self.state
    }

    pub(crate) fn range(&self) -> (usize, usize) {
        (self.start, self.end)
    }

    pub(crate) fn grain(&self) -> usize {
        self.grain
    }

    pub(crate) fn body(&self) -> &'a (dyn Fn(usize) + Sync) {
        self.body
    }

    /// Run this half to completion, catching panics the same way
    /// `JoinDescriptor` does. If the range is still larger than `grain`,
    /// this keeps halving through the owning pool rather than flattening
    /// the whole range into one thread's loop, so a stolen slice fans out
    /// across further thieves exactly like the slice it was split from.
    ///
    /// # Safety
    /// Same contract as [`JoinDescriptor::execute`].
    pub(crate) unsafe fn execute_leaf(ptr: *const ParallelForSlice<'_>) {
        let this = &mut *(ptr as *mut ParallelForSlice<'_>);
        let (start, end, grain, total, body, pool) =
            (this.start, this.end, this.grain, this.total, this.body, this.pool);
        let result = catch_unwind(AssertUnwindSafe(|| {
            pool.parallel_for_recursive(start, end, grain, body, total);
        }));
        if let Err(payload) = result {
            this.panic = Some(payload);
        }
        if let Some(waiter) = this.state.mark_done() {
            super::park::notify_thread(waiter);
        }
    }

    pub(crate) fn take_panic(&mut self) -> Option<Box<dyn std::any::Any + Send + 'static>> {
        self.panic.take()
    }
}

/// A unit of work resident in a [`super::deque::Deque`].
///
/// `Join`/`ParallelFor` carry raw pointers rather than references because
/// the descriptor is borrowed mutably by `execute`/`execute_leaf` from
/// whichever thread runs it, while the owning stack frame still holds its
/// own reference for the `is_done` poll — a lifetime the borrow checker
/// can't express across a thread-pool hand-off, so this is an accepted
/// unsafety boundary rather than something the type system tracks.
pub(crate) enum Task {
    Dispatch(DispatchTaskHolder),
    Join(*const JoinDescriptor),
    /// Type-erased pointer to a `ParallelForSlice<'a>` for whatever `'a` the
    /// enqueuing call used — raw pointers carry no borrow-checked lifetime,
    /// so erasure to `*const ()` avoids pretending the pointee is `'static`.
    ParallelFor(*const ()),
}

// Safety: `Dispatch` owns a `Send` closure outright. `Join`/`ParallelFor`
// point at stack descriptors whose referents are themselves `Send` (the
// closures/body they wrap are `Send`/`Sync`), and the pointee is kept alive
// by the originating frame until completion is observed.
unsafe impl Send for Task {}

impl Task {
    pub(crate) fn dispatch<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task::Dispatch(DispatchTaskHolder { f: Box::new(f) })
    }

    pub(crate) fn from_join(descriptor: *const JoinDescriptor) -> Self {
        Task::Join(descriptor)
    }

    pub(crate) fn from_parallel_for(slice: *const ParallelForSlice<'_>) -> Self {
        Task::ParallelFor(slice as *const ())
    }

    /// Run this task to completion on the current thread.
    ///
    /// # Safety
    /// For `Join`/`ParallelFor` variants, the pointee must still be alive
    /// and not already executed.
    pub(crate) fn run(self) {
        match self {
            Task::Dispatch(holder) => holder.run(),
            Task::Join(ptr) => unsafe { JoinDescriptor::execute(ptr) },
            Task::ParallelFor(ptr) => unsafe {
                ParallelForSlice::execute_leaf(ptr as *const ParallelForSlice<'_>)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn join_descriptor_runs_once_and_reports_done() {
        let counter = AtomicUsize::new(0);
        let descriptor = JoinDescriptor::new(|| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        unsafe {
            JoinDescriptor::execute(&descriptor as *const _);
        }
        assert!(descriptor.state().is_done(crate::loom::sync::atomic::Ordering::Acquire));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn join_descriptor_captures_panic_without_propagating() {
        let mut descriptor = JoinDescriptor::new(|| panic!("boom"));
        unsafe {
            JoinDescriptor::execute(&descriptor as *const _);
        }
        assert!(descriptor.take_panic().is_some());
    }

    #[test]
    fn parallel_for_slice_runs_every_index_once() {
        let pool = crate::pool::PoolBuilder::new().worker_threads(1).build();
        let seen = std::sync::Mutex::new(Vec::new());
        let body = |i: usize| seen.lock().unwrap().push(i);
        let slice = ParallelForSlice::new(2, 5, 3, 5, &body, &pool);
        unsafe {
            ParallelForSlice::execute_leaf(&slice as *const _);
        }
        let mut got = seen.lock().unwrap().clone();
        got.sort_unstable();
        assert_eq!(got, vec![2, 3, 4]);
        pool.shut_down();
    }
}
