//! Packed atomic state words: the per-task completion/wake word and the
//! pool-wide spinning/notify-debt word.

use crate::loom::sync::atomic::{AtomicU64, Ordering};

/// Sentinel `wake_thread_id` meaning "an external (non-fast-path) thread
/// is parked waiting on this descriptor".
pub(crate) const EXTERNAL_THREAD_SENTINEL: u64 = u32::MAX as u64;

mycelium_bitfield::bitfield! {
    /// A snapshot of a `Task` descriptor's completion state:
    ///
    /// ```text
    /// | 63 .. 2          | 1             | 0    |
    /// | wake_thread_id    | wake_required | done |
    /// ```
    #[derive(PartialEq, Eq)]
    pub(crate) struct TaskSnapshot<u64> {
        /// Monotonically transitions `0 -> 1` exactly once.
        pub(crate) const DONE: bool;
        /// Set only while `DONE` is `0`: a thread has registered interest in
        /// being woken when this descriptor completes.
        pub(crate) const WAKE_REQUIRED: bool;
        /// Valid iff `WAKE_REQUIRED` is set. Either a worker index, a
        /// fast-path thread index, or [`EXTERNAL_THREAD_SENTINEL`].
        pub(crate) const WAKE_THREAD_ID = ..;
    }
}

/// Completion word for a `JoinDescriptor`/`ParallelForSlice`. Lives on the
/// awaiting thread's stack; accessed through a raw pointer by whichever
/// worker ends up executing the enqueued half.
#[derive(Debug)]
pub(crate) struct TaskState {
    word: AtomicU64,
}

impl TaskState {
    pub(crate) fn new() -> Self {
        Self {
            word: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_done(&self, ordering: Ordering) -> bool {
        TaskSnapshot(self.word.load(ordering)).get(TaskSnapshot::DONE)
    }

    /// Mark the descriptor done. Returns the wake target to notify, if any
    /// thread had registered one before completion was observed.
    pub(crate) fn mark_done(&self) -> Option<u64> {
        let prev = self.word.swap(TaskSnapshot::DONE.raw_mask(), Ordering::AcqRel);
        let prev = TaskSnapshot(prev);
        if prev.get(TaskSnapshot::WAKE_REQUIRED) {
            Some(prev.get(TaskSnapshot::WAKE_THREAD_ID))
        } else {
            None
        }
    }

    /// Register `thread_id` as wanting a wakeup when this descriptor
    /// completes. Returns `true` if the registration raced with completion
    /// (the caller must not wait, since no wakeup will ever arrive) — in
    /// that case `DONE` is already visible to the caller.
    pub(crate) fn register_waiter(&self, thread_id: u64) -> bool {
        let mut current = TaskSnapshot(self.word.load(Ordering::Acquire));
        loop {
            if current.get(TaskSnapshot::DONE) {
                return true;
            }
            let mut next = current;
            next.set(TaskSnapshot::WAKE_REQUIRED, true)
                .set(TaskSnapshot::WAKE_THREAD_ID, thread_id);
            match self.word.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return false,
                Err(actual) => current = TaskSnapshot(actual),
            }
        }
    }
}

/// The pool-wide "spinning state" word: how many workers are currently
/// busy-looping in `spin()`, and how many notifications have been
/// recorded as owed to spinners that haven't yet observed them
/// ("notify debt"). Packed by hand (two equal-status counters, rather than
/// one dominant field and "the rest") into the low/high halves of a `u64`.
#[derive(Debug)]
pub(crate) struct SpinState {
    word: AtomicU64,
}

const COUNT_SHIFT: u32 = 0;
const DEBT_SHIFT: u32 = 32;
const MASK32: u64 = u32::MAX as u64;

fn pack(spinning_count: u32, notify_debt: u32) -> u64 {
    ((spinning_count as u64) << COUNT_SHIFT) | ((notify_debt as u64) << DEBT_SHIFT)
}

fn unpack(word: u64) -> (u32, u32) {
    (
        ((word >> COUNT_SHIFT) & MASK32) as u32,
        ((word >> DEBT_SHIFT) & MASK32) as u32,
    )
}

impl SpinState {
    pub(crate) fn new() -> Self {
        Self {
            word: AtomicU64::new(pack(0, 0)),
        }
    }

    pub(crate) fn load(&self, ordering: Ordering) -> (u32, u32) {
        unpack(self.word.load(ordering))
    }

    /// Attempt to enter the spinning state: succeeds (and increments
    /// `spinningCount`) only if `spinningCount < max_spinning`.
    pub(crate) fn try_enter_spinning(&self, max_spinning: u32) -> bool {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let (count, debt) = unpack(current);
            if count.saturating_sub(debt) >= max_spinning {
                return false;
            }
            let next = pack(count + 1, debt);
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Leave the spinning state. If notify debt is outstanding, consume one
    /// unit of it and report that to the caller so it can perform one
    /// last `steal()` before parking.
    pub(crate) fn leave_spinning(&self) -> bool {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let (count, debt) = unpack(current);
            debug_assert!(count > 0, "leave_spinning called without a matching enter");
            let had_debt = debt > 0;
            let next = pack(count - 1, debt.saturating_sub(1));
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return had_debt,
                Err(actual) => current = actual,
            }
        }
    }

    /// Producer path (`wakeup_worker_if_required`): decide whether a real
    /// `notify()` is needed, or whether an existing spinner already covers
    /// this wakeup (in which case notify debt is incremented instead).
    /// Returns `true` if the caller must call `notify()`.
    pub(crate) fn record_wakeup(&self) -> bool {
        let mut current = self.word.load(Ordering::Relaxed);
        loop {
            let (count, debt) = unpack(current);
            if debt >= count {
                // Every spinner has already been informed; a real wakeup is
                // needed to rouse a parked worker.
                return true;
            }
            let next = pack(count, debt + 1);
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return false,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_mark_done_once() {
        let s = TaskState::new();
        assert!(!s.is_done(Ordering::Acquire));
        assert!(s.mark_done().is_none());
        assert!(s.is_done(Ordering::Acquire));
    }

    #[test]
    fn task_state_register_then_done_reports_waiter() {
        let s = TaskState::new();
        assert!(!s.register_waiter(7));
        let waiter = s.mark_done();
        assert_eq!(waiter, Some(7));
    }

    #[test]
    fn task_state_register_after_done_is_noop() {
        let s = TaskState::new();
        assert!(s.mark_done().is_none());
        // Registering after completion must report "already done" rather
        // than recording a waiter nobody will ever wake.
        assert!(s.register_waiter(3));
    }

    #[test]
    fn spin_state_respects_cap() {
        let s = SpinState::new();
        assert!(s.try_enter_spinning(1));
        assert!(!s.try_enter_spinning(1));
        s.leave_spinning();
        assert!(s.try_enter_spinning(1));
    }

    #[test]
    fn spin_state_wakeup_prefers_debt_when_spinners_uninformed() {
        let s = SpinState::new();
        assert!(s.try_enter_spinning(4));
        // One spinner, zero debt: a wakeup can be satisfied by debt alone.
        assert!(!s.record_wakeup());
        let (_, debt) = s.load(Ordering::Relaxed);
        assert_eq!(debt, 1);
        // Debt now equals spinner count: the next wakeup needs a real notify.
        assert!(s.record_wakeup());
    }
}
