//! Bounded, lock-reduced task deque.
//!
//! One owner thread pushes/pops the `front` (LIFO); any thread may steal
//! from the `back` (FIFO). Capacity is a fixed power of two; a full deque
//! never blocks — `push_front`/`push_back` simply return `false` and the
//! caller falls back to running the task inline.
//!
//! Same owner/stealer split as `crossbeam-deque`'s Chase-Lev deque, adapted
//! to a bounded ring buffer with inline-execution overflow instead of
//! unbounded growth.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use crate::loom::sync::atomic::{AtomicU64, Ordering};
use crate::pool::job::Task;

/// Default deque capacity. Must be a power of two.
pub(crate) const DEFAULT_CAPACITY: usize = 256;

/// A single slot in the ring buffer, claimed by exactly one `pop_back`
/// caller via an atomic ticket: contention between concurrent `pop_back`
/// callers is resolved by a single atomic ticket per slot.
struct Slot {
    /// Monotonically increasing stamp: `slot.stamp == index` means the slot
    /// holds a value pushed for logical index `index`. Used the way a
    /// bounded MPMC ring buffer (e.g. a single-producer variant of
    /// Vyukov's queue) stamps slots to arbitrate concurrent consumers.
    stamp: AtomicU64,
    value: UnsafeCell<MaybeUninit<Task>>,
}

unsafe impl Sync for Slot {}

/// A fixed-capacity, cache-line-separated double-ended task queue.
///
/// `front`/`back` are kept on separate cache lines (enforced with
/// `CachePadded`) so that the owner thread advancing `front` on the hot
/// path never false-shares with thieves advancing `back` — a conformance
/// test (`header_layout_avoids_false_sharing`, below) enforces a stride
/// greater than 127 bytes between them.
pub(crate) struct Deque {
    front: CachePadded<AtomicU64>,
    back: CachePadded<AtomicU64>,
    capacity: usize,
    mask: u64,
    slots: Box<[Slot]>,
}

// Safety: `front` is advanced only by the owner; `back` by any thread via
// CAS; slot contents are only read by whichever thread wins the stamp CAS.
unsafe impl Send for Deque {}
unsafe impl Sync for Deque {}

impl Deque {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "deque capacity must be a power of two");
        let slots = (0..capacity)
            .map(|i| Slot {
                stamp: AtomicU64::new(i as u64),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            front: CachePadded::new(AtomicU64::new(0)),
            back: CachePadded::new(AtomicU64::new(0)),
            capacity,
            mask: capacity as u64 - 1,
            slots,
        }
    }

    #[inline]
    fn index(&self, pos: u64) -> usize {
        (pos & self.mask) as usize
    }

    /// Owner-only. Pushes `task` as the most-recently-pushed item; the next
    /// `pop_front` returns it (LIFO). Fails if the deque is full.
    pub(crate) fn push_front(&self, task: Task) -> Result<(), Task> {
        let front = self.front.load(Ordering::Relaxed);
        let back = self.back.load(Ordering::Acquire);
        if front.wrapping_sub(back) as usize >= self.capacity {
            return Err(task);
        }

        let slot = &self.slots[self.index(front)];
        // Owner-exclusive slot: front is always one past the last
        // owner-written slot, so no thief can be contending for it yet
        // (thieves only ever claim slots in `[back, front)`).
        unsafe {
            (*slot.value.get()).write(task);
        }
        slot.stamp.store(front.wrapping_add(1), Ordering::Release);
        self.front.store(front.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Owner-only. Pops the newest task (LIFO order). Returns `None` if
    /// empty.
    pub(crate) fn pop_front(&self) -> Option<Task> {
        let mut front = self.front.load(Ordering::Relaxed);
        loop {
            let back = self.back.load(Ordering::Acquire);
            if front == back {
                return None;
            }
            let new_front = front.wrapping_sub(1);
            let slot = &self.slots[self.index(new_front)];
            let stamp = slot.stamp.load(Ordering::Acquire);
            if stamp != new_front.wrapping_add(1) {
                // A thief raced us and already claimed this slot via
                // `pop_back`; nothing left to take from the front.
                return None;
            }

            // The owner is the only writer of `front`, so this doesn't need
            // a CAS loop against other owners — only against thieves
            // advancing `back` into the same slot, handled above by the
            // stamp check.
            self.front.store(new_front, Ordering::Release);
            let value = unsafe { (*slot.value.get()).assume_init_read() };
            // Re-stamp so a future `push_front` at this index is visible to
            // thieves only after the new value is written.
            slot.stamp.store(new_front.wrapping_add(self.capacity as u64), Ordering::Release);
            front = new_front;
            let _ = front;
            return Some(value);
        }
    }

    /// Any thread. Pushes onto the back; used when enqueuing from a
    /// non-owner thread (external submission). Fails if full.
    pub(crate) fn push_back(&self, task: Task) -> Result<(), Task> {
        // Only the owner calls `push_back` on its own deque in this crate's
        // usage (the owner always uses `push_front`); `push_back` from a
        // foreign thread targets *another* worker's deque purely to
        // inject work, so it must use the same ticketed-slot protocol as
        // `pop_back` to avoid racing the owner's `push_front`/`pop_front`.
        //
        // We implement this conservatively: reserve a back slot via CAS on
        // `back`, then claim the matching stamp before writing.
        let mut back = self.back.load(Ordering::Relaxed);
        loop {
            let front = self.front.load(Ordering::Acquire);
            if front.wrapping_sub(back) as usize >= self.capacity {
                return Err(task);
            }
            match self.back.compare_exchange_weak(
                back,
                back.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => back = actual,
            }
        }

        let slot = &self.slots[self.index(back)];
        unsafe {
            (*slot.value.get()).write(task);
        }
        slot.stamp.store(back.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Any thread. Pops the oldest task (FIFO) — used for stealing.
    /// Returns `None` if empty or if this caller lost the per-slot ticket
    /// race to another thief.
    pub(crate) fn pop_back(&self) -> Option<Task> {
        let back = self.back.load(Ordering::Relaxed);
        let front = self.front.load(Ordering::Acquire);
        if back == front {
            return None;
        }

        let slot = &self.slots[self.index(back)];
        let expected_stamp = back.wrapping_add(1);
        let stamp = slot.stamp.load(Ordering::Acquire);
        if stamp != expected_stamp {
            // Either not yet published by the owner, or already claimed.
            return None;
        }

        // Win the slot with a single CAS on `back`: the thief that
        // successfully advances `back` owns the value.
        if self
            .back
            .compare_exchange(back, back.wrapping_add(1), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }

        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.stamp
            .store(back.wrapping_add(self.capacity as u64), Ordering::Release);
        Some(value)
    }

    /// Best-effort observation; no ordering guarantee against concurrent
    /// pushes/pops.
    pub(crate) fn is_empty(&self) -> bool {
        let front = self.front.load(Ordering::Relaxed);
        let back = self.back.load(Ordering::Relaxed);
        front == back
    }

    /// Best-effort observation of whether a steal is likely to succeed.
    pub(crate) fn has_stealable_tasks(&self) -> bool {
        !self.is_empty()
    }
}

impl Drop for Deque {
    fn drop(&mut self) {
        // Drain any tasks still resident so their closures run destructors
        // (shutdown drains deques by running pending tasks; this only
        // fires if a deque is dropped with tasks left, e.g. mid-panic).
        while self.pop_front().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::job::Task;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc;

    fn counting_task(counter: Arc<AtomicUsize>) -> Task {
        Task::dispatch(move || {
            counter.fetch_add(1, StdOrdering::SeqCst);
        })
    }

    #[test]
    fn front_is_lifo() {
        let deque = Deque::new(4);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            deque
                .push_front(Task::dispatch(move || order.lock().unwrap().push(i)))
                .unwrap();
        }
        for _ in 0..3 {
            let task = deque.pop_front().unwrap();
            task.run();
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn back_is_fifo() {
        let deque = Deque::new(4);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            deque
                .push_front(Task::dispatch(move || order.lock().unwrap().push(i)))
                .unwrap();
        }
        for _ in 0..3 {
            let task = deque.pop_back().unwrap();
            task.run();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn overflow_reports_full_instead_of_blocking() {
        let deque = Deque::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        assert!(deque.push_front(counting_task(counter.clone())).is_ok());
        assert!(deque.push_front(counting_task(counter.clone())).is_ok());
        let rejected = deque.push_front(counting_task(counter.clone()));
        assert!(rejected.is_err());
    }

    #[test]
    fn concurrent_steals_each_claim_a_distinct_task() {
        use std::thread;

        let deque = Arc::new(Deque::new(64));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            deque.push_front(counting_task(counter.clone())).unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let deque = deque.clone();
                thread::spawn(move || {
                    let mut taken = 0;
                    while let Some(task) = deque.pop_back() {
                        task.run();
                        taken += 1;
                    }
                    taken
                })
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(counter.load(StdOrdering::SeqCst), 50);
    }

    #[test]
    fn header_layout_avoids_false_sharing() {
        let deque = Deque::new(4);
        let front_addr = std::ptr::addr_of!(deque.front) as usize;
        let back_addr = std::ptr::addr_of!(deque.back) as usize;
        let stride = front_addr.abs_diff(back_addr);
        assert!(stride > 127, "front/back stride was only {stride} bytes");
    }

    proptest::proptest! {
        #[test]
        fn push_front_pop_front_is_always_lifo(values in proptest::collection::vec(0i32..1000, 0..64)) {
            let deque = Deque::new(128);
            let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
            for &v in &values {
                let seen = seen.clone();
                deque.push_front(Task::dispatch(move || seen.lock().unwrap().push(v))).unwrap();
            }
            while let Some(task) = deque.pop_front() {
                task.run();
            }
            let expected: Vec<i32> = values.into_iter().rev().collect();
            assert_eq!(*seen.lock().unwrap(), expected);
        }

        #[test]
        fn push_front_pop_back_is_always_fifo(values in proptest::collection::vec(0i32..1000, 0..64)) {
            let deque = Deque::new(128);
            let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
            for &v in &values {
                let seen = seen.clone();
                deque.push_front(Task::dispatch(move || seen.lock().unwrap().push(v))).unwrap();
            }
            while let Some(task) = deque.pop_back() {
                task.run();
            }
            assert_eq!(*seen.lock().unwrap(), values);
        }
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::pool::job::Task;

    /// Model-checks that two threads racing `pop_back` against the same
    /// deque never both claim the same logical slot.
    #[test]
    fn concurrent_pop_back_claims_are_disjoint() {
        loom::model(|| {
            let deque = loom::sync::Arc::new(Deque::new(4));
            let counter = loom::sync::Arc::new(loom::sync::atomic::AtomicUsize::new(0));
            for _ in 0..2 {
                let counter = counter.clone();
                deque
                    .push_front(Task::dispatch(move || {
                        counter.fetch_add(1, loom::sync::atomic::Ordering::SeqCst);
                    }))
                    .unwrap();
            }

            let threads: Vec<_> = (0..2)
                .map(|_| {
                    let deque = deque.clone();
                    loom::thread::spawn(move || {
                        if let Some(task) = deque.pop_back() {
                            task.run();
                        }
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }

            assert_eq!(counter.load(loom::sync::atomic::Ordering::SeqCst), 2);
        });
    }
}
