//! Non-blocking parking protocol.
//!
//! A worker that finds no work must be able to commit to sleeping without
//! racing a concurrent wakeup into a lost notification. The ticketed
//! `pre_wait`/`cancel_wait`/`commit_wait`/`notify` protocol below is a
//! Dekker-style publish/observe pattern: a worker publishes intent to wait
//! (`pre_wait`), re-checks its condition, and only then either cancels
//! (work appeared) or commits (actually blocks) — `notify` bumps a ticket
//! so a `commit_wait` that raced a `notify` returns immediately instead of
//! blocking.
//!
//! Built on a counter-plus-condvar pair rather than raw `park`/`unpark` to
//! avoid the lost-wakeup-between-the-empty-check-and-blocking bug that
//! design is prone to.

use crate::loom::sync::atomic::{AtomicU64, Ordering};
use crate::loom::sync::ConditionMutex;

/// One worker's parking station. `ticket` increments on every `notify`;
/// a `commit_wait` call captures the ticket at `pre_wait` time and only
/// blocks if it's unchanged when it actually locks.
pub(crate) struct ParkingSpot {
    ticket: AtomicU64,
    gate: ConditionMutex<()>,
}

/// A `pre_wait` token. Must be consumed by exactly one of
/// `cancel_wait`/`commit_wait`.
pub(crate) struct WaitToken {
    observed_ticket: u64,
}

impl ParkingSpot {
    pub(crate) fn new() -> Self {
        Self {
            ticket: AtomicU64::new(0),
            gate: ConditionMutex::new(()),
        }
    }

    /// Publish intent to wait. The caller must re-check its wake condition
    /// (e.g. "is there stealable work now") *after* this call and before
    /// `commit_wait`, the same way a condvar-based wait re-checks its
    /// predicate under the lock.
    pub(crate) fn pre_wait(&self) -> WaitToken {
        WaitToken {
            observed_ticket: self.ticket.load(Ordering::Acquire),
        }
    }

    /// Abandon a pending wait: work appeared between `pre_wait` and here.
    pub(crate) fn cancel_wait(&self, _token: WaitToken) {}

    /// Block until `notify` is called with a ticket newer than the one
    /// observed at `pre_wait`, or return immediately if a `notify` already
    /// happened in between (no lost wakeup).
    pub(crate) fn commit_wait(&self, token: WaitToken) {
        let mut guard = self.gate.lock();
        guard.await_pred(|_| self.ticket.load(Ordering::Acquire) != token.observed_ticket);
    }

    /// Wake whichever worker is parked here (if any), bumping the ticket so
    /// a concurrent `commit_wait` can't miss this notification.
    pub(crate) fn notify(&self) {
        // Lock around the bump so a `commit_wait` either observes the new
        // ticket before blocking (and returns immediately) or is already
        // parked on the condvar and gets woken by `notify_all` below —
        // never both missed.
        let guard = self.gate.lock();
        self.ticket.fetch_add(1, Ordering::AcqRel);
        guard.notify_all();
    }
}

/// Global registry used by [`crate::pool::job::JoinDescriptor::execute`] and
/// [`crate::pool::job::ParallelForSlice::execute_leaf`] to wake the specific
/// thread id recorded in a `TaskState`'s `wake_thread_id` field, without
/// those call sites needing a reference to the owning pool.
///
/// Generalized to address an arbitrary worker/fast-path thread id rather
/// than "any idle worker", since the caller needs to wake the *specific*
/// thread that registered interest, not just any parked one.
pub(crate) fn notify_thread(thread_id: u64) {
    if let Some(registry) = registry() {
        registry.notify(thread_id);
    }
}

/// The set of parking spots a pool's worker/fast-path threads register
/// into, indexed by thread id (`EXTERNAL_THREAD_SENTINEL` included as one
/// more slot).
pub(crate) struct ParkingRegistry {
    spots: Vec<ParkingSpot>,
    external: ParkingSpot,
}

impl ParkingRegistry {
    pub(crate) fn new(worker_count: usize) -> Self {
        Self {
            spots: (0..worker_count).map(|_| ParkingSpot::new()).collect(),
            external: ParkingSpot::new(),
        }
    }

    pub(crate) fn spot(&self, thread_id: u64) -> &ParkingSpot {
        if thread_id == super::state::EXTERNAL_THREAD_SENTINEL {
            &self.external
        } else {
            &self.spots[thread_id as usize]
        }
    }

    fn notify(&self, thread_id: u64) {
        self.spot(thread_id).notify();
    }
}

crate::loom::thread_local! {
    static THREAD_PARKING_REGISTRY: std::cell::RefCell<Option<std::sync::Arc<ParkingRegistry>>> =
        std::cell::RefCell::new(None);
}

/// Bind the calling thread to a pool's parking registry, so
/// [`notify_thread`] can reach it from inside `execute`/`execute_leaf`
/// without threading a pool reference through every task descriptor.
pub(crate) fn bind_registry(registry: std::sync::Arc<ParkingRegistry>) {
    THREAD_PARKING_REGISTRY.with(|cell| {
        *cell.borrow_mut() = Some(registry);
    });
}

pub(crate) fn unbind_registry() {
    THREAD_PARKING_REGISTRY.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

fn registry() -> Option<std::sync::Arc<ParkingRegistry>> {
    THREAD_PARKING_REGISTRY.with(|cell| cell.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn commit_wait_returns_immediately_if_notified_between_pre_wait_and_commit() {
        let spot = Arc::new(ParkingSpot::new());
        let token = spot.pre_wait();
        spot.notify();
        // Must not block: the notify happened after pre_wait's snapshot.
        spot.commit_wait(token);
    }

    #[test]
    fn notify_wakes_a_committed_waiter() {
        let spot = Arc::new(ParkingSpot::new());
        let token = spot.pre_wait();
        let waiter = {
            let spot = spot.clone();
            thread::spawn(move || spot.commit_wait(token))
        };
        thread::sleep(Duration::from_millis(20));
        spot.notify();
        waiter.join().unwrap();
    }

    #[test]
    fn registry_routes_notify_to_the_right_slot() {
        let registry = Arc::new(ParkingRegistry::new(2));
        let token0 = registry.spot(0).pre_wait();
        let token1 = registry.spot(1).pre_wait();
        registry.notify(1);
        registry.spot(1).commit_wait(token1);
        registry.spot(0).cancel_wait(token0);
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;

    /// Model-checks the no-lost-wakeup handshake: a `notify()` that races a
    /// `commit_wait()` must either be observed by `pre_wait`'s ticket
    /// snapshot (so `commit_wait` returns immediately) or by the condvar
    /// wait itself — never neither.
    #[test]
    fn notify_racing_commit_wait_is_never_lost() {
        loom::model(|| {
            let spot = loom::sync::Arc::new(ParkingSpot::new());
            let token = spot.pre_wait();

            let notifier = {
                let spot = spot.clone();
                loom::thread::spawn(move || spot.notify())
            };

            spot.commit_wait(token);
            notifier.join().unwrap();
        });
    }
}
