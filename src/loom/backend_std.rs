//! Production backend: `std` atomics/threads with `parking_lot` behind
//! `ConditionMutex`.

#[cfg(not(loom))]
pub(crate) mod sync {
    pub(crate) use std::sync::Arc;

    pub(crate) mod atomic {
        pub(crate) use std::sync::atomic::Ordering;
        pub(crate) use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize};
    }

    /// A plain mutex, used where no condition variable is needed.
    pub(crate) struct Mutex<T> {
        inner: parking_lot::Mutex<T>,
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: parking_lot::Mutex::new(value),
            }
        }

        pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, T> {
            self.inner.lock()
        }
    }

    /// A mutex paired with a condvar where `unlock` wakes exactly one
    /// waiter and `await(pred)` blocks while `pred` is false, re-checking
    /// it on every wake.
    pub(crate) struct ConditionMutex<T> {
        mutex: parking_lot::Mutex<T>,
        condvar: parking_lot::Condvar,
    }

    pub(crate) struct ConditionMutexGuard<'a, T> {
        guard: Option<parking_lot::MutexGuard<'a, T>>,
        condvar: &'a parking_lot::Condvar,
    }

    impl<T> ConditionMutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                mutex: parking_lot::Mutex::new(value),
                condvar: parking_lot::Condvar::new(),
            }
        }

        pub(crate) fn lock(&self) -> ConditionMutexGuard<'_, T> {
            ConditionMutexGuard {
                guard: Some(self.mutex.lock()),
                condvar: &self.condvar,
            }
        }
    }

    impl<'a, T> ConditionMutexGuard<'a, T> {
        /// Release the lock, waking exactly one waiter parked in `await`.
        pub(crate) fn unlock(mut self) {
            let guard = self.guard.take().expect("guard already consumed");
            drop(guard);
            self.condvar.notify_one();
        }

        /// Block while `pred(&*self)` is false, waking up to re-check on
        /// every `notify_one`/`notify_all`. Must be called while locked.
        pub(crate) fn await_pred(&mut self, mut pred: impl FnMut(&T) -> bool) {
            let mut guard = self.guard.take().expect("guard already consumed");
            while !pred(&guard) {
                guard = self.condvar.wait(guard);
            }
            self.guard = Some(guard);
        }

        pub(crate) fn notify_all(&self) {
            self.condvar.notify_all();
        }
    }

    impl<'a, T> std::ops::Deref for ConditionMutexGuard<'a, T> {
        type Target = T;
        fn deref(&self) -> &T {
            self.guard.as_ref().expect("guard already consumed")
        }
    }

    impl<'a, T> std::ops::DerefMut for ConditionMutexGuard<'a, T> {
        fn deref_mut(&mut self) -> &mut T {
            self.guard.as_mut().expect("guard already consumed")
        }
    }
}

#[cfg(not(loom))]
pub(crate) mod thread {
    pub(crate) use std::thread::{yield_now, JoinHandle};

    pub(crate) fn spawn<F>(name: String, f: F) -> std::io::Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        std::thread::Builder::new().name(name).spawn(f)
    }
}

/// A typed thread-local cell, matching a `make_key<T>`/`get`/`set` surface.
/// Built on `std::thread::LocalKey` rather than hand-rolled TLS.
#[cfg(not(loom))]
pub(crate) use std::thread_local;
