//! Model-checked backend: the same surface as [`super::backend_std`], built
//! on `loom`'s primitives instead of `std`'s, so exhaustive interleaving
//! search exercises the exact scheduler source used in production.

#[cfg(loom)]
pub(crate) mod sync {
    pub(crate) use loom::sync::Arc;

    pub(crate) mod atomic {
        pub(crate) use loom::sync::atomic::Ordering;
        pub(crate) use loom::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize};
    }

    pub(crate) struct Mutex<T> {
        inner: loom::sync::Mutex<T>,
    }

    impl<T> Mutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                inner: loom::sync::Mutex::new(value),
            }
        }

        pub(crate) fn lock(&self) -> loom::sync::MutexGuard<'_, T> {
            self.inner.lock().unwrap()
        }
    }

    pub(crate) struct ConditionMutex<T> {
        mutex: loom::sync::Mutex<T>,
        condvar: loom::sync::Condvar,
    }

    pub(crate) struct ConditionMutexGuard<'a, T> {
        guard: Option<loom::sync::MutexGuard<'a, T>>,
        condvar: &'a loom::sync::Condvar,
    }

    impl<T> ConditionMutex<T> {
        pub(crate) fn new(value: T) -> Self {
            Self {
                mutex: loom::sync::Mutex::new(value),
                condvar: loom::sync::Condvar::new(),
            }
        }

        pub(crate) fn lock(&self) -> ConditionMutexGuard<'_, T> {
            ConditionMutexGuard {
                guard: Some(self.mutex.lock().unwrap()),
                condvar: &self.condvar,
            }
        }
    }

    impl<'a, T> ConditionMutexGuard<'a, T> {
        pub(crate) fn unlock(mut self) {
            let guard = self.guard.take().expect("guard already consumed");
            drop(guard);
            self.condvar.notify_one();
        }

        pub(crate) fn await_pred(&mut self, mut pred: impl FnMut(&T) -> bool) {
            let mut guard = self.guard.take().expect("guard already consumed");
            while !pred(&guard) {
                guard = self.condvar.wait(guard).unwrap();
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

#[cfg(loom)]
pub(crate) mod thread {
    pub(crate) use loom::thread::{yield_now, JoinHandle};

    pub(crate) fn spawn<F>(_name: String, f: F) -> std::io::Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        Ok(loom::thread::spawn(f))
    }
}

#[cfg(loom)]
pub(crate) use loom::thread_local;
