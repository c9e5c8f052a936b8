//! Concurrency platform shim (component C1).
//!
//! Every primitive the scheduler touches — atomics, thread spawn, the
//! mutex/condvar pair behind `ConditionMutex`, and thread-local storage — is
//! re-exported from here instead of from `std` directly. Under ordinary
//! compilation this module is a thin pass-through to `std` (backed by
//! `parking_lot` for the condition-mutex pair). Built with `--cfg loom` the
//! same names resolve to `loom`'s model-checked equivalents, so the exact
//! scheduler source gets exercised by the model checker without a second
//! implementation to keep in sync.
//!
//! This mirrors tokio's own `crate::loom` module, which picks its backend
//! the same way (`cfg_if::cfg_if! { if #[cfg(not(all(test, loom))) { mod std;
//! ... } else { mod loom; ... } }`).

mod backend_loom;
mod backend_std;

cfg_if::cfg_if! {
    if #[cfg(not(loom))] {
        pub(crate) use backend_std::*;
    } else {
        pub(crate) use backend_loom::*;
    }
}
