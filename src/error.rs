//! Error taxonomy: contract violations panic; everything else that can
//! legitimately fail at runtime is a typed `Result`.

use std::any::Any;
use std::fmt;

/// The single user error surfaced by a throwing `join`/`parallel_for` once
/// both sides of the fork have completed. Wraps the panic payload the way
/// `std::thread::Result` does.
#[derive(thiserror::Error)]
#[error("task panicked: {}", self.message())]
pub struct PoolPanic {
    payload: Box<dyn Any + Send + 'static>,
}

impl PoolPanic {
    pub(crate) fn new(payload: Box<dyn Any + Send + 'static>) -> Self {
        Self { payload }
    }

    /// Resume unwinding with the original panic payload.
    pub fn resume(self) -> ! {
        std::panic::resume_unwind(self.payload)
    }

    /// Best-effort string rendering of the panic payload, for logging.
    pub fn message(&self) -> &str {
        if let Some(s) = self.payload.downcast_ref::<&str>() {
            s
        } else if let Some(s) = self.payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "non-string panic payload"
        }
    }
}

impl fmt::Debug for PoolPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolPanic").field("message", &self.message()).finish()
    }
}

/// Graph-algorithm-layer errors. The vertex-parallel engine itself never
/// produces these; only the algorithms built on top of it do.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("no edge found matching the requested criteria")]
    EdgeNotFound,
    #[error("search terminated early")]
    StopSearch,
    #[error("cycle detected")]
    CycleDetected,
}
