//! `weft` is a work-stealing compute thread pool (module [`pool`]) and a
//! vertex-parallel graph-computation engine built on top of it (module
//! [`graph`]).
//!
//! # Pool
//!
//! [`pool::ComputePool`] runs one worker thread per hardware thread and
//! offers three ways to submit work:
//!
//! - [`pool::ComputePool::dispatch`] — fire-and-forget, never blocks.
//! - [`pool::ComputePool::join`] — fork-join with caller participation; the
//!   calling thread always runs one half itself.
//! - [`pool::ComputePool::parallel_for`] — recursive range subdivision down
//!   to a grain size.
//!
//! Threads that call `join`/`parallel_for` without being a pool worker must
//! first call [`pool::ComputePool::register_current_thread`] (unless the
//! pool was built with `allow_non_fast_path_threads(true)`); `dispatch`
//! works from any thread unconditionally.
//!
//! # Graph
//!
//! [`graph::step`] runs one Pregel-style super-step of a user vertex
//! function across every vertex of a graph, in parallel, via the pool's
//! `parallel_for`. Messages sent between vertices during a step are
//! consolidated by [`graph::Mailboxes::deliver`] before the next step
//! begins. [`graph::algorithms`] builds transitive closure, BFS, and
//! early-stoppable SSSP on top of this primitive.
//!
//! The adjacency structure itself (`VertexListDigraph`/`WeightedDigraph`) is
//! an external collaborator this crate only references at the trait level —
//! concrete graph storage, visitor chains, and graph generators are out of
//! scope.
//!
//! Concurrency primitives are isolated behind a small shim (see [`loom`]) so
//! the scheduler can be exercised under a model checker as well as `std`.

mod loom;

pub mod error;
pub mod graph;
pub mod pool;

pub use error::{GraphError, PoolPanic};
pub use pool::{ComputePool, PoolBuilder};
