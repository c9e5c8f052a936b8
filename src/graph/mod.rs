//! Vertex-parallel graph-computation engine, layered on [`crate::pool`].
//! Executes Pregel-style super-steps over a graph projection exposed only
//! at the trait level — concrete graph data structures are out of scope.

mod algorithms;
mod engine;
mod graph_trait;
mod mailbox;

pub use algorithms::{compute_bfs, compute_shortest_paths, compute_transitive_closure};
pub use engine::{sequential_step, step, Context};
pub use graph_trait::{VertexListDigraph, WeightedDigraph};
pub use mailbox::{Mailboxes, Message, SequentialMailboxes, ShardedMailboxes};
