//! Vertex-parallel super-step driver.
//!
//! One call to [`step`] runs `fn` across every vertex of `graph`, in
//! parallel, via [`crate::pool::ComputePool::parallel_for`]; each
//! invocation gets a [`Context`] wrapping its vertex id, its out-edges, its
//! consolidated inbox, and a `send` callback into the current thread's
//! outbox shard. User-returned partial `GlobalState`s are merged into a
//! per-thread slot (reusing [`Message::merge`]) and reduced into one value
//! after the step. [`sequential_step`] is the single-threaded fallback used
//! when `parallelism == 1` or inside tests.
//!
//! Per-thread slots are `CachePadded`, same as the task deque's front/back
//! split: each slot is written by exactly one thread during a step, so
//! padding only needs to rule out false sharing, not races.

use std::cell::UnsafeCell;

use crossbeam_utils::CachePadded;

use super::graph_trait::VertexListDigraph;
use super::mailbox::{Mailboxes, Message};
use crate::pool::ComputePool;

/// Per-vertex view handed to a user vertex function during one super-step.
pub struct Context<'a, M, E> {
    pub vertex_id: usize,
    pub edges: Vec<E>,
    pub inbox: &'a Option<M>,
    send: &'a mut dyn FnMut(M, usize),
}

impl<'a, M, E> Context<'a, M, E> {
    /// Enqueue `message` to `destination`'s inbox for the *next* super-step
    /// (writes into the current thread's outbox shard; visible only after
    /// the engine driver calls `deliver()`).
    pub fn send(&mut self, message: M, destination: usize) {
        (self.send)(message, destination);
    }
}

struct Slot<GS>(UnsafeCell<Option<GS>>);

// Safety: slot `i` is written only by whichever thread holds pool index `i`
// during this step's `parallel_for`; the reduction afterwards runs only
// after `parallel_for` (a barrier) has returned, single-threaded.
unsafe impl<GS: Send> Sync for Slot<GS> {}

impl<GS> Slot<GS> {
    fn new() -> Self {
        Self(UnsafeCell::new(None))
    }

    /// # Safety
    /// Caller must be the one thread that owns this slot for the duration
    /// of the current step.
    unsafe fn merge_in(&self, partial: GS)
    where
        GS: Message,
    {
        let cell = &mut *self.0.get();
        match cell {
            Some(existing) => existing.merge(partial),
            None => *cell = Some(partial),
        }
    }

    fn take(&self) -> Option<GS> {
        unsafe { (*self.0.get()).take() }
    }
}

/// Runs one super-step of `f` across every vertex in `graph`, in parallel.
///
/// Precondition: `mailboxes.deliver()` has already been called for every
/// prior step (or this is the first step of the computation).
pub fn step<G, MB, GS, F>(pool: &ComputePool, graph: &G, mailboxes: &MB, global_state: GS, f: F) -> GS
where
    G: VertexListDigraph + Sync,
    MB: Mailboxes + Sync,
    GS: Message + Sync,
    F: Fn(&mut Context<'_, MB::Message, G::EdgeId>, &GS) -> Option<GS> + Sync,
{
    let n = graph.vertex_count();
    let slot_count = pool.parallelism().max(1);
    let slots: Vec<CachePadded<Slot<GS>>> = (0..slot_count).map(|_| CachePadded::new(Slot::new())).collect();

    pool.parallel_for(n, |start, end, _total| {
        for vertex in start..end {
            run_vertex(pool, graph, mailboxes, &global_state, &f, vertex, &slots);
        }
    });

    let mut result = global_state;
    for slot in &slots {
        if let Some(partial) = slot.take() {
            result.merge(partial);
        }
    }
    result
}

fn run_vertex<G, MB, GS, F>(
    pool: &ComputePool,
    graph: &G,
    mailboxes: &MB,
    global_state: &GS,
    f: &F,
    vertex: usize,
    slots: &[CachePadded<Slot<GS>>],
) where
    G: VertexListDigraph + Sync,
    MB: Mailboxes + Sync,
    GS: Message + Sync,
    F: Fn(&mut Context<'_, MB::Message, G::EdgeId>, &GS) -> Option<GS> + Sync,
{
    let edges: Vec<G::EdgeId> = graph.out_edges(vertex).collect();
    let partial = mailboxes.with_mailbox(vertex, |inbox, send| {
        let mut ctx = Context {
            vertex_id: vertex,
            edges,
            inbox,
            send,
        };
        f(&mut ctx, global_state)
    });
    if let Some(partial) = partial {
        let index = pool
            .current_thread_index()
            .expect("vertex functions always run on a fast-path-registered thread");
        // Safety: `parallel_for` hands each index in `0..n` to exactly one
        // invocation running on the thread that holds pool index `index`,
        // so only that thread ever touches `slots[index]` during this step.
        unsafe { slots[index].merge_in(partial) };
    }
}

/// Single-threaded fallback for `step`: used when `parallelism == 1` or
/// from tests that want deterministic ordering.
pub fn sequential_step<G, MB, GS, F>(graph: &G, mailboxes: &MB, mut global_state: GS, f: F) -> GS
where
    G: VertexListDigraph,
    MB: Mailboxes,
    GS: Message,
    F: Fn(&mut Context<'_, MB::Message, G::EdgeId>, &GS) -> Option<GS>,
{
    for vertex in 0..graph.vertex_count() {
        let edges: Vec<G::EdgeId> = graph.out_edges(vertex).collect();
        let partial = mailboxes.with_mailbox(vertex, |inbox, send| {
            let mut ctx = Context {
                vertex_id: vertex,
                edges,
                inbox,
                send,
            };
            f(&mut ctx, &global_state)
        });
        if let Some(partial) = partial {
            global_state.merge(partial);
        }
    }
    global_state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::graph_trait::test_graphs::AdjacencyListGraph;
    use crate::graph::mailbox::SequentialMailboxes;
    use crate::pool::PoolBuilder;

    #[derive(Clone, Debug, PartialEq)]
    struct Count(usize);
    impl Message for Count {
        fn merge(&mut self, other: Self) {
            self.0 += other.0;
        }
    }

    #[test]
    fn sequential_step_visits_every_vertex_and_reduces_global_state() {
        let mut graph = AdjacencyListGraph::new(3);
        graph.add_edge(0, 1, 1.0);
        graph.add_edge(1, 2, 1.0);
        let mailboxes = SequentialMailboxes::<Count>::new(3);

        let total = sequential_step(&graph, &mailboxes, Count(0), |_ctx, _gs| Some(Count(1)));
        assert_eq!(total, Count(3));
    }

    #[test]
    fn parallel_step_matches_sequential_step_global_state() {
        let mut graph = AdjacencyListGraph::new(50);
        for i in 0..49 {
            graph.add_edge(i, i + 1, 1.0);
        }
        let pool = PoolBuilder::new().worker_threads(4).build();
        pool.register_current_thread();
        let mailboxes = SequentialMailboxes::<Count>::new(50);
        let sharded = crate::graph::mailbox::ShardedMailboxes::<Count>::new(50, pool.clone());

        let via_sequential = sequential_step(&graph, &mailboxes, Count(0), |_ctx, _gs| Some(Count(1)));
        let via_parallel = step(&pool, &graph, &sharded, Count(0), |_ctx, _gs| Some(Count(1)));
        assert_eq!(via_sequential, via_parallel);
        pool.shut_down();
    }
}
