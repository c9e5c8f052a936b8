//! Graph algorithms built on the vertex-parallel engine: transitive
//! closure, BFS, and early-stoppable SSSP. Each drives
//! [`super::engine::step`] in a loop until [`Mailboxes::deliver`] reports
//! quiescence (or, for SSSP, until the stop-vertex condition is satisfied).
//!
//! These three are the only graph-traversal algorithms this crate ships;
//! everything else graph-shaped (generators, visitor chains, generic
//! shortest-path variants beyond SSSP) is out of scope.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use super::engine::{self, Context};
use super::graph_trait::{VertexListDigraph, WeightedDigraph};
use super::mailbox::{Mailboxes, Message, ShardedMailboxes};
use crate::pool::ComputePool;

/// Zero-sized "a message arrived" signal used by [`compute_transitive_closure`].
/// `merge` is a no-op: arrival is binary, so duplicate pings from different
/// shards carry no additional information.
#[derive(Clone, Copy, Debug)]
struct Ping;

impl Message for Ping {
    fn merge(&mut self, _other: Self) {}
}

/// Runs reachability/transitive-closure from `seeds`: step 0 has every
/// seed send to its out-neighbours;
/// subsequent steps forward on first arrival; the loop ends when a step
/// produces no messages. Returns the reachability vector and the number of
/// steps executed (the longest path length from any seed).
pub fn compute_transitive_closure<G>(pool: &ComputePool, graph: &G, seeds: &[usize]) -> (Vec<bool>, usize)
where
    G: VertexListDigraph + Sync,
{
    let n = graph.vertex_count();
    let reachable: Vec<std::sync::atomic::AtomicBool> =
        (0..n).map(|_| std::sync::atomic::AtomicBool::new(false)).collect();
    for &seed in seeds {
        reachable[seed].store(true, Ordering::Relaxed);
    }

    let mailboxes = ShardedMailboxes::<Ping>::new(n, pool.clone());
    let mut steps = 0usize;

    loop {
        let is_first_step = steps == 0;
        engine::step(pool, graph, &mailboxes, (), |ctx: &mut Context<'_, Ping, G::EdgeId>, _gs| {
            let vertex = ctx.vertex_id;
            let newly_arrived = if ctx.inbox.is_some() {
                !reachable[vertex].swap(true, Ordering::AcqRel)
            } else {
                false
            };
            let seed_first_announcement = is_first_step && reachable[vertex].load(Ordering::Relaxed);
            if newly_arrived || seed_first_announcement {
                let targets: Vec<usize> = ctx.edges.iter().map(|&e| graph.edge_target(e)).collect();
                for target in targets {
                    ctx.send(Ping, target);
                }
            }
            None
        });
        steps += 1;
        if !mailboxes.deliver() {
            break;
        }
    }

    let reachable = reachable.into_iter().map(|a| a.load(Ordering::Relaxed)).collect();
    (reachable, steps)
}

/// A BFS discovery message: who discovered the destination. A first
/// arrival is stamped with distance `0`; this is a visited/predecessor
/// search, not a hop-count —
/// hop-counted shortest paths are [`compute_shortest_paths`]'s job.
#[derive(Clone, Copy, Debug)]
struct BfsMessage {
    predecessor: usize,
}

impl Message for BfsMessage {
    fn merge(&mut self, _other: Self) {
        // Arbitrary-but-deterministic: whichever shard's predecessor survives
        // the merge doesn't affect reachability, only which valid tree edge
        // is recorded; either is a correct BFS predecessor.
    }
}

const NO_PREDECESSOR: usize = usize::MAX;
const BFS_INFINITY: u64 = u64::MAX;

/// Parallel BFS from `seeds`. Returns
/// `(distance, predecessor, step_count)`; unreached vertices have distance
/// [`BFS_INFINITY`] (exposed to callers as [`u64::MAX`]) and no predecessor.
pub fn compute_bfs<G>(pool: &ComputePool, graph: &G, seeds: &[usize]) -> (Vec<u64>, Vec<Option<usize>>, usize)
where
    G: VertexListDigraph + Sync,
{
    let n = graph.vertex_count();
    let distance: Vec<AtomicU64> = (0..n).map(|_| AtomicU64::new(BFS_INFINITY)).collect();
    let predecessor: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(NO_PREDECESSOR)).collect();
    for &seed in seeds {
        distance[seed].store(0, Ordering::Relaxed);
    }

    let mailboxes = ShardedMailboxes::<BfsMessage>::new(n, pool.clone());
    let mut steps = 0usize;

    loop {
        let is_first_step = steps == 0;
        engine::step(pool, graph, &mailboxes, (), |ctx: &mut Context<'_, BfsMessage, G::EdgeId>, _gs| {
            let vertex = ctx.vertex_id;
            let first_arrival = if let Some(message) = ctx.inbox {
                if distance[vertex].load(Ordering::Relaxed) == BFS_INFINITY {
                    distance[vertex].store(0, Ordering::Relaxed);
                    predecessor[vertex].store(message.predecessor, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            } else {
                false
            };
            let seed_first_announcement =
                is_first_step && distance[vertex].load(Ordering::Relaxed) == 0;
            if first_arrival || seed_first_announcement {
                let targets: Vec<usize> = ctx.edges.iter().map(|&e| graph.edge_target(e)).collect();
                for target in targets {
                    ctx.send(BfsMessage { predecessor: vertex }, target);
                }
            }
            None
        });
        steps += 1;
        if !mailboxes.deliver() {
            break;
        }
    }

    let distance = distance.into_iter().map(|a| a.load(Ordering::Relaxed)).collect();
    let predecessor = predecessor
        .into_iter()
        .map(|a| match a.load(Ordering::Relaxed) {
            NO_PREDECESSOR => None,
            p => Some(p),
        })
        .collect();
    (distance, predecessor, steps)
}

/// A relaxation message: a candidate (predecessor, tentative distance) pair.
/// `merge` keeps the smaller distance.
#[derive(Clone, Copy, Debug)]
struct SsspMessage {
    predecessor: usize,
    distance: f64,
}

impl Message for SsspMessage {
    fn merge(&mut self, other: Self) {
        if other.distance < self.distance {
            *self = other;
        }
    }
}

/// Per-step global state threaded through the engine: the best known
/// distance to the stop vertex (once discovered) and whether any vertex
/// relaxed this step. Reused as the merge vehicle for both concerns, since
/// the engine merges global state into a per-thread slot via the same
/// mailbox-merge mechanism.
#[derive(Clone, Copy, Debug)]
struct SsspGlobalState {
    end_distance: Option<f64>,
    improved: bool,
}

impl Message for SsspGlobalState {
    fn merge(&mut self, other: Self) {
        self.end_distance = match (self.end_distance, other.end_distance) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };
        self.improved = self.improved || other.improved;
    }
}

/// Single-source shortest paths with optional early stop. `stop_vertex`,
/// once its distance is known, publishes
/// `endVertexDistance`; vertices whose incoming distance exceeds it
/// suppress further sends (valid for non-negative weights). Terminates
/// when no vertex below `endVertexDistance` improves for a full step after
/// it is first observed, or — with no `stop_vertex` — on ordinary mailbox
/// quiescence. `max_steps`, if given, caps the number of steps run
/// regardless of convergence.
///
/// Correct for negative edge weights only when `stop_vertex` is `None` and
/// the graph has no negative cycles.
pub fn compute_shortest_paths<G>(
    pool: &ComputePool,
    graph: &G,
    start: usize,
    stop_vertex: Option<usize>,
    max_steps: Option<usize>,
) -> (Vec<f64>, Vec<Option<usize>>, usize)
where
    G: WeightedDigraph + Sync,
{
    let n = graph.vertex_count();
    let distance: Vec<AtomicU64> = (0..n).map(|_| AtomicU64::new(f64::INFINITY.to_bits())).collect();
    let predecessor: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(NO_PREDECESSOR)).collect();

    let mailboxes = ShardedMailboxes::<SsspMessage>::new(n, pool.clone());
    let mut steps = 0usize;
    let mut known_end_distance: Option<f64> = None;
    let mut rounds_since_end_known = 0usize;

    loop {
        if let Some(max) = max_steps {
            if steps >= max {
                break;
            }
        }
        let is_first_step = steps == 0;
        let initial_gs = SsspGlobalState {
            end_distance: known_end_distance,
            improved: false,
        };
        let gs = engine::step(
            pool,
            graph,
            &mailboxes,
            initial_gs,
            |ctx: &mut Context<'_, SsspMessage, G::EdgeId>, gs_in: &SsspGlobalState| {
                let vertex = ctx.vertex_id;
                let incoming = if is_first_step && vertex == start {
                    Some((NO_PREDECESSOR, 0.0))
                } else {
                    ctx.inbox.map(|m| (m.predecessor, m.distance))
                };

                let mut local_improved = false;
                if let Some((pred, candidate)) = incoming {
                    let current = f64::from_bits(distance[vertex].load(Ordering::Relaxed));
                    if candidate < current {
                        distance[vertex].store(candidate.to_bits(), Ordering::Relaxed);
                        if pred != NO_PREDECESSOR {
                            predecessor[vertex].store(pred, Ordering::Relaxed);
                        }
                        local_improved = true;

                        let suppressed = match gs_in.end_distance {
                            Some(end) => candidate > end,
                            None => false,
                        };
                        if !suppressed {
                            let forwards: Vec<(usize, f64)> = ctx
                                .edges
                                .iter()
                                .map(|&e| (graph.edge_target(e), graph.edge_weight(e)))
                                .collect();
                            for (target, weight) in forwards {
                                ctx.send(
                                    SsspMessage {
                                        predecessor: vertex,
                                        distance: candidate + weight,
                                    },
                                    target,
                                );
                            }
                        }
                    }
                }

                if stop_vertex == Some(vertex) {
                    let d = f64::from_bits(distance[vertex].load(Ordering::Relaxed));
                    if d.is_finite() {
                        return Some(SsspGlobalState {
                            end_distance: Some(d),
                            improved: local_improved,
                        });
                    }
                }
                if local_improved {
                    Some(SsspGlobalState {
                        end_distance: None,
                        improved: true,
                    })
                } else {
                    None
                }
            },
        );
        steps += 1;
        let produced = mailboxes.deliver();

        if gs.end_distance.is_some() {
            known_end_distance = gs.end_distance;
        }

        if known_end_distance.is_some() {
            rounds_since_end_known = if gs.improved { 0 } else { rounds_since_end_known + 1 };
            if rounds_since_end_known >= 1 {
                break;
            }
        } else if !produced {
            break;
        }
    }

    let distance = distance
        .into_iter()
        .map(|a| f64::from_bits(a.load(Ordering::Relaxed)))
        .collect();
    let predecessor = predecessor
        .into_iter()
        .map(|a| match a.load(Ordering::Relaxed) {
            NO_PREDECESSOR => None,
            p => Some(p),
        })
        .collect();
    (distance, predecessor, steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::graph_trait::test_graphs::AdjacencyListGraph;
    use crate::pool::PoolBuilder;

    fn sample_graph() -> AdjacencyListGraph {
        // 0 -> 1, 0 -> 3(w10), 1 -> 2, 2 -> 3, 3 -> 4(w5), 3 -> 5, 5 -> 0;
        // vertex 6 isolated.
        let mut g = AdjacencyListGraph::new(7);
        g.add_edge(0, 1, 1.0);
        g.add_edge(0, 3, 10.0);
        g.add_edge(1, 2, 1.0);
        g.add_edge(2, 3, 1.0);
        g.add_edge(3, 4, 5.0);
        g.add_edge(3, 5, 1.0);
        g.add_edge(5, 0, 1.0);
        g
    }

    fn transitive_closure_graph() -> AdjacencyListGraph {
        // 0 -> 1, 0 -> 3, 1 -> 2, 3 -> 2; vertex 4 isolated.
        let mut g = AdjacencyListGraph::new(5);
        g.add_edge(0, 1, 1.0);
        g.add_edge(0, 3, 1.0);
        g.add_edge(1, 2, 1.0);
        g.add_edge(3, 2, 1.0);
        g
    }

    #[test]
    fn transitive_closure_reaches_all_but_isolated_vertex() {
        let graph = transitive_closure_graph();
        let pool = PoolBuilder::new().worker_threads(2).build();
        pool.register_current_thread();
        let (reachable, steps) = compute_transitive_closure(&pool, &graph, &[0]);
        assert_eq!(reachable, vec![true, true, true, true, false]);
        assert_eq!(steps, 3);
        pool.shut_down();
    }

    #[test]
    fn bfs_reaches_all_but_isolated_vertex() {
        let graph = sample_graph();
        let pool = PoolBuilder::new().worker_threads(2).build();
        pool.register_current_thread();
        let (distance, predecessor, steps) = compute_bfs(&pool, &graph, &[0]);
        assert_eq!(distance, vec![0, 0, 0, 0, 0, 0, BFS_INFINITY]);
        assert_eq!(steps, 4);
        assert_eq!(predecessor[0], None);
        assert!(predecessor[1..6].iter().all(Option::is_some));
        pool.shut_down();
    }

    #[test]
    fn sssp_finds_shortest_weighted_path() {
        let graph = sample_graph();
        let pool = PoolBuilder::new().worker_threads(2).build();
        pool.register_current_thread();
        let (distance, predecessor, steps) = compute_shortest_paths(&pool, &graph, 0, None, None);
        assert_eq!(distance[..6], [0.0, 1.0, 2.0, 3.0, 8.0, 4.0]);
        assert!(distance[6].is_infinite());
        assert_eq!(steps, 6);

        // Path to vertex 3 is 0 -> 1 -> 2 -> 3, not the direct 0 -> 3(w10) edge.
        let mut path = vec![3];
        let mut current = 3;
        while let Some(p) = predecessor[current] {
            path.push(p);
            current = p;
        }
        path.reverse();
        assert_eq!(path, vec![0, 1, 2, 3]);
        pool.shut_down();
    }

    #[test]
    fn sssp_with_stop_vertex_terminates_early() {
        let graph = sample_graph();
        let pool = PoolBuilder::new().worker_threads(2).build();
        pool.register_current_thread();
        let (distance, _predecessor, steps) =
            compute_shortest_paths(&pool, &graph, 0, Some(2), None);
        assert_eq!(distance[2], 2.0);
        assert!(steps <= 6);
        pool.shut_down();
    }

    #[test]
    fn sssp_max_steps_cap_is_respected() {
        let graph = sample_graph();
        let pool = PoolBuilder::new().worker_threads(2).build();
        pool.register_current_thread();
        let (_distance, _predecessor, steps) =
            compute_shortest_paths(&pool, &graph, 0, None, Some(2));
        assert_eq!(steps, 2);
        pool.shut_down();
    }
}
