//! Black-box end-to-end scenarios exercised against the public API only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use weft::graph::{compute_bfs, compute_shortest_paths, compute_transitive_closure};
use weft::graph::{VertexListDigraph, WeightedDigraph};
use weft::PoolBuilder;

/// Minimal adjacency-list graph built purely from the public trait contract,
/// standing in for whatever concrete graph structure a real caller owns.
struct Graph {
    edges: Vec<Vec<(usize, f64)>>,
}

impl Graph {
    fn new(vertex_count: usize) -> Self {
        Self {
            edges: vec![Vec::new(); vertex_count],
        }
    }

    fn add_edge(&mut self, from: usize, to: usize, weight: f64) {
        self.edges[from].push((to, weight));
    }
}

impl VertexListDigraph for Graph {
    type EdgeId = (usize, usize);
    type EdgesIter<'a> = std::vec::IntoIter<(usize, usize)>;

    fn vertex_count(&self) -> usize {
        self.edges.len()
    }

    fn out_edges(&self, vertex: usize) -> Self::EdgesIter<'_> {
        (0..self.edges[vertex].len())
            .map(|slot| (vertex, slot))
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn edge_target(&self, edge: Self::EdgeId) -> usize {
        let (vertex, slot) = edge;
        self.edges[vertex][slot].0
    }
}

impl WeightedDigraph for Graph {
    fn edge_weight(&self, edge: Self::EdgeId) -> f64 {
        let (vertex, slot) = edge;
        self.edges[vertex][slot].1
    }
}

fn sample_graph() -> Graph {
    // 0 -> 1, 0 -> 3(w10), 1 -> 2, 2 -> 3, 3 -> 4(w5), 3 -> 5, 5 -> 0;
    // vertex 6 isolated.
    let mut g = Graph::new(7);
    g.add_edge(0, 1, 1.0);
    g.add_edge(0, 3, 10.0);
    g.add_edge(1, 2, 1.0);
    g.add_edge(2, 3, 1.0);
    g.add_edge(3, 4, 5.0);
    g.add_edge(3, 5, 1.0);
    g.add_edge(5, 0, 1.0);
    g
}

#[test]
fn simple_join() {
    tracing_subscriber::fmt::init();

    let pool = PoolBuilder::new().worker_threads(2).build();
    pool.register_current_thread();

    let mut a = 0;
    let mut b = 0;
    pool.join(|| a += 1, || b += 1);

    assert_eq!((a, b), (1, 1));
    pool.shut_down();
}

#[test]
fn parallel_for_coverage() {
    let pool = PoolBuilder::new().worker_threads(4).build();
    pool.register_current_thread();

    let hits: Vec<AtomicUsize> = (0..1000).map(|_| AtomicUsize::new(0)).collect();
    pool.parallel_for(hits.len(), |start, end, _total| {
        for i in start..end {
            hits[i].fetch_add(1, Ordering::Relaxed);
        }
    });

    assert!(hits.iter().all(|h| h.load(Ordering::Relaxed) == 1));
    pool.shut_down();
}

#[test]
fn transitive_closure_five_vertices() {
    let pool = PoolBuilder::new().worker_threads(2).build();
    pool.register_current_thread();

    // 0 -> 1, 0 -> 3, 1 -> 2, 3 -> 2; vertex 4 isolated.
    let mut graph = Graph::new(5);
    graph.add_edge(0, 1, 1.0);
    graph.add_edge(0, 3, 1.0);
    graph.add_edge(1, 2, 1.0);
    graph.add_edge(3, 2, 1.0);

    let (reachable, steps) = compute_transitive_closure(&pool, &graph, &[0]);

    assert_eq!(reachable, vec![true, true, true, true, false]);
    assert_eq!(steps, 3);
    pool.shut_down();
}

#[test]
fn bfs_seven_vertices() {
    let pool = PoolBuilder::new().worker_threads(2).build();
    pool.register_current_thread();

    let graph = sample_graph();
    let (distance, predecessor, steps) = compute_bfs(&pool, &graph, &[0]);

    assert_eq!(distance, vec![0, 0, 0, 0, 0, 0, u64::MAX]);
    assert_eq!(predecessor[0], None);
    assert!(predecessor[1..6].iter().all(Option::is_some));
    assert_eq!(steps, 4);
    pool.shut_down();
}

#[test]
fn sssp_same_graph() {
    let pool = PoolBuilder::new().worker_threads(2).build();
    pool.register_current_thread();

    let graph = sample_graph();
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
fn deque_overflow_executes_inline() {
    let pool = PoolBuilder::new()
        .worker_threads(1)
        .deque_capacity(4)
        .build();

    let counter = Arc::new(AtomicUsize::new(0));
    let foreign = {
        let counter = counter.clone();
        let pool = pool.clone();
        std::thread::spawn(move || {
            for _ in 0..8 {
                let counter = counter.clone();
                pool.dispatch(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        })
    };
    foreign.join().unwrap();

    while counter.load(Ordering::SeqCst) < 8 {
        std::hint::spin_loop();
    }

    assert_eq!(counter.load(Ordering::SeqCst), 8);
    pool.shut_down();
}
