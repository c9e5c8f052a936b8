//! External graph collaborator contracts. Concrete graph data structures
//! are someone else's concern; only the trait-level contract needed to
//! read vertex/edge structure lives here.
//!
//! `weft::graph` never constructs, mutates, or owns a graph; it only reads
//! vertex/edge structure through these two traits. Vertices are always
//! addressed by a dense `usize` in `0..vertex_count()` so they line up
//! directly with [`crate::pool::ComputePool::parallel_for`]'s index range
//! and with mailbox array indices.

/// A directed graph exposing, for each vertex, the edges leaving it.
/// Implemented by whatever concrete adjacency structure the caller chooses
/// (adjacency list, CSR, property-mapped graph, ...) — `weft` only ever
/// calls these three methods.
pub trait VertexListDigraph {
    /// Opaque edge handle; meaningful only to the implementer and to
    /// [`Self::edge_target`] (and, for [`WeightedDigraph`], `edge_weight`).
    type EdgeId: Copy;

    /// The iterator [`Self::out_edges`] returns for one vertex.
    type EdgesIter<'a>: Iterator<Item = Self::EdgeId>
    where
        Self: 'a;

    /// Number of vertices, `|V|`. Vertex ids are `0..vertex_count()`.
    fn vertex_count(&self) -> usize;

    /// Edges leaving `vertex`.
    fn out_edges(&self, vertex: usize) -> Self::EdgesIter<'_>;

    /// The vertex `edge` points to.
    fn edge_target(&self, edge: Self::EdgeId) -> usize;
}

/// A [`VertexListDigraph`] whose edges also carry a scalar weight, required
/// by [`crate::graph::algorithms::compute_shortest_paths`]. Modeled as an
/// associated function rather than a closure threaded through every call,
/// since the vertex-parallel step already holds a live graph reference.
pub trait WeightedDigraph: VertexListDigraph {
    fn edge_weight(&self, edge: Self::EdgeId) -> f64;
}

#[cfg(test)]
pub(crate) mod test_graphs {
    use super::*;

    /// A minimal adjacency-list graph used only by this crate's own tests;
    /// not part of the public API.
    pub(crate) struct AdjacencyListGraph {
        pub(crate) edges: Vec<Vec<(usize, f64)>>,
    }

    impl AdjacencyListGraph {
        pub(crate) fn new(vertex_count: usize) -> Self {
            Self {
                edges: vec![Vec::new(); vertex_count],
            }
        }

        pub(crate) fn add_edge(&mut self, from: usize, to: usize, weight: f64) {
            self.edges[from].push((to, weight));
        }
    }

    impl VertexListDigraph for AdjacencyListGraph {
        type EdgeId = (usize, usize);
        type EdgesIter<'a> = std::vec::IntoIter<(usize, usize)>;

        fn vertex_count(&self) -> usize {
            self.edges.len()
        }

        fn out_edges(&self, vertex: usize) -> Self::EdgesIter<'_> {
            let ids: Vec<(usize, usize)> = (0..self.edges[vertex].len()).map(|i| (vertex, i)).collect();
            ids.into_iter()
        }

        fn edge_target(&self, edge: Self::EdgeId) -> usize {
            let (vertex, slot) = edge;
            self.edges[vertex][slot].0
        }
    }

    impl WeightedDigraph for AdjacencyListGraph {
        fn edge_weight(&self, edge: Self::EdgeId) -> f64 {
            let (vertex, slot) = edge;
            self.edges[vertex][slot].1
        }
    }
}
