//! Pose graph model: vertices, relative-pose edges, and the spatial
//! vertex grid.
//!
//! The [`PoseGraph`] is the entity container. It owns all vertices and
//! edges, enforces the one-edge-per-pair invariant, and keeps per-vertex
//! adjacency in sync. Estimation happens elsewhere; this is pure state.

pub mod edge;
pub mod types;
pub mod vertex;
pub mod vertex_grid;

use std::collections::BTreeMap;

use crate::error::{Error, Result};

pub use edge::{EdgeKey, EdgeKind, GicpEdge, RelativePoseEdge};
pub use types::VertexId;
pub use vertex::{EdgeCandidate, EdgeSearchState, PoseVertex};
pub use vertex_grid::{VertexGrid, VertexGridConfig};

/// Container for the pose-graph entities.
///
/// Vertices and edges are stored in ordered maps so that iteration (and
/// therefore candidate selection and GraphViz output) is deterministic.
#[derive(Debug, Default)]
pub struct PoseGraph {
    vertices: BTreeMap<VertexId, PoseVertex>,
    edges: BTreeMap<EdgeKey, RelativePoseEdge>,
}

impl PoseGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Vertices
    // ─────────────────────────────────────────────────────────────────────

    /// Insert a vertex. Fails with an invariant error if the id is taken.
    pub fn add_vertex(&mut self, vertex: PoseVertex) -> Result<()> {
        let id = vertex.id;
        if self.vertices.insert(id, vertex).is_some() {
            return Err(Error::Invariant(format!("duplicate vertex id {id}")));
        }
        Ok(())
    }

    /// Look up a vertex.
    pub fn vertex(&self, id: VertexId) -> Option<&PoseVertex> {
        self.vertices.get(&id)
    }

    /// Look up a vertex mutably.
    pub fn vertex_mut(&mut self, id: VertexId) -> Option<&mut PoseVertex> {
        self.vertices.get_mut(&id)
    }

    /// Remove a vertex together with all incident edges. Returns the
    /// vertex, or `None` if it did not exist.
    pub fn remove_vertex(&mut self, id: VertexId) -> Option<PoseVertex> {
        let vertex = self.vertices.remove(&id)?;
        let incident: Vec<EdgeKey> = vertex.edges().map(|other| EdgeKey::new(id, other)).collect();
        for key in incident {
            self.remove_edge(key);
        }
        for v in self.vertices.values_mut() {
            v.remove_candidate(id);
        }
        Some(vertex)
    }

    /// All vertices in id order.
    pub fn vertices(&self) -> impl Iterator<Item = &PoseVertex> {
        self.vertices.values()
    }

    /// All vertex ids in order.
    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.vertices.keys().copied()
    }

    /// Number of vertices.
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Edges
    // ─────────────────────────────────────────────────────────────────────

    /// Insert an edge, wiring both endpoints' adjacency. Fails when either
    /// endpoint is missing or an edge between the pair already exists.
    pub fn add_edge(&mut self, edge: RelativePoseEdge) -> Result<()> {
        let key = edge.key();
        if !self.vertices.contains_key(&edge.source) {
            return Err(Error::VertexNotFound(edge.source));
        }
        if !self.vertices.contains_key(&edge.target) {
            return Err(Error::VertexNotFound(edge.target));
        }
        if self.edges.contains_key(&key) {
            return Err(Error::Invariant(format!(
                "an edge between {} and {} already exists",
                edge.source, edge.target
            )));
        }

        let (source, target) = (edge.source, edge.target);
        self.edges.insert(key, edge);
        if let Some(v) = self.vertices.get_mut(&source) {
            v.insert_neighbor(target);
        }
        if let Some(v) = self.vertices.get_mut(&target) {
            v.insert_neighbor(source);
        }
        Ok(())
    }

    /// Remove the edge with the given key, unwiring adjacency.
    pub fn remove_edge(&mut self, key: EdgeKey) -> Option<RelativePoseEdge> {
        let edge = self.edges.remove(&key)?;
        if let Some(v) = self.vertices.get_mut(&edge.source) {
            v.remove_neighbor(edge.target);
        }
        if let Some(v) = self.vertices.get_mut(&edge.target) {
            v.remove_neighbor(edge.source);
        }
        Some(edge)
    }

    /// Look up an edge between two vertices (either order).
    pub fn edge_between(&self, a: VertexId, b: VertexId) -> Option<&RelativePoseEdge> {
        self.edges.get(&EdgeKey::new(a, b))
    }

    /// Look up an edge between two vertices mutably.
    pub fn edge_between_mut(&mut self, a: VertexId, b: VertexId) -> Option<&mut RelativePoseEdge> {
        self.edges.get_mut(&EdgeKey::new(a, b))
    }

    /// Whether any edge connects the pair.
    pub fn has_edge_between(&self, a: VertexId, b: VertexId) -> bool {
        self.edges.contains_key(&EdgeKey::new(a, b))
    }

    /// All edges in key order.
    pub fn edges(&self) -> impl Iterator<Item = &RelativePoseEdge> {
        self.edges.values()
    }

    /// All edges mutably.
    pub fn edges_mut(&mut self) -> impl Iterator<Item = &mut RelativePoseEdge> {
        self.edges.values_mut()
    }

    /// Number of edges.
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Drop every vertex and edge.
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.edges.clear();
    }
}
