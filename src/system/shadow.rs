//! Shadow covariance graph.
//!
//! The primary estimator's marginals live in its local update space and
//! are not usable as world-frame pose uncertainties. This parallel graph
//! mirrors the topology of the cloud-bearing subset of the primary graph
//! with identity relative measurements, so its marginals are governed
//! purely by the information matrices of the constraints: world-frame
//! covariances suitable for Mahalanobis gating and for annotating the
//! scene graph.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use crate::geometry::{Matrix6, Pose};
use crate::graph::{EdgeKey, VertexId};
use crate::solver::{LmSolver, SparseSolver};

/// Parallel graph keyed by primary vertex id.
///
/// Owns its own solver instance; nothing is shared with the primary
/// estimator at the entity level.
pub struct ShadowGraph {
    solver: Box<dyn SparseSolver>,

    /// Mirrored vertex ids.
    vertices: BTreeSet<VertexId>,

    /// Mirrored edges.
    edges: BTreeSet<EdgeKey>,

    /// Ids whose primary vertex is fixed.
    fixed_ids: BTreeSet<VertexId>,

    /// Vertex fixed by the shadow itself when no primary-fixed vertex
    /// survives (the gauge must stay anchored).
    auto_anchor: Option<VertexId>,
}

impl ShadowGraph {
    /// Create an empty shadow graph backed by the built-in solver.
    pub fn new() -> Self {
        Self::with_solver(Box::new(LmSolver::new()))
    }

    /// Create a shadow graph over a caller-provided solver.
    pub fn with_solver(solver: Box<dyn SparseSolver>) -> Self {
        Self {
            solver,
            vertices: BTreeSet::new(),
            edges: BTreeSet::new(),
            fixed_ids: BTreeSet::new(),
            auto_anchor: None,
        }
    }

    /// Whether a vertex is mirrored.
    pub fn contains_vertex(&self, id: VertexId) -> bool {
        self.vertices.contains(&id)
    }

    /// Whether an edge between the pair is mirrored.
    pub fn contains_edge(&self, a: VertexId, b: VertexId) -> bool {
        self.edges.contains(&EdgeKey::new(a, b))
    }

    /// Number of mirrored vertices.
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Number of mirrored edges.
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Mirror a primary vertex: same id, same fixed flag, identity
    /// estimate. Already-mirrored vertices are left untouched.
    pub fn mirror_vertex(&mut self, id: VertexId, fixed: bool) -> Result<()> {
        if self.vertices.contains(&id) {
            return Ok(());
        }
        self.solver.add_vertex(id, Pose::identity(), fixed)?;
        self.vertices.insert(id);
        if fixed {
            self.fixed_ids.insert(id);
        }
        Ok(())
    }

    /// Mirror a primary edge: identity measurement, inherited
    /// information. Skipped unless both endpoints are mirrored.
    pub fn mirror_edge(&mut self, a: VertexId, b: VertexId, information: Matrix6) -> Result<()> {
        let key = EdgeKey::new(a, b);
        if self.edges.contains(&key)
            || !self.vertices.contains(&a)
            || !self.vertices.contains(&b)
        {
            return Ok(());
        }
        self.solver.add_edge(a, b, Pose::identity(), information)?;
        self.edges.insert(key);
        Ok(())
    }

    /// Drop a vertex and its incident edges (the primary vertex lost its
    /// point cloud or was removed).
    pub fn remove_vertex(&mut self, id: VertexId) {
        if !self.vertices.remove(&id) {
            return;
        }
        let _ = self.solver.remove_vertex(id);
        self.edges.retain(|key| !key.involves(id));
        self.fixed_ids.remove(&id);
        if self.auto_anchor == Some(id) {
            self.auto_anchor = None;
        }
    }

    /// Reinitialize and run the shadow solver.
    pub fn run(&mut self, iterations: usize) -> Result<usize> {
        if self.vertices.is_empty() {
            return Ok(0);
        }
        self.ensure_anchor()?;
        self.solver.initialize_optimization()?;
        self.solver.optimize(iterations, false)
    }

    /// Marginal covariance blocks of the requested vertices, keyed by
    /// vertex id. Fixed vertices carry no block.
    pub fn marginals(&self, vertex_set: &[VertexId]) -> Result<BTreeMap<VertexId, Matrix6>> {
        let blocks = self.solver.compute_marginals(vertex_set)?;
        let mut out = BTreeMap::new();
        for &id in vertex_set {
            if let Some(hi) = self.solver.hessian_index(id) {
                if let Some(block) = blocks.block(hi) {
                    out.insert(id, *block);
                }
            }
        }
        Ok(out)
    }

    /// Marginal covariance of a single vertex, if it has one.
    pub fn vertex_covariance(&self, id: VertexId) -> Option<Matrix6> {
        let hi = self.solver.hessian_index(id)?;
        self.solver
            .compute_marginals(&[id])
            .ok()
            .and_then(|m| m.block(hi).copied())
    }

    /// Drop every mirrored entity.
    pub fn clear(&mut self) {
        self.solver.clear();
        self.vertices.clear();
        self.edges.clear();
        self.fixed_ids.clear();
        self.auto_anchor = None;
    }

    /// Keep the gauge anchored: when no primary-fixed vertex is
    /// mirrored, fix the lowest-id vertex instead.
    fn ensure_anchor(&mut self) -> Result<()> {
        let has_fixed = self.fixed_ids.iter().any(|id| self.vertices.contains(id));
        let desired = if has_fixed {
            None
        } else {
            self.vertices.iter().next().copied()
        };

        if self.auto_anchor != desired {
            if let Some(old) = self.auto_anchor.take() {
                if self.vertices.contains(&old) {
                    self.solver.set_fixed(old, false)?;
                }
            }
            if let Some(new) = desired {
                self.solver.set_fixed(new, true)?;
            }
            self.auto_anchor = desired;
        }
        Ok(())
    }
}

impl Default for ShadowGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mirrored_chain(n: u64) -> ShadowGraph {
        let mut shadow = ShadowGraph::new();
        for i in 0..n {
            shadow.mirror_vertex(VertexId::new(i), i == 0).unwrap();
        }
        for i in 1..n {
            shadow
                .mirror_edge(VertexId::new(i - 1), VertexId::new(i), Matrix6::identity())
                .unwrap();
        }
        shadow
    }

    #[test]
    fn test_marginals_accumulate_from_anchor() {
        let mut shadow = mirrored_chain(3);
        shadow.run(5).unwrap();

        let ids = [VertexId::new(0), VertexId::new(1), VertexId::new(2)];
        let marginals = shadow.marginals(&ids).unwrap();

        assert!(!marginals.contains_key(&VertexId::new(0)));
        let c1 = marginals[&VertexId::new(1)][(0, 0)];
        let c2 = marginals[&VertexId::new(2)][(0, 0)];
        assert!(c2 > c1);
    }

    #[test]
    fn test_edge_requires_both_endpoints() {
        let mut shadow = ShadowGraph::new();
        shadow.mirror_vertex(VertexId::new(0), true).unwrap();
        shadow
            .mirror_edge(VertexId::new(0), VertexId::new(1), Matrix6::identity())
            .unwrap();

        assert_eq!(shadow.num_edges(), 0);
    }

    #[test]
    fn test_anchor_survives_fixed_vertex_removal() {
        let mut shadow = mirrored_chain(3);
        shadow.remove_vertex(VertexId::new(0));
        shadow.run(5).unwrap();

        // Lowest remaining vertex becomes the anchor, so marginals for
        // the other one still come out.
        let marginals = shadow
            .marginals(&[VertexId::new(1), VertexId::new(2)])
            .unwrap();
        assert!(marginals.contains_key(&VertexId::new(2)));
        assert!(!marginals.contains_key(&VertexId::new(1)));
    }

    #[test]
    fn test_vertex_covariance_lookup() {
        let mut shadow = mirrored_chain(2);
        shadow.run(5).unwrap();

        // Fixed vertices and unknown ids carry no block.
        assert!(shadow.vertex_covariance(VertexId::new(0)).is_none());
        assert!(shadow.vertex_covariance(VertexId::new(7)).is_none());

        let block = shadow.vertex_covariance(VertexId::new(1)).unwrap();
        assert!(block[(0, 0)] > 0.0);
    }

    #[test]
    fn test_mirroring_is_idempotent() {
        let mut shadow = ShadowGraph::new();
        shadow.mirror_vertex(VertexId::new(0), true).unwrap();
        shadow.mirror_vertex(VertexId::new(0), true).unwrap();
        assert_eq!(shadow.num_vertices(), 1);
    }
}
