//! Non-linear sparse solver seam.
//!
//! The back-end consumes the solver through [`SparseSolver`] so that the
//! estimator can be swapped (or stubbed in tests) without touching the
//! driver. [`LmSolver`] is the built-in implementation.

pub mod lm;

use std::collections::HashMap;

use crate::error::Result;
use crate::geometry::{Matrix6, Pose};
use crate::graph::VertexId;

pub use lm::{LmConfig, LmSolver};

/// Sparse block container for marginal covariances: 6×6 diagonal blocks
/// keyed by each vertex's Hessian position.
#[derive(Debug, Default, Clone)]
pub struct MarginalCovariances {
    blocks: HashMap<usize, Matrix6>,
}

impl MarginalCovariances {
    /// Empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the block for a Hessian index.
    pub fn insert(&mut self, hessian_index: usize, block: Matrix6) {
        self.blocks.insert(hessian_index, block);
    }

    /// Block at a Hessian index, if present.
    pub fn block(&self, hessian_index: usize) -> Option<&Matrix6> {
        self.blocks.get(&hessian_index)
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether no blocks are stored.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Operations the back-end requires from a non-linear sparse optimizer
/// over 6-DoF pose vertices and relative-pose edges.
///
/// Implementations own their copy of the topology; vertices enter the
/// active set through [`initialize_optimization`] or incrementally
/// through [`update_initialization`].
///
/// [`initialize_optimization`]: SparseSolver::initialize_optimization
/// [`update_initialization`]: SparseSolver::update_initialization
pub trait SparseSolver {
    /// Register a vertex with its initial estimate.
    fn add_vertex(&mut self, id: VertexId, estimate: Pose, fixed: bool) -> Result<()>;

    /// Register a relative-pose constraint between two known vertices.
    fn add_edge(
        &mut self,
        source: VertexId,
        target: VertexId,
        measurement: Pose,
        information: Matrix6,
    ) -> Result<()>;

    /// Remove a vertex and every constraint touching it.
    fn remove_vertex(&mut self, id: VertexId) -> Result<()>;

    /// Remove the constraint between two vertices.
    fn remove_edge(&mut self, source: VertexId, target: VertexId) -> Result<()>;

    /// Fix or release a vertex.
    fn set_fixed(&mut self, id: VertexId, fixed: bool) -> Result<()>;

    /// Current estimate of a vertex.
    fn estimate(&self, id: VertexId) -> Option<Pose>;

    /// Hessian position of a vertex; `None` for fixed or inactive
    /// vertices.
    fn hessian_index(&self, id: VertexId) -> Option<usize>;

    /// (Re-)build the active set from everything registered and assign
    /// Hessian indices from scratch.
    fn initialize_optimization(&mut self) -> Result<()>;

    /// Extend the active set by the listed vertices and edges without
    /// renumbering existing ones.
    fn update_initialization(
        &mut self,
        vertices: &[VertexId],
        edges: &[(VertexId, VertexId)],
    ) -> Result<usize>;

    /// Run up to `iterations` solver iterations; `online` requests a
    /// warm start from the previous call. Returns iterations performed.
    fn optimize(&mut self, iterations: usize, online: bool) -> Result<usize>;

    /// Marginal covariance blocks of the requested vertices.
    fn compute_marginals(&self, vertex_set: &[VertexId]) -> Result<MarginalCovariances>;

    /// Whether a vertex is registered.
    fn contains_vertex(&self, id: VertexId) -> bool;

    /// Number of registered vertices.
    fn num_vertices(&self) -> usize;

    /// Number of registered edges.
    fn num_edges(&self) -> usize;

    /// Drop all state.
    fn clear(&mut self);
}
