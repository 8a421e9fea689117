//! Error types shared across the back-end.

use thiserror::Error;

use crate::graph::VertexId;

/// Errors surfaced by the pose-graph back-end.
#[derive(Debug, Error)]
pub enum Error {
    /// The 64-bit vertex id space has been exhausted.
    #[error("vertex id space exhausted")]
    IdSpaceExhausted,

    /// A pose or covariance contained NaN or infinite entries.
    #[error("non-finite pose or covariance input")]
    NonFiniteInput,

    /// Point-cloud registration failed to produce a measurement.
    #[error("gicp registration failed: {0}")]
    Gicp(String),

    /// The sparse solver failed to initialize or update.
    #[error("solver error: {0}")]
    Solver(String),

    /// The solver rejected a vertex or edge insertion.
    #[error("graph error: {0}")]
    Graph(String),

    /// An operation addressed a vertex that does not exist.
    #[error("vertex {0} not found")]
    VertexNotFound(VertexId),

    /// An internal invariant was violated.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, Error>;
