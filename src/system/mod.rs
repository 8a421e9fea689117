//! Back-end driver: graph state machine, shadow covariance graph, and
//! the staging/commit cycle around the sparse solver.

pub mod backend;
pub mod shadow;

pub use backend::SlamBackend;
pub use shadow::ShadowGraph;
