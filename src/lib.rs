//! Pose-graph SLAM back-end.
//!
//! Integrates a stream of odometry-referenced sensor frames (pose with
//! covariance plus a point cloud) into a jointly optimized trajectory
//! and map: a sparse factor graph over 6-DoF pose vertices constrained
//! by odometry and point-cloud registration, a shadow covariance graph
//! providing world-frame marginals, a loop-closure candidate engine, a
//! spatial vertex grid bounding point-cloud memory, and a scene-graph
//! mirror of the optimized estimates.

pub mod environment;
pub mod error;
pub mod geometry;
pub mod graph;
pub mod loop_closing;
pub mod registration;
pub mod solver;
pub mod system;
pub mod viz;

pub use environment::{Environment, MlsConfig, PointCloud};
pub use error::{Error, Result};
pub use geometry::{Matrix6, Pose};
pub use graph::{VertexGridConfig, VertexId};
pub use registration::{GicpAligner, GicpConfig, GicpMeasurement};
pub use solver::{LmSolver, SparseSolver};
pub use system::SlamBackend;
