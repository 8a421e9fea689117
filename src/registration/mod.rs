//! Point-cloud registration seam.
//!
//! The back-end consumes registration through [`GicpAligner`]; the
//! measurement convention matches the edge contract: the returned
//! transform maps points from the target vertex's frame into the source
//! vertex's frame, i.e. it measures `source⁻¹ ∘ target`.

pub mod icp;

use serde::{Deserialize, Serialize};

use crate::environment::PointCloud;
use crate::error::Result;
use crate::geometry::{Matrix6, Pose};

pub use icp::PointToPointAligner;

/// Registration parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GicpConfig {
    /// Correspondences farther apart than this are rejected (meters).
    pub max_correspondence_distance: f64,

    /// Iteration cap for the alignment.
    pub maximum_iterations: usize,

    /// Convergence threshold on the incremental transform.
    pub transformation_epsilon: f64,

    /// Convergence threshold on the fitness improvement.
    pub euclidean_fitness_epsilon: f64,

    /// Fraction of points kept when a cloud is attached to a vertex.
    pub point_cloud_density: f64,

    /// Alignments with a fitness above this are invalid.
    pub max_fitness_score: f64,

    /// Position standard deviation backing the edge information matrix.
    pub position_sigma: f64,

    /// Orientation standard deviation backing the edge information
    /// matrix.
    pub orientation_sigma: f64,

    /// Candidate gating distance for loop-closure search (meters).
    pub max_sensor_distance: f64,
}

impl Default for GicpConfig {
    fn default() -> Self {
        Self {
            max_correspondence_distance: 2.5,
            maximum_iterations: 50,
            transformation_epsilon: 1e-5,
            euclidean_fitness_epsilon: 1e-5,
            point_cloud_density: 0.2,
            max_fitness_score: 2.0,
            position_sigma: 0.001,
            orientation_sigma: 0.0001,
            max_sensor_distance: 12.5,
        }
    }
}

impl GicpConfig {
    /// Information matrix the sigmas imply: diagonal, position block
    /// first.
    pub fn information(&self) -> Matrix6 {
        let mut info = Matrix6::identity();
        let pos = 1.0 / (self.position_sigma * self.position_sigma);
        let ori = 1.0 / (self.orientation_sigma * self.orientation_sigma);
        for i in 0..3 {
            info[(i, i)] = pos;
            info[(i + 3, i + 3)] = ori;
        }
        info
    }

    /// Information matrix for a completed alignment: the sigma diagonal
    /// attenuated by `1 / (1 + fitness)`. A perfect alignment keeps the
    /// full sigma-implied weight, a poor one constrains the graph
    /// proportionally less.
    pub fn information_for_fitness(&self, fitness_score: f64) -> Matrix6 {
        self.information() / (1.0 + fitness_score.max(0.0))
    }
}

/// Result of one alignment.
#[derive(Debug, Clone)]
pub struct GicpMeasurement {
    /// Measured transform from source to target.
    pub transform: Pose,

    /// 6×6 information matrix of the measurement.
    pub information: Matrix6,

    /// Mean squared correspondence distance at convergence.
    pub fitness_score: f64,

    /// Whether the alignment is usable as a constraint.
    pub valid: bool,
}

/// A point-cloud registration backend.
pub trait GicpAligner {
    /// Align the target cloud against the source cloud, starting from
    /// `guess` (the expected `source⁻¹ ∘ target`).
    ///
    /// An `Err` means the computation itself failed (e.g. empty input);
    /// a poor but completed alignment is returned with `valid = false`.
    fn align(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        guess: &Pose,
        config: &GicpConfig,
    ) -> Result<GicpMeasurement>;
}
