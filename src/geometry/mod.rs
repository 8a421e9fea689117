//! Pose and covariance algebra for the 6-DoF pose graph.

pub mod covariance;
pub mod pose;

pub use covariance::{combine_covariance, mahalanobis, switch_convention, Matrix6, Vector6};
pub use pose::{matrix_is_finite, pose_is_finite, Pose};
