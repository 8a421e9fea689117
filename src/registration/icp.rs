//! Built-in point-to-point ICP aligner.
//!
//! Iterates nearest-neighbour correspondence search over a k-d tree with
//! a closed-form SVD rigid solve, GICP-style gating on the fitness
//! score. Small initial errors are assumed; the sequential odometry
//! delta (or the candidate's relative estimate) serves as the guess.

use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Matrix3, Point3, Translation3, UnitQuaternion, Vector3};

use crate::environment::PointCloud;
use crate::error::{Error, Result};
use crate::geometry::Pose;

use super::{GicpAligner, GicpConfig, GicpMeasurement};

/// Minimum number of correspondences for a usable alignment.
const MIN_CORRESPONDENCES: usize = 6;

/// Point-to-point ICP registration.
#[derive(Debug, Default, Clone)]
pub struct PointToPointAligner;

impl PointToPointAligner {
    /// Create the aligner.
    pub fn new() -> Self {
        Self
    }
}

impl GicpAligner for PointToPointAligner {
    fn align(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        guess: &Pose,
        config: &GicpConfig,
    ) -> Result<GicpMeasurement> {
        if source.is_empty() || target.is_empty() {
            return Err(Error::Gicp("cannot align an empty point cloud".into()));
        }

        let mut tree: KdTree<f64, 3> = KdTree::new();
        for (i, point) in source.points.iter().enumerate() {
            tree.add(&[point.x, point.y, point.z], i as u64);
        }

        let max_dist_sq = config.max_correspondence_distance.powi(2);
        let mut transform = *guess;
        let mut fitness = f64::MAX;

        for _ in 0..config.maximum_iterations {
            // Correspondences of target points mapped into the source
            // frame against their nearest source points.
            let mut pairs: Vec<(Point3<f64>, Point3<f64>)> = Vec::with_capacity(target.len());
            let mut error_sum = 0.0;

            for point in &target.points {
                let moved = transform * point;
                let nearest = tree.nearest_one::<SquaredEuclidean>(&[moved.x, moved.y, moved.z]);
                if nearest.distance <= max_dist_sq {
                    error_sum += nearest.distance;
                    pairs.push((moved, source.points[nearest.item as usize]));
                }
            }

            if pairs.len() < MIN_CORRESPONDENCES {
                return Ok(GicpMeasurement {
                    transform,
                    information: config.information_for_fitness(f64::MAX),
                    fitness_score: f64::MAX,
                    valid: false,
                });
            }

            let new_fitness = error_sum / pairs.len() as f64;
            let delta = rigid_fit(&pairs);
            transform = delta * transform;

            let converged = delta.translation.vector.norm() < config.transformation_epsilon
                && delta.rotation.angle() < config.transformation_epsilon;
            let stalled = (fitness - new_fitness).abs() < config.euclidean_fitness_epsilon;
            fitness = new_fitness;
            if converged || stalled {
                break;
            }
        }

        Ok(GicpMeasurement {
            transform,
            information: config.information_for_fitness(fitness),
            fitness_score: fitness,
            valid: fitness <= config.max_fitness_score,
        })
    }
}

/// Closed-form rigid transform minimizing the squared distance between
/// paired points (moved → reference), via SVD of the cross-covariance.
fn rigid_fit(pairs: &[(Point3<f64>, Point3<f64>)]) -> Pose {
    let n = pairs.len() as f64;

    let mut moved_centroid = Vector3::zeros();
    let mut reference_centroid = Vector3::zeros();
    for (moved, reference) in pairs {
        moved_centroid += moved.coords;
        reference_centroid += reference.coords;
    }
    moved_centroid /= n;
    reference_centroid /= n;

    let mut cross = Matrix3::zeros();
    for (moved, reference) in pairs {
        let a = moved.coords - moved_centroid;
        let b = reference.coords - reference_centroid;
        cross += b * a.transpose();
    }

    let svd = cross.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Pose::identity();
    };

    let mut rotation = u * v_t;
    if rotation.determinant() < 0.0 {
        let mut flipped = u;
        flipped.column_mut(2).neg_mut();
        rotation = flipped * v_t;
    }

    let translation = reference_centroid - rotation * moved_centroid;
    Pose::from_parts(
        Translation3::from(translation),
        UnitQuaternion::from_matrix(&rotation),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// A corner-shaped cloud with structure along all three axes.
    fn corner_cloud() -> PointCloud {
        let mut points = Vec::new();
        for i in 0..10 {
            let s = i as f64 * 0.2;
            points.push(Point3::new(s, 0.0, 0.0));
            points.push(Point3::new(0.0, s, 0.0));
            points.push(Point3::new(0.0, 0.0, s));
        }
        PointCloud::new(points, Vector3::zeros())
    }

    fn transformed(cloud: &PointCloud, pose: &Pose) -> PointCloud {
        // Target points expressed in the target frame: p_t = pose⁻¹ p_s.
        let inverse = pose.inverse();
        PointCloud::new(
            cloud.points.iter().map(|p| inverse * p).collect(),
            cloud.sensor_origin,
        )
    }

    #[test]
    fn test_recovers_small_translation() {
        let source = corner_cloud();
        let truth = Pose::translation(0.1, -0.05, 0.08);
        let target = transformed(&source, &truth);

        let result = PointToPointAligner::new()
            .align(&source, &target, &Pose::identity(), &GicpConfig::default())
            .unwrap();

        assert!(result.valid);
        assert_relative_eq!(
            result.transform.translation.vector,
            truth.translation.vector,
            epsilon = 1e-3
        );
    }

    #[test]
    fn test_identity_alignment_is_valid() {
        let source = corner_cloud();
        let result = PointToPointAligner::new()
            .align(&source, &source, &Pose::identity(), &GicpConfig::default())
            .unwrap();

        assert!(result.valid);
        assert!(result.fitness_score < 1e-9);
        assert!(result.transform.translation.vector.norm() < 1e-9);
    }

    #[test]
    fn test_information_reflects_alignment_quality() {
        let source = corner_cloud();
        let clean = PointToPointAligner::new()
            .align(&source, &source, &Pose::identity(), &GicpConfig::default())
            .unwrap();

        // A stretched copy cannot be rigidly aligned, leaving residual
        // fitness that must weaken the edge's information.
        let mut stretched = corner_cloud();
        for p in &mut stretched.points {
            p.coords *= 1.15;
        }
        let noisy = PointToPointAligner::new()
            .align(&source, &stretched, &Pose::identity(), &GicpConfig::default())
            .unwrap();

        assert!(noisy.fitness_score > clean.fitness_score);
        assert!(noisy.information[(0, 0)] < clean.information[(0, 0)]);
    }

    #[test]
    fn test_empty_cloud_fails() {
        let source = corner_cloud();
        let empty = PointCloud::empty();
        let result = PointToPointAligner::new().align(
            &source,
            &empty,
            &Pose::identity(),
            &GicpConfig::default(),
        );
        assert!(matches!(result, Err(Error::Gicp(_))));
    }

    #[test]
    fn test_disjoint_clouds_are_invalid() {
        let source = corner_cloud();
        let mut far = corner_cloud();
        for p in &mut far.points {
            p.x += 1000.0;
        }

        let result = PointToPointAligner::new()
            .align(&source, &far, &Pose::identity(), &GicpConfig::default())
            .unwrap();
        assert!(!result.valid);
    }
}
