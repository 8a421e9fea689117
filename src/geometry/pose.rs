//! Rigid-body pose helpers.
//!
//! Poses are nalgebra isometries (rotation + translation). The back-end
//! composes them directly; this module only adds the tangent-space chart
//! used by the solver and the finiteness guards applied at the input
//! boundary.

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

use super::covariance::{Matrix6, Vector6};

/// A 6-DoF rigid-body transform.
pub type Pose = Isometry3<f64>;

/// Check that every component of a pose is finite.
///
/// Odometry drivers occasionally emit NaN poses on startup; anything
/// non-finite must be rejected before a vertex is created.
pub fn pose_is_finite(pose: &Pose) -> bool {
    pose.translation.vector.iter().all(|v| v.is_finite())
        && pose.rotation.coords.iter().all(|v| v.is_finite())
}

/// Check that every entry of a 6×6 matrix is finite.
pub fn matrix_is_finite(matrix: &Matrix6) -> bool {
    matrix.iter().all(|v| v.is_finite())
}

/// Map a pose onto its 6-vector chart: translation first, then the
/// rotation's scaled axis.
///
/// This is a global chart (bijective away from half-turn rotations), not
/// the SE(3) exponential; it matches the translation-first ordering used
/// throughout the estimator.
pub fn pose_to_chart(pose: &Pose) -> Vector6 {
    let t = pose.translation.vector;
    let r = pose.rotation.scaled_axis();
    Vector6::new(t.x, t.y, t.z, r.x, r.y, r.z)
}

/// Inverse of [`pose_to_chart`].
pub fn chart_to_pose(chart: &Vector6) -> Pose {
    let translation = Translation3::new(chart[0], chart[1], chart[2]);
    let rotation = UnitQuaternion::from_scaled_axis(Vector3::new(chart[3], chart[4], chart[5]));
    Pose::from_parts(translation, rotation)
}

/// Residual of a relative-pose constraint: the chart coordinates of
/// `measurement⁻¹ ∘ (source⁻¹ ∘ target)`.
pub fn relative_pose_error(source: &Pose, target: &Pose, measurement: &Pose) -> Vector6 {
    let predicted = source.inverse() * target;
    pose_to_chart(&(measurement.inverse() * predicted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_chart_round_trip() {
        let pose = Pose::from_parts(
            Translation3::new(1.0, -2.0, 0.5),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.1, 0.2, -0.3)),
        );

        let recovered = chart_to_pose(&pose_to_chart(&pose));

        assert_relative_eq!(
            recovered.translation.vector,
            pose.translation.vector,
            epsilon = 1e-12
        );
        assert!(recovered.rotation.angle_to(&pose.rotation) < 1e-12);
    }

    #[test]
    fn test_pose_is_finite_rejects_nan() {
        let mut pose = Pose::identity();
        assert!(pose_is_finite(&pose));

        pose.translation.vector.x = f64::NAN;
        assert!(!pose_is_finite(&pose));
    }

    #[test]
    fn test_relative_pose_error_zero_for_exact_measurement() {
        let source = Pose::translation(1.0, 0.0, 0.0);
        let target = Pose::translation(2.0, 1.0, 0.0);
        let measurement = source.inverse() * target;

        let error = relative_pose_error(&source, &target, &measurement);
        assert!(error.norm() < 1e-12);
    }

    #[test]
    fn test_relative_pose_error_translation() {
        let source = Pose::identity();
        let target = Pose::translation(1.0, 0.0, 0.0);

        let error = relative_pose_error(&source, &target, &Pose::identity());
        assert_relative_eq!(error[0], 1.0, epsilon = 1e-12);
        assert!(error.rows(1, 5).norm() < 1e-12);
    }
}
