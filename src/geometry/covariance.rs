//! 6×6 pose covariance handling.
//!
//! Two block conventions exist for 6-DoF covariances: position-first
//! (estimator side) and orientation-first (the external pose-with-
//! uncertainty representation). [`switch_convention`] swaps between them
//! and is applied at every boundary crossing.

use nalgebra::{Matrix3, SMatrix, SVector, Vector3};

/// 6×6 covariance / information matrix.
pub type Matrix6 = SMatrix<f64, 6, 6>;

/// 6-vector in the pose tangent chart.
pub type Vector6 = SVector<f64, 6>;

/// Swap the position and orientation 3×3 blocks of a 6×6 covariance.
///
/// Involutive: applying it twice returns the input.
pub fn switch_convention(cov: &Matrix6) -> Matrix6 {
    let mut out = Matrix6::zeros();
    out.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&cov.fixed_view::<3, 3>(3, 3).into_owned());
    out.fixed_view_mut::<3, 3>(3, 3)
        .copy_from(&cov.fixed_view::<3, 3>(0, 0).into_owned());
    out.fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&cov.fixed_view::<3, 3>(3, 0).into_owned());
    out.fixed_view_mut::<3, 3>(3, 0)
        .copy_from(&cov.fixed_view::<3, 3>(0, 3).into_owned());
    out
}

/// Build a position-first 6×6 covariance from separate position and
/// orientation blocks, as delivered by odometry samples.
pub fn combine_covariance(position: &Matrix3<f64>, orientation: &Matrix3<f64>) -> Matrix6 {
    let mut out = Matrix6::zeros();
    out.fixed_view_mut::<3, 3>(0, 0).copy_from(position);
    out.fixed_view_mut::<3, 3>(3, 3).copy_from(orientation);
    out
}

/// Mahalanobis distance of a 3D displacement under a 3×3 covariance.
///
/// Returns `+∞` when the covariance is singular.
pub fn mahalanobis(displacement: &Vector3<f64>, cov: &Matrix3<f64>) -> f64 {
    match cov.try_inverse() {
        Some(inv) => {
            let d2 = (displacement.transpose() * inv * displacement)[(0, 0)];
            if d2 >= 0.0 {
                d2.sqrt()
            } else {
                f64::INFINITY
            }
        }
        None => f64::INFINITY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_covariance() -> Matrix6 {
        let mut cov = Matrix6::zeros();
        for i in 0..6 {
            for j in 0..6 {
                cov[(i, j)] = (i * 6 + j) as f64;
            }
        }
        cov
    }

    #[test]
    fn test_switch_convention_is_involutive() {
        let cov = test_covariance();
        let twice = switch_convention(&switch_convention(&cov));
        assert_eq!(twice, cov);
    }

    #[test]
    fn test_switch_convention_swaps_blocks() {
        let cov = test_covariance();
        let switched = switch_convention(&cov);

        assert_eq!(switched[(0, 0)], cov[(3, 3)]);
        assert_eq!(switched[(3, 3)], cov[(0, 0)]);
        assert_eq!(switched[(0, 3)], cov[(3, 0)]);
        assert_eq!(switched[(3, 0)], cov[(0, 3)]);
    }

    #[test]
    fn test_combine_covariance_blocks() {
        let pos = Matrix3::identity() * 2.0;
        let ori = Matrix3::identity() * 3.0;
        let combined = combine_covariance(&pos, &ori);

        assert_eq!(combined[(0, 0)], 2.0);
        assert_eq!(combined[(5, 5)], 3.0);
        assert_eq!(combined[(0, 3)], 0.0);
    }

    #[test]
    fn test_mahalanobis_identity_covariance() {
        let d = Vector3::new(3.0, 4.0, 0.0);
        let m = mahalanobis(&d, &Matrix3::identity());
        assert_relative_eq!(m, 5.0, epsilon = 1e-12);
    }

    #[test]
    fn test_mahalanobis_scales_with_covariance() {
        let d = Vector3::new(1.0, 0.0, 0.0);
        let m = mahalanobis(&d, &(Matrix3::identity() * 4.0));
        assert_relative_eq!(m, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_mahalanobis_singular_covariance() {
        let d = Vector3::new(1.0, 1.0, 1.0);
        let m = mahalanobis(&d, &Matrix3::zeros());
        assert!(m.is_infinite());
    }
}
