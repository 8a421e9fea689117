//! Point clouds owned by the environment.

use nalgebra::{Point3, Vector3};

/// Handle to a point cloud stored in the environment.
///
/// Vertices reference clouds through this handle for the duration of the
/// attachment; the cloud itself lives in the environment's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CloudId(pub u64);

impl CloudId {
    /// Create a new CloudId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CloudId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cloud{}", self.0)
    }
}

/// A 3D point cloud in its sensor frame.
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    /// Points in the frame of the vertex the cloud is attached to.
    pub points: Vec<Point3<f64>>,

    /// Sensor origin within that frame.
    pub sensor_origin: Vector3<f64>,
}

impl PointCloud {
    /// Create a cloud from points and sensor origin.
    pub fn new(points: Vec<Point3<f64>>, sensor_origin: Vector3<f64>) -> Self {
        Self {
            points,
            sensor_origin,
        }
    }

    /// Empty cloud at the frame origin.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the cloud holds no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Keep roughly `density · len` points by striding through the
    /// cloud. `density` is clamped to `(0, 1]`; full density returns a
    /// plain clone.
    pub fn subsample(&self, density: f64) -> Self {
        let density = density.clamp(f64::MIN_POSITIVE, 1.0);
        if density >= 1.0 {
            return self.clone();
        }
        let stride = (1.0 / density).round().max(1.0) as usize;
        Self {
            points: self.points.iter().step_by(stride).copied().collect(),
            sensor_origin: self.sensor_origin,
        }
    }
}
