//! Multi-level surface (MLS) grid projection.
//!
//! A 2.5D map representation: point clouds are projected into XY cells,
//! each cell accumulating the height statistics of the points that fall
//! into it. The grid is rebuilt from scratch on every refresh so that it
//! always reflects the optimized poses.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::geometry::Pose;

use super::cloud::PointCloud;

/// Area of interest and resolution of the MLS grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlsConfig {
    /// Grid extent along X in meters, centered on the origin.
    pub size_x: f64,

    /// Grid extent along Y in meters, centered on the origin.
    pub size_y: f64,

    /// Cell size along X in meters.
    pub resolution_x: f64,

    /// Cell size along Y in meters.
    pub resolution_y: f64,

    /// Points below this height are discarded.
    pub min_z: f64,

    /// Points above this height are discarded.
    pub max_z: f64,
}

impl Default for MlsConfig {
    fn default() -> Self {
        Self {
            size_x: 50.0,
            size_y: 50.0,
            resolution_x: 0.1,
            resolution_y: 0.1,
            min_z: -2.0,
            max_z: 2.0,
        }
    }
}

/// Height statistics of one grid cell.
#[derive(Debug, Clone, Copy)]
pub struct MlsPatch {
    /// Lowest observed height.
    pub min: f64,

    /// Highest observed height.
    pub max: f64,

    /// Sum of observed heights.
    pub sum: f64,

    /// Number of contributing points.
    pub count: usize,
}

impl MlsPatch {
    fn new(z: f64) -> Self {
        Self {
            min: z,
            max: z,
            sum: z,
            count: 1,
        }
    }

    fn accumulate(&mut self, z: f64) {
        self.min = self.min.min(z);
        self.max = self.max.max(z);
        self.sum += z;
        self.count += 1;
    }

    /// Mean observed height.
    pub fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }
}

/// The projection operator together with its grid.
#[derive(Debug, Clone)]
pub struct MlsGrid {
    config: MlsConfig,
    cells: HashMap<(i64, i64), MlsPatch>,
}

impl MlsGrid {
    /// Create an empty grid for the given area of interest.
    pub fn new(config: MlsConfig) -> Self {
        Self {
            config,
            cells: HashMap::new(),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> &MlsConfig {
        &self.config
    }

    /// Rebind the area of interest, dropping the current cells.
    pub fn reconfigure(&mut self, config: MlsConfig) {
        self.config = config;
        self.cells.clear();
    }

    /// Project a cloud posed in the world frame into the grid.
    pub fn project(&mut self, cloud: &PointCloud, pose: &Pose) {
        for point in &cloud.points {
            let world = pose * point;
            if world.z < self.config.min_z || world.z > self.config.max_z {
                continue;
            }
            let Some(index) = self.cell_index(world.x, world.y) else {
                continue;
            };
            self.cells
                .entry(index)
                .and_modify(|patch| patch.accumulate(world.z))
                .or_insert_with(|| MlsPatch::new(world.z));
        }
    }

    /// Drop all cells, keeping the configuration.
    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Patch covering the world position `(x, y)`, if any.
    pub fn patch(&self, x: f64, y: f64) -> Option<&MlsPatch> {
        self.cells.get(&self.cell_index(x, y)?)
    }

    /// Number of occupied cells.
    pub fn num_occupied(&self) -> usize {
        self.cells.len()
    }

    fn cell_index(&self, x: f64, y: f64) -> Option<(i64, i64)> {
        if x.abs() > self.config.size_x / 2.0 || y.abs() > self.config.size_y / 2.0 {
            return None;
        }
        let ix = (x / self.config.resolution_x).floor() as i64;
        let iy = (y / self.config.resolution_y).floor() as i64;
        Some((ix, iy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point3, Vector3};

    fn flat_cloud() -> PointCloud {
        PointCloud::new(
            vec![
                Point3::new(0.05, 0.05, 0.2),
                Point3::new(0.05, 0.05, 0.4),
                Point3::new(1.05, 0.05, 0.3),
            ],
            Vector3::zeros(),
        )
    }

    #[test]
    fn test_project_accumulates_heights() {
        let mut grid = MlsGrid::new(MlsConfig::default());
        grid.project(&flat_cloud(), &Pose::identity());

        let patch = grid.patch(0.05, 0.05).unwrap();
        assert_eq!(patch.count, 2);
        assert_eq!(patch.min, 0.2);
        assert_eq!(patch.max, 0.4);
        assert!((patch.mean() - 0.3).abs() < 1e-12);
        assert_eq!(grid.num_occupied(), 2);
    }

    #[test]
    fn test_project_respects_height_bounds() {
        let config = MlsConfig {
            min_z: 0.0,
            max_z: 0.25,
            ..MlsConfig::default()
        };
        let mut grid = MlsGrid::new(config);
        grid.project(&flat_cloud(), &Pose::identity());

        assert_eq!(grid.patch(0.05, 0.05).unwrap().count, 1);
    }

    #[test]
    fn test_project_applies_pose() {
        let mut grid = MlsGrid::new(MlsConfig::default());
        grid.project(&flat_cloud(), &Pose::translation(5.0, 0.0, 0.0));

        assert!(grid.patch(0.05, 0.05).is_none());
        assert!(grid.patch(5.05, 0.05).is_some());
    }

    #[test]
    fn test_clear_keeps_configuration() {
        let mut grid = MlsGrid::new(MlsConfig::default());
        grid.project(&flat_cloud(), &Pose::identity());
        grid.clear();

        assert_eq!(grid.num_occupied(), 0);
        assert_eq!(grid.config().resolution_x, 0.1);
    }
}
