//! Spatial vertex grid bounding point-cloud memory.
//!
//! A 2D tiled index over the world XY plane. Each cell accepts a bounded
//! number of cloud-bearing vertices; once a cell overflows, the oldest
//! vertices in that cell are queued for eviction. Eviction only drops the
//! point-cloud attachment, never the pose vertex itself.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::types::VertexId;

/// Grid parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexGridConfig {
    /// Grid extent along X in meters, centered on the origin.
    pub size_x: f64,

    /// Grid extent along Y in meters, centered on the origin.
    pub size_y: f64,

    /// Cell edge length in meters.
    pub cell_resolution: f64,

    /// Maximum number of cloud-bearing vertices per cell.
    pub max_per_cell: usize,
}

impl Default for VertexGridConfig {
    fn default() -> Self {
        Self {
            size_x: 100.0,
            size_y: 100.0,
            cell_resolution: 2.0,
            max_per_cell: 2,
        }
    }
}

/// 2D tiled index over vertex XY positions.
#[derive(Debug, Clone)]
pub struct VertexGrid {
    config: VertexGridConfig,

    /// Cell → vertex ids in insertion order (oldest first).
    cells: HashMap<(i64, i64), Vec<VertexId>>,

    /// Vertices marked for cloud eviction, drained by [`reap`].
    ///
    /// [`reap`]: VertexGrid::reap
    eviction: Vec<VertexId>,
}

impl VertexGrid {
    /// Create an empty grid.
    pub fn new(config: VertexGridConfig) -> Self {
        Self {
            config,
            cells: HashMap::new(),
            eviction: Vec::new(),
        }
    }

    /// Current configuration.
    pub fn config(&self) -> &VertexGridConfig {
        &self.config
    }

    /// Change the per-cell quota. Applies to future additions only;
    /// vertices already accepted are not retroactively evicted.
    pub fn set_max_per_cell(&mut self, max_per_cell: usize) {
        self.config.max_per_cell = max_per_cell;
    }

    /// Place a vertex into its cell. Positions outside the grid extent
    /// are ignored; such vertices are never evicted.
    pub fn add_vertex(&mut self, id: VertexId, x: f64, y: f64) {
        let Some(cell_index) = self.cell_index(x, y) else {
            return;
        };

        let cell = self.cells.entry(cell_index).or_default();
        cell.push(id);

        while cell.len() > self.config.max_per_cell {
            let evicted = cell.remove(0);
            self.eviction.push(evicted);
        }
    }

    /// Return and clear the list of vertices marked for eviction.
    pub fn reap(&mut self) -> Vec<VertexId> {
        std::mem::take(&mut self.eviction)
    }

    /// Number of vertices currently held in `(x, y)`'s cell.
    pub fn occupancy(&self, x: f64, y: f64) -> usize {
        self.cell_index(x, y)
            .and_then(|index| self.cells.get(&index))
            .map_or(0, Vec::len)
    }

    /// Drop all cells and pending evictions.
    pub fn clear(&mut self) {
        self.cells.clear();
        self.eviction.clear();
    }

    fn cell_index(&self, x: f64, y: f64) -> Option<(i64, i64)> {
        if x.abs() > self.config.size_x / 2.0 || y.abs() > self.config.size_y / 2.0 {
            return None;
        }
        let ix = (x / self.config.cell_resolution).floor() as i64;
        let iy = (y / self.config.cell_resolution).floor() as i64;
        Some((ix, iy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(max_per_cell: usize) -> VertexGrid {
        VertexGrid::new(VertexGridConfig {
            size_x: 10.0,
            size_y: 10.0,
            cell_resolution: 1.0,
            max_per_cell,
        })
    }

    #[test]
    fn test_quota_evicts_oldest() {
        let mut g = grid(2);
        g.add_vertex(VertexId::new(0), 0.5, 0.5);
        g.add_vertex(VertexId::new(1), 0.6, 0.4);
        g.add_vertex(VertexId::new(2), 0.2, 0.8);

        assert_eq!(g.reap(), vec![VertexId::new(0)]);
        assert!(g.reap().is_empty());
        assert_eq!(g.occupancy(0.5, 0.5), 2);
    }

    #[test]
    fn test_outside_extent_is_ignored() {
        let mut g = grid(1);
        g.add_vertex(VertexId::new(0), 50.0, 0.0);
        g.add_vertex(VertexId::new(1), 0.0, -50.0);

        assert!(g.reap().is_empty());
        assert_eq!(g.occupancy(50.0, 0.0), 0);
    }

    #[test]
    fn test_distinct_cells_do_not_interact() {
        let mut g = grid(1);
        g.add_vertex(VertexId::new(0), 0.5, 0.5);
        g.add_vertex(VertexId::new(1), 1.5, 0.5);
        g.add_vertex(VertexId::new(2), -0.5, 0.5);

        assert!(g.reap().is_empty());
    }

    #[test]
    fn test_quota_change_applies_to_future_additions_only() {
        let mut g = grid(3);
        g.add_vertex(VertexId::new(0), 0.5, 0.5);
        g.add_vertex(VertexId::new(1), 0.5, 0.5);
        g.add_vertex(VertexId::new(2), 0.5, 0.5);

        g.set_max_per_cell(1);
        assert!(g.reap().is_empty());

        g.add_vertex(VertexId::new(3), 0.5, 0.5);
        assert_eq!(g.reap(), vec![VertexId::new(0), VertexId::new(1), VertexId::new(2)]);
    }

    #[test]
    fn test_negative_coordinates_bucket_correctly() {
        let mut g = grid(1);
        g.add_vertex(VertexId::new(0), -0.5, -0.5);
        g.add_vertex(VertexId::new(1), -0.4, -0.6);

        assert_eq!(g.reap(), vec![VertexId::new(0)]);
    }
}
