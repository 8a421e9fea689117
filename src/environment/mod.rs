//! Scene graph mirror of the optimized trajectory.
//!
//! The environment owns every point cloud and keeps one frame node per
//! cloud-bearing vertex under a single root. Frame transforms mirror the
//! optimized estimates; the optional MLS grid is re-projected from the
//! registered frames whenever the map is refreshed.

pub mod cloud;
pub mod mls;

use std::collections::BTreeMap;

use crate::geometry::{Matrix6, Pose};
use crate::graph::VertexId;

pub use cloud::{CloudId, PointCloud};
pub use mls::{MlsConfig, MlsGrid, MlsPatch};

/// A frame node of the scene graph.
///
/// Holds no back-pointer to the vertex beyond its id.
#[derive(Debug, Clone)]
pub struct FrameNode {
    /// Id of the mirrored vertex.
    pub vertex: VertexId,

    /// World transform, mirroring the optimized estimate.
    pub transform: Pose,

    /// Marginal covariance in the external convention, when known.
    pub covariance: Option<Matrix6>,

    /// The cloud bound to this frame.
    pub cloud: CloudId,
}

/// Cloud store plus frame-node scene graph plus optional MLS projection.
#[derive(Debug, Default)]
pub struct Environment {
    clouds: BTreeMap<CloudId, PointCloud>,
    frames: BTreeMap<VertexId, FrameNode>,
    next_cloud_id: u64,
    mls: Option<MlsGrid>,
    mls_enabled: bool,
}

impl Environment {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Cloud store
    // ─────────────────────────────────────────────────────────────────────

    /// Take ownership of a cloud, returning its handle.
    pub fn insert_cloud(&mut self, cloud: PointCloud) -> CloudId {
        let id = CloudId::new(self.next_cloud_id);
        self.next_cloud_id += 1;
        self.clouds.insert(id, cloud);
        id
    }

    /// Look up a cloud.
    pub fn cloud(&self, id: CloudId) -> Option<&PointCloud> {
        self.clouds.get(&id)
    }

    /// Destroy a cloud.
    pub fn remove_cloud(&mut self, id: CloudId) -> Option<PointCloud> {
        self.clouds.remove(&id)
    }

    /// Number of stored clouds.
    pub fn num_clouds(&self) -> usize {
        self.clouds.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Frame nodes
    // ─────────────────────────────────────────────────────────────────────

    /// Create the frame node for a vertex, parent it to the root, and
    /// bind the cloud to it.
    pub fn register_vertex(&mut self, vertex: VertexId, cloud: CloudId, transform: Pose) {
        self.frames.insert(
            vertex,
            FrameNode {
                vertex,
                transform,
                covariance: None,
                cloud,
            },
        );
    }

    /// Detach and destroy the frame node of a vertex together with its
    /// cloud. Returns the destroyed cloud's handle.
    pub fn unregister_cloud(&mut self, vertex: VertexId) -> Option<CloudId> {
        let frame = self.frames.remove(&vertex)?;
        self.clouds.remove(&frame.cloud);
        Some(frame.cloud)
    }

    /// Mirror an optimized estimate (and its uncertainty) into the
    /// vertex's frame node.
    pub fn set_frame_state(&mut self, vertex: VertexId, transform: Pose, covariance: Option<Matrix6>) {
        if let Some(frame) = self.frames.get_mut(&vertex) {
            frame.transform = transform;
            frame.covariance = covariance;
        }
    }

    /// Frame node of a vertex, if registered.
    pub fn frame_node(&self, vertex: VertexId) -> Option<&FrameNode> {
        self.frames.get(&vertex)
    }

    /// All frame nodes in vertex order.
    pub fn frames(&self) -> impl Iterator<Item = &FrameNode> {
        self.frames.values()
    }

    /// Number of frame nodes.
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    // ─────────────────────────────────────────────────────────────────────
    // MLS projection
    // ─────────────────────────────────────────────────────────────────────

    /// Enable MLS projection. Creates the grid on first enable, rebinds
    /// the area of interest on re-enable.
    pub fn enable_mls(&mut self, config: MlsConfig) {
        match &mut self.mls {
            Some(grid) => grid.reconfigure(config),
            None => self.mls = Some(MlsGrid::new(config)),
        }
        self.mls_enabled = true;
    }

    /// Disable MLS projection: clears the grid but retains the
    /// projection object for later re-enable.
    pub fn disable_mls(&mut self) {
        if let Some(grid) = &mut self.mls {
            grid.clear();
        }
        self.mls_enabled = false;
    }

    /// Whether projection is currently enabled.
    pub fn mls_enabled(&self) -> bool {
        self.mls_enabled
    }

    /// The MLS grid, if it was ever enabled.
    pub fn mls_grid(&self) -> Option<&MlsGrid> {
        self.mls.as_ref()
    }

    /// Clear the grid and re-project every registered frame's cloud at
    /// its current transform. No-op while disabled.
    pub fn reproject_mls(&mut self) {
        if !self.mls_enabled {
            return;
        }
        let Some(grid) = &mut self.mls else {
            return;
        };
        grid.clear();
        for frame in self.frames.values() {
            if let Some(cloud) = self.clouds.get(&frame.cloud) {
                grid.project(cloud, &frame.transform);
            }
        }
    }

    /// Release every cloud, frame node, and grid cell.
    pub fn clear(&mut self) {
        self.clouds.clear();
        self.frames.clear();
        self.next_cloud_id = 0;
        if let Some(grid) = &mut self.mls {
            grid.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point3, Vector3};

    fn small_cloud() -> PointCloud {
        PointCloud::new(vec![Point3::new(0.1, 0.1, 0.5)], Vector3::zeros())
    }

    #[test]
    fn test_register_and_unregister() {
        let mut env = Environment::new();
        let cloud = env.insert_cloud(small_cloud());
        env.register_vertex(VertexId::new(0), cloud, Pose::identity());

        assert_eq!(env.num_frames(), 1);
        assert_eq!(env.frame_node(VertexId::new(0)).unwrap().cloud, cloud);

        assert_eq!(env.unregister_cloud(VertexId::new(0)), Some(cloud));
        assert_eq!(env.num_frames(), 0);
        assert_eq!(env.num_clouds(), 0);
        assert!(env.unregister_cloud(VertexId::new(0)).is_none());
    }

    #[test]
    fn test_frame_state_mirrors_estimate() {
        let mut env = Environment::new();
        let cloud = env.insert_cloud(small_cloud());
        env.register_vertex(VertexId::new(0), cloud, Pose::identity());

        let optimized = Pose::translation(1.0, 2.0, 0.0);
        env.set_frame_state(VertexId::new(0), optimized, Some(Matrix6::identity()));

        let frame = env.frame_node(VertexId::new(0)).unwrap();
        assert_eq!(frame.transform.translation.vector.x, 1.0);
        assert!(frame.covariance.is_some());
    }

    #[test]
    fn test_mls_enable_disable_cycle() {
        let mut env = Environment::new();
        let cloud = env.insert_cloud(small_cloud());
        env.register_vertex(VertexId::new(0), cloud, Pose::identity());

        env.enable_mls(MlsConfig::default());
        env.reproject_mls();
        assert_eq!(env.mls_grid().unwrap().num_occupied(), 1);

        env.disable_mls();
        assert_eq!(env.mls_grid().unwrap().num_occupied(), 0);

        // Re-enable rebinds and a refresh repopulates.
        env.enable_mls(MlsConfig::default());
        env.reproject_mls();
        assert_eq!(env.mls_grid().unwrap().num_occupied(), 1);
    }

    #[test]
    fn test_reprojection_follows_frame_transform() {
        let mut env = Environment::new();
        let cloud = env.insert_cloud(small_cloud());
        env.register_vertex(VertexId::new(0), cloud, Pose::identity());
        env.enable_mls(MlsConfig::default());

        env.set_frame_state(VertexId::new(0), Pose::translation(3.0, 0.0, 0.0), None);
        env.reproject_mls();

        let grid = env.mls_grid().unwrap();
        assert!(grid.patch(3.1, 0.1).is_some());
        assert!(grid.patch(0.1, 0.1).is_none());
    }
}
