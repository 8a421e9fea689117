//! Pose-graph back-end driver.
//!
//! [`SlamBackend`] owns the graph model, the primary solver, the shadow
//! covariance graph, the environment, and the optional vertex grid. New
//! sensor frames enter through [`add_vertex`]; staged entities are
//! committed and estimated by [`optimize`]; [`refresh_environment`]
//! reflects the optimized poses outward.
//!
//! The back-end is single-threaded and non-reentrant per instance.
//! Multiple instances are independent.
//!
//! [`add_vertex`]: SlamBackend::add_vertex
//! [`optimize`]: SlamBackend::optimize
//! [`refresh_environment`]: SlamBackend::refresh_environment

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::environment::{Environment, MlsConfig, PointCloud};
use crate::error::{Error, Result};
use crate::geometry::{
    matrix_is_finite, pose_is_finite, switch_convention, Matrix6, Pose,
};
use crate::graph::{
    EdgeKey, PoseGraph, PoseVertex, RelativePoseEdge, VertexGrid, VertexGridConfig, VertexId,
};
use crate::registration::{GicpAligner, GicpConfig, PointToPointAligner};
use crate::solver::{LmSolver, SparseSolver};

use super::shadow::ShadowGraph;

/// The pose-graph SLAM back-end.
pub struct SlamBackend {
    pub(crate) graph: PoseGraph,
    pub(crate) solver: Box<dyn SparseSolver>,
    pub(crate) shadow: ShadowGraph,
    pub(crate) environment: Environment,
    pub(crate) aligner: Box<dyn GicpAligner>,
    pub(crate) gicp_config: GicpConfig,
    pub(crate) vertex_grid: Option<VertexGrid>,

    pub(crate) next_id: u64,
    pub(crate) initialized: bool,
    pub(crate) pending_vertices: BTreeSet<VertexId>,
    pub(crate) pending_edges: BTreeSet<EdgeKey>,
    pub(crate) last_vertex: Option<VertexId>,
    pub(crate) odometry_pose_last: Pose,
    pub(crate) odometry_covariance_last: Matrix6,
    pub(crate) map_update_necessary: bool,
    pub(crate) new_candidates: bool,
}

impl SlamBackend {
    /// Create a back-end with the built-in solver and aligner.
    pub fn new() -> Self {
        Self::with_parts(
            Box::new(LmSolver::new()),
            Box::new(PointToPointAligner::new()),
        )
    }

    /// Create a back-end over caller-provided solver and aligner.
    pub fn with_parts(solver: Box<dyn SparseSolver>, aligner: Box<dyn GicpAligner>) -> Self {
        Self {
            graph: PoseGraph::new(),
            solver,
            shadow: ShadowGraph::new(),
            environment: Environment::new(),
            aligner,
            gicp_config: GicpConfig::default(),
            vertex_grid: None,
            next_id: 0,
            initialized: false,
            pending_vertices: BTreeSet::new(),
            pending_edges: BTreeSet::new(),
            last_vertex: None,
            odometry_pose_last: Pose::identity(),
            odometry_covariance_last: Matrix6::identity(),
            map_update_necessary: false,
            new_candidates: false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────

    /// Replace the registration parameters. Every existing registration
    /// edge is reconfigured for its subsequent alignments.
    pub fn set_gicp_config(&mut self, config: GicpConfig) {
        for edge in self.graph.edges_mut() {
            edge.set_gicp_config(&config);
        }
        self.gicp_config = config;
    }

    /// Current registration parameters.
    pub fn gicp_config(&self) -> &GicpConfig {
        &self.gicp_config
    }

    /// Enable the vertex grid. Replaces any previous grid.
    pub fn setup_vertex_grid(&mut self, config: VertexGridConfig) {
        self.vertex_grid = Some(VertexGrid::new(config));
    }

    /// Enable (`Some`) or disable (`None`) the MLS projection.
    pub fn configure_mls(&mut self, config: Option<MlsConfig>) {
        match config {
            Some(config) => self.environment.enable_mls(config),
            None => self.environment.disable_mls(),
        }
        self.map_update_necessary = true;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Vertex lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Feed one odometry-referenced sensor frame into the graph.
    ///
    /// `pose` and `covariance` are the odometry pose and its 6×6
    /// covariance in the external (orientation-first) convention; the
    /// cloud is expressed in the new vertex's frame and carries its own
    /// sensor origin.
    ///
    /// The first vertex of a trajectory is fixed at the odometry pose.
    /// Every later vertex is chained to its predecessor by a sequential
    /// registration edge whose provisional measurement is the odometry
    /// delta; unless `delayed_gicp` is set, the alignment runs here and
    /// a registration failure fails the whole add with no effects.
    pub fn add_vertex(
        &mut self,
        pose: Pose,
        covariance: Matrix6,
        cloud: PointCloud,
        delayed_gicp: bool,
    ) -> Result<VertexId> {
        if self.next_id == u64::MAX {
            return Err(Error::IdSpaceExhausted);
        }
        if !pose_is_finite(&pose) || !matrix_is_finite(&covariance) {
            return Err(Error::NonFiniteInput);
        }

        let covariance = switch_convention(&covariance);
        let id = VertexId::new(self.next_id);
        let density = self.gicp_config.point_cloud_density;
        let filtered = cloud.subsample(density);

        // Everything fallible runs before the first allocation, so a
        // failure leaves the graph, solver, and environment untouched.
        let chain = match self.last_vertex {
            None => None,
            Some(source) => {
                let source_estimate = *self
                    .graph
                    .vertex(source)
                    .ok_or(Error::VertexNotFound(source))?
                    .estimate();

                let delta_pose = self.odometry_pose_last.inverse() * pose;
                let last_cov_inverse =
                    self.odometry_covariance_last.try_inverse().ok_or_else(|| {
                        Error::Graph("previous odometry covariance is singular".into())
                    })?;
                let delta_cov = last_cov_inverse * covariance;
                let information = (Matrix6::identity() + delta_cov)
                    .try_inverse()
                    .ok_or_else(|| Error::Graph("covariance delta is singular".into()))?;

                let estimate = source_estimate * delta_pose;
                let mut edge = RelativePoseEdge::new_gicp(
                    source,
                    id,
                    delta_pose,
                    information,
                    self.gicp_config.clone(),
                    true,
                );

                if !delayed_gicp {
                    let source_cloud = self
                        .graph
                        .vertex(source)
                        .and_then(|v| v.cloud())
                        .and_then(|c| self.environment.cloud(c))
                        .ok_or_else(|| {
                            Error::Gicp(format!("source vertex {source} has no point cloud"))
                        })?;
                    let measurement =
                        self.aligner
                            .align(source_cloud, &filtered, &delta_pose, &self.gicp_config)?;
                    edge.apply_measurement(&measurement);
                }

                Some((estimate, edge))
            }
        };

        let cloud_id = self.environment.insert_cloud(filtered);
        let mut vertex = PoseVertex::new(id);
        vertex.attach_cloud(cloud_id, density);

        let estimate = match &chain {
            None => {
                vertex.set_fixed(true);
                self.map_update_necessary = true;
                pose
            }
            Some((estimate, _)) => *estimate,
        };
        vertex.set_estimate(estimate);

        if let Err(err) = self.graph.add_vertex(vertex) {
            self.environment.remove_cloud(cloud_id);
            return Err(err);
        }
        self.environment.register_vertex(id, cloud_id, estimate);

        if let Some((_, edge)) = chain {
            let key = edge.key();
            if let Err(err) = self.graph.add_edge(edge) {
                self.environment.unregister_cloud(id);
                self.graph.remove_vertex(id);
                return Err(err);
            }
            self.pending_edges.insert(key);
        }

        self.pending_vertices.insert(id);
        self.odometry_pose_last = pose;
        self.odometry_covariance_last = covariance;
        self.last_vertex = Some(id);
        self.next_id += 1;

        debug!(vertex = %id, "staged pose vertex");
        Ok(id)
    }

    /// Remove a vertex with all its edges, its shadow mirror, and its
    /// scene frame. The odometry chain tail cannot be removed.
    pub fn remove_vertex(&mut self, id: VertexId) -> Result<()> {
        if self.last_vertex == Some(id) {
            return Err(Error::Graph(format!(
                "vertex {id} is the odometry chain tail and cannot be removed"
            )));
        }
        if self.graph.vertex(id).is_none() {
            return Err(Error::VertexNotFound(id));
        }

        self.environment.unregister_cloud(id);
        self.shadow.remove_vertex(id);
        self.graph.remove_vertex(id);
        if self.solver.contains_vertex(id) {
            self.solver.remove_vertex(id)?;
            // Hessian indices must be rebuilt around the hole.
            self.initialized = false;
        }
        self.pending_vertices.remove(&id);
        self.pending_edges.retain(|key| !key.involves(id));
        self.map_update_necessary = true;
        Ok(())
    }

    /// Detach a vertex's point cloud: the scene frame and the shadow
    /// mirror go away, the pose vertex and its constraints remain.
    pub fn remove_cloud_from_vertex(&mut self, id: VertexId) -> Result<()> {
        let vertex = self.graph.vertex_mut(id).ok_or(Error::VertexNotFound(id))?;
        if vertex.detach_cloud().is_none() {
            return Ok(());
        }
        self.environment.unregister_cloud(id);
        self.shadow.remove_vertex(id);
        self.map_update_necessary = true;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Optimization
    // ─────────────────────────────────────────────────────────────────────

    /// Commit staged entities and run the estimator.
    ///
    /// Within one call: delayed alignments resolve first, then the
    /// shadow graph is updated and run, then the primary graph, then
    /// newly staged vertices enter the vertex grid (evictions drop their
    /// clouds), and finally the staging sets are cleared.
    pub fn optimize(&mut self, iterations: usize, online: bool) -> Result<usize> {
        if self.solver.num_vertices() == 0 && self.pending_vertices.len() < 2 {
            return Ok(0);
        }

        let result = if !self.pending_vertices.is_empty() || !self.pending_edges.is_empty() {
            self.resolve_delayed_measurements();

            let staged_vertices: Vec<(VertexId, Pose, bool, bool)> = self
                .pending_vertices
                .iter()
                .filter_map(|&id| {
                    self.graph
                        .vertex(id)
                        .map(|v| (id, *v.estimate(), v.is_fixed(), v.has_cloud()))
                })
                .collect();
            let staged_edges: Vec<(VertexId, VertexId, Pose, Matrix6)> = self
                .pending_edges
                .iter()
                .filter_map(|&key| {
                    self.graph
                        .edge_between(key.lower(), key.upper())
                        .map(|e| (e.source, e.target, e.measurement, e.information))
                })
                .collect();

            // Shadow update precedes the primary update.
            for &(id, _, fixed, has_cloud) in &staged_vertices {
                if has_cloud {
                    self.shadow.mirror_vertex(id, fixed)?;
                }
            }
            for &(source, target, _, information) in &staged_edges {
                self.shadow.mirror_edge(source, target, information)?;
            }
            self.shadow.run(iterations)?;

            for &(id, estimate, fixed, _) in &staged_vertices {
                if !self.solver.contains_vertex(id) {
                    self.solver.add_vertex(id, estimate, fixed)?;
                }
            }
            for &(source, target, measurement, information) in &staged_edges {
                self.solver.add_edge(source, target, measurement, information)?;
            }

            let result = if !self.initialized {
                self.solver.initialize_optimization()?;
                let result = self.solver.optimize(iterations, false)?;
                self.initialized = true;
                result
            } else {
                let vertex_set: Vec<VertexId> =
                    staged_vertices.iter().map(|&(id, ..)| id).collect();
                let edge_set: Vec<(VertexId, VertexId)> = staged_edges
                    .iter()
                    .map(|&(source, target, ..)| (source, target))
                    .collect();
                self.solver.update_initialization(&vertex_set, &edge_set)?;
                self.solver.optimize(iterations, online)?
            };

            self.sync_estimates();

            if self.vertex_grid.is_some() {
                for &(id, ..) in &staged_vertices {
                    let Some(vertex) = self.graph.vertex(id) else {
                        continue;
                    };
                    if !vertex.has_cloud() {
                        continue;
                    }
                    let translation = vertex.estimate().translation.vector;
                    if let Some(grid) = &mut self.vertex_grid {
                        grid.add_vertex(id, translation.x, translation.y);
                    }
                }
                let evicted = self
                    .vertex_grid
                    .as_mut()
                    .map(VertexGrid::reap)
                    .unwrap_or_default();
                for id in evicted {
                    debug!(vertex = %id, "vertex grid evicts point cloud");
                    self.remove_cloud_from_vertex(id)?;
                }
            }

            self.pending_vertices.clear();
            self.pending_edges.clear();
            result
        } else {
            let result = if !self.initialized {
                self.solver.initialize_optimization()?;
                let result = self.solver.optimize(iterations, false)?;
                self.initialized = true;
                result
            } else {
                self.solver.optimize(iterations, online)?
            };
            self.sync_estimates();
            result
        };

        self.map_update_necessary = true;
        Ok(result)
    }

    /// Run delayed registration edges before they are committed. A
    /// failure here keeps the provisional odometry measurement and marks
    /// the edge invalid.
    fn resolve_delayed_measurements(&mut self) {
        let delayed: Vec<EdgeKey> = self
            .pending_edges
            .iter()
            .copied()
            .filter(|&key| {
                self.graph
                    .edge_between(key.lower(), key.upper())
                    .is_some_and(RelativePoseEdge::needs_measurement)
            })
            .collect();

        for key in delayed {
            let Some(edge) = self.graph.edge_between(key.lower(), key.upper()) else {
                continue;
            };
            let (source, target, guess) = (edge.source, edge.target, edge.measurement);
            let config = edge
                .gicp_config()
                .cloned()
                .unwrap_or_else(|| self.gicp_config.clone());

            let source_cloud = self
                .graph
                .vertex(source)
                .and_then(|v| v.cloud())
                .and_then(|c| self.environment.cloud(c));
            let target_cloud = self
                .graph
                .vertex(target)
                .and_then(|v| v.cloud())
                .and_then(|c| self.environment.cloud(c));

            let measurement = match (source_cloud, target_cloud) {
                (Some(source_cloud), Some(target_cloud)) => self
                    .aligner
                    .align(source_cloud, target_cloud, &guess, &config)
                    .map_err(|err| {
                        warn!(%source, %target, %err, "delayed registration failed");
                    })
                    .ok(),
                _ => {
                    warn!(%source, %target, "delayed registration without clouds");
                    None
                }
            };

            let Some(edge) = self.graph.edge_between_mut(key.lower(), key.upper()) else {
                continue;
            };
            match measurement {
                Some(measurement) => edge.apply_measurement(&measurement),
                None => edge.mark_measurement_failed(),
            }
        }
    }

    /// Copy the solver's estimates back into the graph model.
    fn sync_estimates(&mut self) {
        let ids: Vec<VertexId> = self.graph.vertex_ids().collect();
        for id in ids {
            let Some(estimate) = self.solver.estimate(id) else {
                continue;
            };
            if let Some(vertex) = self.graph.vertex_mut(id) {
                vertex.set_estimate(estimate);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Environment bridge
    // ─────────────────────────────────────────────────────────────────────

    /// Mirror the optimized estimates into the scene graph and
    /// re-project the MLS grid. No-op unless a map update is pending.
    pub fn refresh_environment(&mut self) -> Result<()> {
        if !self.map_update_necessary {
            return Ok(());
        }

        let ids: Vec<VertexId> = self
            .graph
            .vertices()
            .filter(|v| v.has_cloud())
            .map(|v| v.id)
            .collect();

        let marginals = match self.shadow.marginals(&ids) {
            Ok(marginals) => marginals,
            Err(err) => {
                warn!(%err, "no marginals for environment refresh");
                Default::default()
            }
        };

        for id in ids {
            let Some(estimate) = self.graph.vertex(id).map(|v| *v.estimate()) else {
                continue;
            };
            let covariance = marginals.get(&id).map(switch_convention);
            self.environment.set_frame_state(id, estimate, covariance);
        }

        self.environment.reproject_mls();
        self.map_update_necessary = false;
        Ok(())
    }

    /// Re-reference a raw odometry pose onto the optimized trajectory:
    /// `last_estimate ∘ odometry_last⁻¹ ∘ raw`. `None` before the first
    /// vertex.
    pub fn adjust_odometry_pose(&self, raw: &Pose) -> Option<Pose> {
        let last = self.last_vertex?;
        let estimate = self.graph.vertex(last)?.estimate();
        Some(estimate * self.odometry_pose_last.inverse() * raw)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reset & introspection
    // ─────────────────────────────────────────────────────────────────────

    /// Reset all state and release the environment and vertex grid. The
    /// next [`add_vertex`] begins a new trajectory.
    ///
    /// [`add_vertex`]: SlamBackend::add_vertex
    pub fn clear(&mut self) {
        self.graph.clear();
        self.solver.clear();
        self.shadow.clear();
        self.environment.clear();
        self.vertex_grid = None;
        self.pending_vertices.clear();
        self.pending_edges.clear();
        self.next_id = 0;
        self.initialized = false;
        self.last_vertex = None;
        self.odometry_pose_last = Pose::identity();
        self.odometry_covariance_last = Matrix6::identity();
        self.map_update_necessary = false;
        self.new_candidates = false;
    }

    /// The graph model.
    pub fn graph(&self) -> &PoseGraph {
        &self.graph
    }

    /// The environment.
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Id of the most recently added vertex.
    pub fn last_vertex(&self) -> Option<VertexId> {
        self.last_vertex
    }

    /// Id the next vertex will receive.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Whether candidate discovery found untested candidates.
    pub fn has_new_candidates(&self) -> bool {
        self.new_candidates
    }

    /// Whether the environment is out of date.
    pub fn map_update_necessary(&self) -> bool {
        self.map_update_necessary
    }

    /// Number of staged vertices.
    pub fn num_pending_vertices(&self) -> usize {
        self.pending_vertices.len()
    }

    /// Number of staged edges.
    pub fn num_pending_edges(&self) -> usize {
        self.pending_edges.len()
    }
}

impl Default for SlamBackend {
    fn default() -> Self {
        Self::new()
    }
}
