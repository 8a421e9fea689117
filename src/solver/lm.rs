//! Built-in damped Gauss-Newton solver over SE(3) chart parameters.
//!
//! Vertices are parameterized by their 6-vector chart (translation +
//! rotation vector); edge residuals are the chart coordinates of
//! `measurement⁻¹ ∘ (source⁻¹ ∘ target)`. Jacobians are numeric (central
//! differences) and the normal equations are accumulated per edge with
//! the full 6×6 information matrix, then solved with Levenberg damping.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::pose::{chart_to_pose, pose_to_chart, relative_pose_error};
use crate::geometry::{Matrix6, Pose, Vector6};
use crate::graph::{EdgeKey, VertexId};

use super::{MarginalCovariances, SparseSolver};

/// Levenberg-Marquardt parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmConfig {
    /// Convergence threshold on the parameter update norm.
    pub param_tolerance: f64,

    /// Convergence threshold on the gradient norm.
    pub gradient_tolerance: f64,

    /// Initial damping factor.
    pub initial_lambda: f64,

    /// Damping multiplier after a rejected step.
    pub lambda_up: f64,

    /// Damping multiplier after an accepted step.
    pub lambda_down: f64,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self {
            param_tolerance: 1e-8,
            gradient_tolerance: 1e-8,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
struct SolverVertex {
    estimate: Pose,
    fixed: bool,
    hessian_index: Option<usize>,
    active: bool,
}

#[derive(Debug, Clone)]
struct SolverEdge {
    source: VertexId,
    target: VertexId,
    measurement: Pose,
    information: Matrix6,
    active: bool,
}

/// Built-in sparse solver.
#[derive(Debug)]
pub struct LmSolver {
    config: LmConfig,
    vertices: BTreeMap<VertexId, SolverVertex>,
    edges: BTreeMap<EdgeKey, SolverEdge>,
    next_hessian_index: usize,
    lambda: f64,
}

const JACOBIAN_EPS: f64 = 1e-6;
const MIN_LAMBDA: f64 = 1e-10;
const MAX_LAMBDA: f64 = 1e10;
const MARGINAL_DAMPING: f64 = 1e-9;

impl LmSolver {
    /// Create a solver with default parameters.
    pub fn new() -> Self {
        Self::with_config(LmConfig::default())
    }

    /// Create a solver with explicit parameters.
    pub fn with_config(config: LmConfig) -> Self {
        let lambda = config.initial_lambda;
        Self {
            config,
            vertices: BTreeMap::new(),
            edges: BTreeMap::new(),
            next_hessian_index: 0,
            lambda,
        }
    }

    fn vertex(&self, id: VertexId) -> Result<&SolverVertex> {
        self.vertices.get(&id).ok_or(Error::VertexNotFound(id))
    }

    fn vertex_mut(&mut self, id: VertexId) -> Result<&mut SolverVertex> {
        self.vertices.get_mut(&id).ok_or(Error::VertexNotFound(id))
    }

    /// Pose of a vertex under the given parameter vector: chart values
    /// for vertices in the Hessian, the stored estimate otherwise.
    fn pose_under(&self, id: VertexId, params: &DVector<f64>) -> Pose {
        let v = &self.vertices[&id];
        match v.hessian_index {
            Some(hi) => {
                let offset = hi * 6;
                let chart = Vector6::from_iterator((0..6).map(|i| params[offset + i]));
                chart_to_pose(&chart)
            }
            None => v.estimate,
        }
    }

    fn active_edges(&self) -> impl Iterator<Item = &SolverEdge> {
        self.edges.values().filter(|e| e.active)
    }

    /// Current parameter vector over all Hessian-indexed vertices.
    fn gather_params(&self) -> DVector<f64> {
        let n = self.next_hessian_index;
        let mut params = DVector::zeros(n * 6);
        for v in self.vertices.values() {
            if let Some(hi) = v.hessian_index {
                let chart = pose_to_chart(&v.estimate);
                for i in 0..6 {
                    params[hi * 6 + i] = chart[i];
                }
            }
        }
        params
    }

    fn scatter_params(&mut self, params: &DVector<f64>) {
        for v in self.vertices.values_mut() {
            if let Some(hi) = v.hessian_index {
                let offset = hi * 6;
                let chart = Vector6::from_iterator((0..6).map(|i| params[offset + i]));
                v.estimate = chart_to_pose(&chart);
            }
        }
    }

    /// Residual of an edge under the given parameters.
    fn edge_error(&self, edge: &SolverEdge, params: &DVector<f64>) -> Vector6 {
        let source = self.pose_under(edge.source, params);
        let target = self.pose_under(edge.target, params);
        relative_pose_error(&source, &target, &edge.measurement)
    }

    /// Numeric 6×6 Jacobian of an edge's residual with respect to one
    /// endpoint's chart parameters.
    fn edge_jacobian(
        &self,
        edge: &SolverEdge,
        params: &DVector<f64>,
        hessian_index: usize,
    ) -> Matrix6 {
        let offset = hessian_index * 6;
        let mut jacobian = Matrix6::zeros();
        let mut probe = params.clone();
        for p in 0..6 {
            let saved = probe[offset + p];
            probe[offset + p] = saved + JACOBIAN_EPS;
            let plus = self.edge_error(edge, &probe);
            probe[offset + p] = saved - JACOBIAN_EPS;
            let minus = self.edge_error(edge, &probe);
            probe[offset + p] = saved;

            let column = (plus - minus) / (2.0 * JACOBIAN_EPS);
            jacobian.set_column(p, &column);
        }
        jacobian
    }

    /// Total weighted squared error over the active edges.
    fn chi2(&self, params: &DVector<f64>) -> f64 {
        self.active_edges()
            .map(|edge| {
                let err = self.edge_error(edge, params);
                (err.transpose() * edge.information * err)[(0, 0)]
            })
            .sum()
    }

    /// Accumulate the Gauss-Newton normal equations `H δ = -b`.
    fn build_normal_equations(&self, params: &DVector<f64>) -> (DMatrix<f64>, DVector<f64>) {
        let n = self.next_hessian_index * 6;
        let mut hessian = DMatrix::zeros(n, n);
        let mut gradient = DVector::zeros(n);

        for edge in self.active_edges() {
            let err = self.edge_error(edge, params);
            let info = edge.information;

            let source_hi = self.vertices[&edge.source].hessian_index;
            let target_hi = self.vertices[&edge.target].hessian_index;

            let jac_source = source_hi.map(|hi| self.edge_jacobian(edge, params, hi));
            let jac_target = target_hi.map(|hi| self.edge_jacobian(edge, params, hi));

            if let (Some(hi), Some(jac)) = (source_hi, &jac_source) {
                let jt_info = jac.transpose() * info;
                add_block(&mut hessian, hi, hi, &(jt_info * jac));
                add_gradient(&mut gradient, hi, &(jt_info * err));
            }
            if let (Some(hi), Some(jac)) = (target_hi, &jac_target) {
                let jt_info = jac.transpose() * info;
                add_block(&mut hessian, hi, hi, &(jt_info * jac));
                add_gradient(&mut gradient, hi, &(jt_info * err));
            }
            if let (Some(si), Some(ti), Some(js), Some(jt)) =
                (source_hi, target_hi, &jac_source, &jac_target)
            {
                let cross = js.transpose() * info * jt;
                add_block(&mut hessian, si, ti, &cross);
                add_block(&mut hessian, ti, si, &cross.transpose());
            }
        }

        (hessian, gradient)
    }
}

fn add_block(hessian: &mut DMatrix<f64>, row: usize, col: usize, block: &Matrix6) {
    let mut view = hessian.view_mut((row * 6, col * 6), (6, 6));
    view += block;
}

fn add_gradient(gradient: &mut DVector<f64>, index: usize, block: &Vector6) {
    let mut view = gradient.rows_mut(index * 6, 6);
    view += block;
}

impl Default for LmSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseSolver for LmSolver {
    fn add_vertex(&mut self, id: VertexId, estimate: Pose, fixed: bool) -> Result<()> {
        if self.vertices.contains_key(&id) {
            return Err(Error::Graph(format!("solver already holds vertex {id}")));
        }
        self.vertices.insert(
            id,
            SolverVertex {
                estimate,
                fixed,
                hessian_index: None,
                active: false,
            },
        );
        Ok(())
    }

    fn add_edge(
        &mut self,
        source: VertexId,
        target: VertexId,
        measurement: Pose,
        information: Matrix6,
    ) -> Result<()> {
        self.vertex(source)?;
        self.vertex(target)?;
        let key = EdgeKey::new(source, target);
        if self.edges.contains_key(&key) {
            return Err(Error::Graph(format!(
                "solver already holds an edge between {source} and {target}"
            )));
        }
        self.edges.insert(
            key,
            SolverEdge {
                source,
                target,
                measurement,
                information,
                active: false,
            },
        );
        Ok(())
    }

    fn remove_vertex(&mut self, id: VertexId) -> Result<()> {
        if self.vertices.remove(&id).is_none() {
            return Err(Error::VertexNotFound(id));
        }
        self.edges.retain(|key, _| !key.involves(id));
        Ok(())
    }

    fn remove_edge(&mut self, source: VertexId, target: VertexId) -> Result<()> {
        let key = EdgeKey::new(source, target);
        if self.edges.remove(&key).is_none() {
            return Err(Error::Graph(format!(
                "no solver edge between {source} and {target}"
            )));
        }
        Ok(())
    }

    fn set_fixed(&mut self, id: VertexId, fixed: bool) -> Result<()> {
        self.vertex_mut(id)?.fixed = fixed;
        Ok(())
    }

    fn estimate(&self, id: VertexId) -> Option<Pose> {
        self.vertices.get(&id).map(|v| v.estimate)
    }

    fn hessian_index(&self, id: VertexId) -> Option<usize> {
        self.vertices.get(&id).and_then(|v| v.hessian_index)
    }

    fn initialize_optimization(&mut self) -> Result<()> {
        self.next_hessian_index = 0;
        for v in self.vertices.values_mut() {
            v.active = true;
            v.hessian_index = if v.fixed {
                None
            } else {
                let hi = self.next_hessian_index;
                self.next_hessian_index += 1;
                Some(hi)
            };
        }
        for e in self.edges.values_mut() {
            e.active = true;
        }
        self.lambda = self.config.initial_lambda;
        Ok(())
    }

    fn update_initialization(
        &mut self,
        vertices: &[VertexId],
        edges: &[(VertexId, VertexId)],
    ) -> Result<usize> {
        let mut activated = 0;
        for &id in vertices {
            let next_index = self.next_hessian_index;
            let v = self.vertex_mut(id)?;
            if !v.active {
                v.active = true;
                activated += 1;
                if !v.fixed {
                    v.hessian_index = Some(next_index);
                    self.next_hessian_index += 1;
                }
            }
        }
        for &(source, target) in edges {
            let key = EdgeKey::new(source, target);
            let edge = self.edges.get_mut(&key).ok_or_else(|| {
                Error::Solver(format!("unknown edge between {source} and {target}"))
            })?;
            if !self.vertices[&edge.source].active || !self.vertices[&edge.target].active {
                return Err(Error::Solver(format!(
                    "edge between {source} and {target} references an inactive vertex"
                )));
            }
            edge.active = true;
        }
        Ok(activated)
    }

    fn optimize(&mut self, iterations: usize, online: bool) -> Result<usize> {
        if self.next_hessian_index == 0 {
            return Ok(0);
        }
        if !online {
            self.lambda = self.config.initial_lambda;
        }

        let mut params = self.gather_params();
        let mut performed = 0;

        for _ in 0..iterations {
            performed += 1;

            let (hessian, gradient) = self.build_normal_equations(&params);
            if gradient.norm() < self.config.gradient_tolerance {
                break;
            }

            let mut damped = hessian.clone();
            for i in 0..damped.nrows() {
                damped[(i, i)] += self.lambda * damped[(i, i)].abs().max(1e-6);
            }

            let delta = match damped.lu().solve(&(-&gradient)) {
                Some(d) => d,
                None => break,
            };

            if delta.norm() < self.config.param_tolerance * (params.norm() + self.config.param_tolerance)
            {
                break;
            }

            let trial = &params + &delta;
            if self.chi2(&trial) < self.chi2(&params) {
                params = trial;
                self.lambda = (self.lambda * self.config.lambda_down).max(MIN_LAMBDA);
            } else {
                self.lambda = (self.lambda * self.config.lambda_up).min(MAX_LAMBDA);
            }
        }

        self.scatter_params(&params);
        Ok(performed)
    }

    fn compute_marginals(&self, vertex_set: &[VertexId]) -> Result<MarginalCovariances> {
        let mut marginals = MarginalCovariances::new();
        if self.next_hessian_index == 0 {
            return Ok(marginals);
        }

        let params = self.gather_params();
        let (mut hessian, _) = self.build_normal_equations(&params);

        // A vertex that lost all of its constraints would make the
        // Hessian singular; the damping bounds its marginal instead.
        for i in 0..hessian.nrows() {
            hessian[(i, i)] += MARGINAL_DAMPING;
        }

        let covariance = hessian
            .try_inverse()
            .ok_or_else(|| Error::Solver("Hessian is singular, no marginals".into()))?;

        for &id in vertex_set {
            let Some(hi) = self.hessian_index(id) else {
                continue;
            };
            let block = Matrix6::from_fn(|r, c| covariance[(hi * 6 + r, hi * 6 + c)]);
            marginals.insert(hi, block);
        }
        Ok(marginals)
    }

    fn contains_vertex(&self, id: VertexId) -> bool {
        self.vertices.contains_key(&id)
    }

    fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    fn num_edges(&self) -> usize {
        self.edges.len()
    }

    fn clear(&mut self) {
        self.vertices.clear();
        self.edges.clear();
        self.next_hessian_index = 0;
        self.lambda = self.config.initial_lambda;
    }
}
