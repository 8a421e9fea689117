//! Relative-pose edges.
//!
//! Both edge flavors share the same constraint contract: the transform
//! from source to target equals `measurement` with the given 6×6
//! information. Registration-backed edges carry extra state (config,
//! validity, fitness) as a discriminated extension instead of relying on
//! runtime downcasts.

use crate::geometry::{Matrix6, Pose};
use crate::registration::{GicpConfig, GicpMeasurement};

use super::types::VertexId;

/// Unordered vertex pair identifying an edge.
///
/// Normalized to `(min, max)` so that the one-edge-per-pair invariant
/// holds structurally when edges are stored in a map keyed by this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeKey {
    lower: VertexId,
    upper: VertexId,
}

impl EdgeKey {
    /// Build the key for an edge between `a` and `b` in either order.
    pub fn new(a: VertexId, b: VertexId) -> Self {
        if a <= b {
            Self { lower: a, upper: b }
        } else {
            Self { lower: b, upper: a }
        }
    }

    /// Smaller endpoint id.
    pub fn lower(&self) -> VertexId {
        self.lower
    }

    /// Larger endpoint id.
    pub fn upper(&self) -> VertexId {
        self.upper
    }

    /// Whether `id` is one of the endpoints.
    pub fn involves(&self, id: VertexId) -> bool {
        self.lower == id || self.upper == id
    }
}

/// Extension state of a registration-backed edge.
#[derive(Debug, Clone)]
pub struct GicpEdge {
    /// Registration parameters used for (re-)measurement.
    pub config: GicpConfig,

    /// Whether the last registration produced a usable measurement.
    pub valid: bool,

    /// Fitness score of the last registration, if one ran.
    pub fitness_score: Option<f64>,

    /// Sequential edges link consecutive odometry vertices; everything
    /// else is a loop closure.
    pub sequential: bool,

    /// False while the edge still carries its provisional odometry
    /// measurement (delayed mode).
    pub measured: bool,
}

/// Discriminates the edge flavors.
#[derive(Debug, Clone)]
pub enum EdgeKind {
    /// Pure odometry constraint.
    Odometry,

    /// Constraint measured (or to be measured) by point-cloud
    /// registration.
    Gicp(GicpEdge),
}

/// A binary relative-pose constraint between two vertices.
#[derive(Debug, Clone)]
pub struct RelativePoseEdge {
    /// Source vertex id.
    pub source: VertexId,

    /// Target vertex id.
    pub target: VertexId,

    /// Measured transform from source to target.
    pub measurement: Pose,

    /// 6×6 information matrix (inverse covariance) of the measurement.
    pub information: Matrix6,

    /// Flavor-specific extension.
    pub kind: EdgeKind,
}

impl RelativePoseEdge {
    /// Create an odometry edge.
    pub fn new_odometry(
        source: VertexId,
        target: VertexId,
        measurement: Pose,
        information: Matrix6,
    ) -> Self {
        Self {
            source,
            target,
            measurement,
            information,
            kind: EdgeKind::Odometry,
        }
    }

    /// Create a registration edge carrying a provisional measurement
    /// (usually the odometry delta) until the alignment runs.
    pub fn new_gicp(
        source: VertexId,
        target: VertexId,
        provisional: Pose,
        information: Matrix6,
        config: GicpConfig,
        sequential: bool,
    ) -> Self {
        Self {
            source,
            target,
            measurement: provisional,
            information,
            kind: EdgeKind::Gicp(GicpEdge {
                config,
                valid: false,
                fitness_score: None,
                sequential,
                measured: false,
            }),
        }
    }

    /// Normalized key of this edge.
    pub fn key(&self) -> EdgeKey {
        EdgeKey::new(self.source, self.target)
    }

    /// Whether this is a registration-backed edge.
    pub fn is_gicp(&self) -> bool {
        matches!(self.kind, EdgeKind::Gicp(_))
    }

    /// Whether this edge links consecutive vertices.
    pub fn is_sequential(&self) -> bool {
        match &self.kind {
            EdgeKind::Odometry => true,
            EdgeKind::Gicp(g) => g.sequential,
        }
    }

    /// Whether the current measurement is trustworthy. Odometry edges
    /// always are; registration edges only after a valid alignment.
    pub fn is_valid_measurement(&self) -> bool {
        match &self.kind {
            EdgeKind::Odometry => true,
            EdgeKind::Gicp(g) => g.valid,
        }
    }

    /// Fitness score of the last alignment, if any.
    pub fn fitness_score(&self) -> Option<f64> {
        match &self.kind {
            EdgeKind::Odometry => None,
            EdgeKind::Gicp(g) => g.fitness_score,
        }
    }

    /// Whether a registration edge still awaits its first alignment.
    pub fn needs_measurement(&self) -> bool {
        match &self.kind {
            EdgeKind::Odometry => false,
            EdgeKind::Gicp(g) => !g.measured,
        }
    }

    /// Replace the registration parameters used by future alignments.
    /// No-op for odometry edges.
    pub fn set_gicp_config(&mut self, config: &GicpConfig) {
        if let EdgeKind::Gicp(g) = &mut self.kind {
            g.config = config.clone();
        }
    }

    /// Registration parameters of this edge, if it has any.
    pub fn gicp_config(&self) -> Option<&GicpConfig> {
        match &self.kind {
            EdgeKind::Odometry => None,
            EdgeKind::Gicp(g) => Some(&g.config),
        }
    }

    /// Record that the delayed alignment could not run at all. The
    /// provisional measurement stays in place, marked invalid.
    pub fn mark_measurement_failed(&mut self) {
        if let EdgeKind::Gicp(g) = &mut self.kind {
            g.measured = true;
            g.valid = false;
        }
    }

    /// Fold an alignment result into the edge. A valid measurement
    /// replaces the provisional transform and information; an invalid one
    /// only records the fitness and validity.
    pub fn apply_measurement(&mut self, result: &GicpMeasurement) {
        if let EdgeKind::Gicp(g) = &mut self.kind {
            g.measured = true;
            g.valid = result.valid;
            g.fitness_score = Some(result.fitness_score);
            if result.valid {
                self.measurement = result.transform;
                self.information = result.information;
            }
        }
    }
}
