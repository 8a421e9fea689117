//! Pose vertices and their loop-closure candidate bookkeeping.
//!
//! A vertex is a 6-DoF pose to be estimated. It may reference a point
//! cloud owned by the environment and tracks, per potential loop-closure
//! target, an [`EdgeCandidate`] whose accumulated error drives the
//! best-first candidate realization.

use std::collections::{BTreeMap, BTreeSet};

use crate::environment::CloudId;
use crate::geometry::Pose;

use super::types::VertexId;

/// A not-yet-realized loop-closure edge towards some target vertex.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeCandidate {
    /// Gating distance at discovery time (`min` of Mahalanobis and
    /// Euclidean displacement).
    pub mahalanobis_distance: f64,

    /// Priority contribution of this candidate. Nearer candidates carry
    /// a larger error.
    pub error: f64,

    /// Set when a registration attempt produced an invalid measurement.
    /// Stale candidates are kept but no longer contribute to the
    /// missing-edges error.
    pub stale: bool,
}

impl EdgeCandidate {
    fn new(distance: f64) -> Self {
        Self {
            mahalanobis_distance: distance,
            error: 1.0 / (1.0 + distance),
            stale: false,
        }
    }
}

/// Bookkeeping for the candidate search over this vertex.
#[derive(Debug, Clone)]
pub struct EdgeSearchState {
    /// Whether a candidate search has been run for this vertex.
    pub has_run: bool,

    /// Estimate at the time of the last search.
    pub last_search_pose: Pose,
}

impl Default for EdgeSearchState {
    fn default() -> Self {
        Self {
            has_run: false,
            last_search_pose: Pose::identity(),
        }
    }
}

/// A node of the pose graph.
#[derive(Debug, Clone)]
pub struct PoseVertex {
    /// Unique identifier.
    pub id: VertexId,

    /// Current 6-DoF estimate.
    estimate: Pose,

    /// Fixed vertices anchor the gauge and are not optimized.
    fixed: bool,

    /// Handle of the attached point cloud, if any. The cloud itself is
    /// owned by the environment.
    cloud: Option<CloudId>,

    /// Subsampling density the cloud was attached with.
    cloud_density: f64,

    /// Candidate search state.
    edge_search: EdgeSearchState,

    /// Loop-closure candidates keyed by target vertex id.
    candidates: BTreeMap<VertexId, EdgeCandidate>,

    /// Ids of vertices this vertex shares an edge with.
    neighbors: BTreeSet<VertexId>,
}

impl PoseVertex {
    /// Create a new vertex with an identity estimate.
    pub fn new(id: VertexId) -> Self {
        Self {
            id,
            estimate: Pose::identity(),
            fixed: false,
            cloud: None,
            cloud_density: 1.0,
            edge_search: EdgeSearchState::default(),
            candidates: BTreeMap::new(),
            neighbors: BTreeSet::new(),
        }
    }

    /// Current estimate.
    pub fn estimate(&self) -> &Pose {
        &self.estimate
    }

    /// Overwrite the estimate.
    pub fn set_estimate(&mut self, pose: Pose) {
        self.estimate = pose;
    }

    /// Whether this vertex is fixed (gauge anchor).
    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    /// Fix or release the vertex.
    pub fn set_fixed(&mut self, fixed: bool) {
        self.fixed = fixed;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Point cloud attachment
    // ─────────────────────────────────────────────────────────────────────

    /// Attach a point cloud handle with the density it was filtered at.
    pub fn attach_cloud(&mut self, cloud: CloudId, density: f64) {
        self.cloud = Some(cloud);
        self.cloud_density = density;
    }

    /// Detach the point cloud, returning its handle. The vertex remains
    /// in the graph for pose continuity.
    pub fn detach_cloud(&mut self) -> Option<CloudId> {
        self.cloud.take()
    }

    /// Whether a point cloud is attached.
    pub fn has_cloud(&self) -> bool {
        self.cloud.is_some()
    }

    /// Handle of the attached cloud, if any.
    pub fn cloud(&self) -> Option<CloudId> {
        self.cloud
    }

    /// Density the attached cloud was filtered at.
    pub fn cloud_density(&self) -> f64 {
        self.cloud_density
    }

    // ─────────────────────────────────────────────────────────────────────
    // Edge adjacency
    // ─────────────────────────────────────────────────────────────────────

    /// Ids of vertices connected to this one by an edge.
    pub fn edges(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.neighbors.iter().copied()
    }

    /// Whether an edge towards `other` exists.
    pub fn has_edge_to(&self, other: VertexId) -> bool {
        self.neighbors.contains(&other)
    }

    pub(crate) fn insert_neighbor(&mut self, other: VertexId) {
        self.neighbors.insert(other);
    }

    pub(crate) fn remove_neighbor(&mut self, other: VertexId) {
        self.neighbors.remove(&other);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Loop-closure candidates
    // ─────────────────────────────────────────────────────────────────────

    /// Record a candidate towards `target` with the given gating distance.
    /// An existing candidate for the same target is refreshed.
    pub fn add_candidate(&mut self, target: VertexId, distance: f64) {
        self.candidates.insert(target, EdgeCandidate::new(distance));
    }

    /// Update the stale flag of the candidate towards `target`.
    pub fn update_candidate(&mut self, target: VertexId, stale: bool) {
        if let Some(candidate) = self.candidates.get_mut(&target) {
            candidate.stale = stale;
        }
    }

    /// Remove the candidate towards `target`. Returns true if it existed.
    pub fn remove_candidate(&mut self, target: VertexId) -> bool {
        self.candidates.remove(&target).is_some()
    }

    /// Look up the candidate towards `target`.
    pub fn candidate(&self, target: VertexId) -> Option<&EdgeCandidate> {
        self.candidates.get(&target)
    }

    /// Number of stored candidates, stale ones included.
    pub fn num_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Best candidate: fresh before stale, higher error first, smaller
    /// target id on ties. The ordering is total, so selection is
    /// deterministic.
    pub fn best_candidate(&self) -> Option<(VertexId, EdgeCandidate)> {
        self.candidates
            .iter()
            .min_by(|(id_a, a), (id_b, b)| {
                a.stale
                    .cmp(&b.stale)
                    .then_with(|| b.error.partial_cmp(&a.error).unwrap_or(std::cmp::Ordering::Equal))
                    .then_with(|| id_a.cmp(id_b))
            })
            .map(|(id, candidate)| (*id, candidate.clone()))
    }

    /// Sum of candidate errors, skipping stale candidates. Drives the
    /// priority ordering of candidate realization.
    pub fn missing_edges_error(&self) -> f64 {
        self.candidates
            .values()
            .filter(|c| !c.stale)
            .map(|c| c.error)
            .sum()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Search state
    // ─────────────────────────────────────────────────────────────────────

    /// Current candidate search state.
    pub fn edge_search_state(&self) -> &EdgeSearchState {
        &self.edge_search
    }

    /// Record that a candidate search has (or has not) been run at the
    /// given pose.
    pub fn set_edge_search_state(&mut self, done: bool, pose: Pose) {
        self.edge_search.has_run = done;
        self.edge_search.last_search_pose = pose;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_priority_prefers_nearer() {
        let mut v = PoseVertex::new(VertexId::new(0));
        v.add_candidate(VertexId::new(5), 4.0);
        v.add_candidate(VertexId::new(3), 1.0);

        let (target, candidate) = v.best_candidate().unwrap();
        assert_eq!(target, VertexId::new(3));
        assert_eq!(candidate.mahalanobis_distance, 1.0);
    }

    #[test]
    fn test_candidate_tie_break_smaller_id() {
        let mut v = PoseVertex::new(VertexId::new(0));
        v.add_candidate(VertexId::new(9), 2.0);
        v.add_candidate(VertexId::new(4), 2.0);

        let (target, _) = v.best_candidate().unwrap();
        assert_eq!(target, VertexId::new(4));
    }

    #[test]
    fn test_stale_candidates_rank_last_and_sum_zero() {
        let mut v = PoseVertex::new(VertexId::new(0));
        v.add_candidate(VertexId::new(1), 0.5);
        v.add_candidate(VertexId::new(2), 3.0);
        v.update_candidate(VertexId::new(1), true);

        let (target, _) = v.best_candidate().unwrap();
        assert_eq!(target, VertexId::new(2));

        let expected = 1.0 / (1.0 + 3.0);
        assert!((v.missing_edges_error() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_missing_edges_error_empty() {
        let v = PoseVertex::new(VertexId::new(0));
        assert_eq!(v.missing_edges_error(), 0.0);
        assert!(v.best_candidate().is_none());
    }

    #[test]
    fn test_remove_candidate() {
        let mut v = PoseVertex::new(VertexId::new(0));
        v.add_candidate(VertexId::new(1), 1.0);

        assert!(v.remove_candidate(VertexId::new(1)));
        assert!(!v.remove_candidate(VertexId::new(1)));
        assert_eq!(v.num_candidates(), 0);
    }

    #[test]
    fn test_cloud_attachment() {
        let mut v = PoseVertex::new(VertexId::new(0));
        assert!(!v.has_cloud());

        v.attach_cloud(CloudId::new(7), 0.5);
        assert!(v.has_cloud());
        assert_eq!(v.cloud_density(), 0.5);

        assert_eq!(v.detach_cloud(), Some(CloudId::new(7)));
        assert!(!v.has_cloud());
    }
}
