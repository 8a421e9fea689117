//! Loop-closure candidate engine.
//!
//! Two phases: discovery proposes non-sequential vertex pairs gated by
//! the shadow graph's marginal covariances, realization works the
//! candidate backlog best-first through point-cloud registration.

use std::cmp::Ordering;

use nalgebra::Matrix3;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::geometry::{mahalanobis, Pose};
use crate::graph::{RelativePoseEdge, VertexId};
use crate::system::SlamBackend;

/// Estimate shift (meters) after which a vertex is searched again.
pub const RESEARCH_TRANSLATION_M: f64 = 0.1;

/// Estimate shift (radians) after which a vertex is searched again.
pub const RESEARCH_ROTATION_RAD: f64 = 0.1;

/// Whether an estimate has moved far enough from the recorded search
/// pose to warrant a fresh candidate search.
pub(crate) fn pose_shift_exceeds(last: &Pose, current: &Pose) -> bool {
    let translation = (current.translation.vector - last.translation.vector).norm();
    let rotation = current.rotation.angle_to(&last.rotation);
    translation > RESEARCH_TRANSLATION_M || rotation > RESEARCH_ROTATION_RAD
}

impl SlamBackend {
    /// Discover loop-closure candidates.
    ///
    /// Considers every active cloud-bearing vertex whose search has not
    /// run yet (or whose estimate has shifted since the last search),
    /// pairs it against every other such vertex at least two ids away
    /// and without an existing edge, and gates the pair on
    /// `min(mahalanobis, euclidean)` of the displacement under the
    /// summed marginal position covariances.
    pub fn find_edge_candidates(&mut self) -> Result<()> {
        let pool: Vec<(VertexId, Pose)> = self
            .graph
            .vertices()
            .filter(|v| v.has_cloud() && self.solver.contains_vertex(v.id))
            .map(|v| (v.id, *v.estimate()))
            .collect();
        let ids: Vec<VertexId> = pool.iter().map(|&(id, _)| id).collect();

        let marginals = self.shadow.marginals(&ids)?;
        let position_block = |id: VertexId| -> Matrix3<f64> {
            marginals
                .get(&id)
                .map(|m| m.fixed_view::<3, 3>(0, 0).into_owned())
                .unwrap_or_else(Matrix3::zeros)
        };

        for &(source, source_pose) in &pool {
            let needs_search = match self.graph.vertex(source) {
                Some(v) => {
                    let state = v.edge_search_state();
                    !state.has_run || pose_shift_exceeds(&state.last_search_pose, &source_pose)
                }
                None => false,
            };
            if !needs_search {
                continue;
            }

            for &(target, target_pose) in &pool {
                if source.0.abs_diff(target.0) < 2 {
                    continue;
                }
                if self.graph.has_edge_between(source, target) {
                    continue;
                }

                let position_cov = position_block(source) + position_block(target);
                let displacement =
                    source_pose.translation.vector - target_pose.translation.vector;
                let distance = mahalanobis(&displacement, &position_cov).min(displacement.norm());

                if distance <= self.gicp_config.max_sensor_distance {
                    if let Some(v) = self.graph.vertex_mut(source) {
                        v.add_candidate(target, distance);
                    }
                    if let Some(v) = self.graph.vertex_mut(target) {
                        v.add_candidate(source, distance);
                    }
                    self.new_candidates = true;
                }
            }

            if let Some(v) = self.graph.vertex_mut(source) {
                v.set_edge_search_state(true, source_pose);
            }
        }
        Ok(())
    }

    /// Realize up to `count` candidates, best first.
    ///
    /// Each round picks the vertex with the greatest missing-edges error
    /// and registers its best candidate. A valid alignment stages a new
    /// non-sequential edge and retires the candidate on both sides; an
    /// invalid one marks the candidate stale (a second invalid round
    /// removes it). Returns the number of edges staged.
    pub fn try_best_candidates(&mut self, count: usize) -> Result<usize> {
        let mut tested = 0;
        let mut added = 0;

        while tested < count {
            let best = self
                .graph
                .vertices()
                .map(|v| (v.id, v.missing_edges_error()))
                .max_by(|a, b| {
                    a.1.partial_cmp(&b.1)
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| b.0.cmp(&a.0))
                });
            let Some((source, error)) = best else {
                break;
            };
            if error <= 0.0 {
                self.new_candidates = false;
                break;
            }

            let Some((target, candidate)) =
                self.graph.vertex(source).and_then(|v| v.best_candidate())
            else {
                break;
            };

            let source_state = self
                .graph
                .vertex(source)
                .and_then(|v| v.cloud().map(|c| (*v.estimate(), c)));
            let target_state = self
                .graph
                .vertex(target)
                .and_then(|v| v.cloud().map(|c| (*v.estimate(), c)));
            let (Some((source_pose, source_cloud_id)), Some((target_pose, target_cloud_id))) =
                (source_state, target_state)
            else {
                // An endpoint vanished or lost its cloud: discard
                // without counting a test.
                self.discard_candidate(source, target);
                continue;
            };
            let (Some(source_cloud), Some(target_cloud)) = (
                self.environment.cloud(source_cloud_id),
                self.environment.cloud(target_cloud_id),
            ) else {
                self.discard_candidate(source, target);
                continue;
            };

            let guess = source_pose.inverse() * target_pose;
            let measurement =
                self.aligner
                    .align(source_cloud, target_cloud, &guess, &self.gicp_config)?;

            if measurement.valid {
                let mut edge = RelativePoseEdge::new_gicp(
                    source,
                    target,
                    guess,
                    self.gicp_config.information(),
                    self.gicp_config.clone(),
                    false,
                );
                edge.apply_measurement(&measurement);
                let key = edge.key();

                match self.graph.add_edge(edge) {
                    Ok(()) => {
                        self.pending_edges.insert(key);
                        if let Some(v) = self.graph.vertex_mut(source) {
                            v.remove_candidate(target);
                        }
                        if let Some(v) = self.graph.vertex_mut(target) {
                            v.remove_candidate(source);
                        }
                        added += 1;
                        debug!(%source, %target, "staged loop-closure edge");
                    }
                    Err(err @ Error::Invariant(_)) => return Err(err),
                    Err(err) => {
                        warn!(%source, %target, %err, "dropping unplaceable loop-closure edge");
                    }
                }
                tested += 1;
            } else {
                if candidate.stale {
                    // Re-evaluated and still invalid: judged stale for
                    // good.
                    if let Some(v) = self.graph.vertex_mut(source) {
                        v.remove_candidate(target);
                    }
                    if let Some(v) = self.graph.vertex_mut(target) {
                        v.remove_candidate(source);
                    }
                } else {
                    if let Some(v) = self.graph.vertex_mut(source) {
                        v.update_candidate(target, true);
                    }
                    if let Some(v) = self.graph.vertex_mut(target) {
                        v.update_candidate(source, true);
                    }
                }
                debug!(%source, %target, "registration invalid, candidate deprioritized");
                tested += 1;
            }
        }

        Ok(added)
    }

    /// Drop the candidate pair from both vertices.
    fn discard_candidate(&mut self, a: VertexId, b: VertexId) {
        if let Some(v) = self.graph.vertex_mut(a) {
            v.remove_candidate(b);
        }
        if let Some(v) = self.graph.vertex_mut(b) {
            v.remove_candidate(a);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Matrix6;
    use crate::registration::GicpConfig;
    use crate::solver::LmSolver;
    use crate::system::backend::tests::{stub_backend, test_cloud, FailingAligner, RejectingAligner};
    use nalgebra::{Translation3, UnitQuaternion, Vector3};

    /// Nine steps out along x, then a tenth vertex looping back next to
    /// the start.
    fn looped_trajectory(backend: &mut SlamBackend) {
        for i in 0..9 {
            backend
                .add_vertex(
                    Pose::translation(i as f64, 0.0, 0.0),
                    Matrix6::identity(),
                    test_cloud(),
                    false,
                )
                .unwrap();
        }
        backend
            .add_vertex(
                Pose::translation(0.5, 0.0, 0.0),
                Matrix6::identity(),
                test_cloud(),
                false,
            )
            .unwrap();
        backend.optimize(10, false).unwrap();
    }

    #[test]
    fn test_pose_shift_threshold() {
        let base = Pose::identity();
        assert!(!pose_shift_exceeds(&base, &Pose::translation(0.05, 0.0, 0.0)));
        assert!(pose_shift_exceeds(&base, &Pose::translation(0.2, 0.0, 0.0)));

        let rotated = Pose::from_parts(
            Translation3::identity(),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, 0.0, 0.2)),
        );
        assert!(pose_shift_exceeds(&base, &rotated));
    }

    #[test]
    fn test_discovery_proposes_loop_to_start() {
        let mut backend = stub_backend();
        looped_trajectory(&mut backend);

        backend.find_edge_candidates().unwrap();
        assert!(backend.has_new_candidates());

        let tail = backend.graph().vertex(VertexId::new(9)).unwrap();
        let candidate = tail
            .candidate(VertexId::new(0))
            .expect("tail should hold a candidate towards the start");
        assert!(candidate.mahalanobis_distance <= backend.gicp_config().max_sensor_distance);

        // Adjacent pairs and already-connected pairs never become
        // candidates.
        assert!(tail.candidate(VertexId::new(8)).is_none());
        assert!(tail.edge_search_state().has_run);

        // Symmetric bookkeeping on the start vertex.
        let start = backend.graph().vertex(VertexId::new(0)).unwrap();
        assert!(start.candidate(VertexId::new(9)).is_some());
    }

    #[test]
    fn test_discovery_skips_already_searched_vertices() {
        let mut backend = stub_backend();
        looped_trajectory(&mut backend);

        backend.find_edge_candidates().unwrap();
        let count_before = backend
            .graph()
            .vertex(VertexId::new(9))
            .unwrap()
            .num_candidates();

        backend.find_edge_candidates().unwrap();
        let count_after = backend
            .graph()
            .vertex(VertexId::new(9))
            .unwrap()
            .num_candidates();
        assert_eq!(count_before, count_after);
    }

    #[test]
    fn test_best_candidate_realization_stages_one_edge() {
        let mut backend = stub_backend();
        looped_trajectory(&mut backend);
        backend.find_edge_candidates().unwrap();

        let added = backend.try_best_candidates(1).unwrap();
        assert_eq!(added, 1);

        let loops: Vec<&RelativePoseEdge> = backend
            .graph()
            .edges()
            .filter(|e| !e.is_sequential())
            .collect();
        assert_eq!(loops.len(), 1);
        let edge = loops[0];
        assert!(edge.is_gicp());
        assert!(edge.is_valid_measurement());
        assert!(edge.source.0.abs_diff(edge.target.0) >= 2);

        // The pair's candidates are gone from both sides.
        let (source, target) = (edge.source, edge.target);
        assert!(backend
            .graph()
            .vertex(source)
            .unwrap()
            .candidate(target)
            .is_none());
        assert!(backend
            .graph()
            .vertex(target)
            .unwrap()
            .candidate(source)
            .is_none());

        // The staged edge folds into the estimator.
        assert_eq!(backend.num_pending_edges(), 1);
        backend.optimize(10, false).unwrap();
        assert_eq!(backend.num_pending_edges(), 0);
        assert_eq!(backend.solver.num_edges(), 10);
        assert_eq!(backend.shadow.num_edges(), 10);
    }

    #[test]
    fn test_invalid_registration_marks_candidates_stale() {
        let mut backend =
            SlamBackend::with_parts(Box::new(LmSolver::new()), Box::new(RejectingAligner));
        looped_trajectory(&mut backend);
        backend.find_edge_candidates().unwrap();

        let added = backend.try_best_candidates(1).unwrap();
        assert_eq!(added, 0);
        assert_eq!(backend.graph().edges().filter(|e| !e.is_sequential()).count(), 0);

        let stale_count: usize = backend
            .graph()
            .vertices()
            .map(|v| {
                (0..backend.next_id())
                    .filter(|&t| {
                        v.candidate(VertexId::new(t)).map_or(false, |c| c.stale)
                    })
                    .count()
            })
            .sum();
        assert_eq!(stale_count, 2);
    }

    #[test]
    fn test_realization_failure_propagates() {
        let mut backend =
            SlamBackend::with_parts(Box::new(LmSolver::new()), Box::new(FailingAligner));
        // Delayed mode keeps the failing aligner out of add_vertex.
        for i in 0..5 {
            backend
                .add_vertex(
                    Pose::translation(i as f64 * 0.2, 0.0, 0.0),
                    Matrix6::identity(),
                    test_cloud(),
                    true,
                )
                .unwrap();
        }
        backend.optimize(5, false).unwrap();
        backend.find_edge_candidates().unwrap();
        assert!(backend.has_new_candidates());

        let result = backend.try_best_candidates(1);
        assert!(matches!(result, Err(Error::Gicp(_))));
    }

    #[test]
    fn test_candidate_without_cloud_is_discarded() {
        let mut backend = stub_backend();
        looped_trajectory(&mut backend);
        backend.find_edge_candidates().unwrap();

        // Strip every cloud; realization must drain the backlog without
        // testing anything.
        let ids: Vec<VertexId> = backend.graph().vertex_ids().collect();
        for id in ids {
            backend.remove_cloud_from_vertex(id).unwrap();
        }

        let added = backend.try_best_candidates(3).unwrap();
        assert_eq!(added, 0);
        let remaining: usize = backend
            .graph()
            .vertices()
            .map(|v| v.num_candidates())
            .sum();
        assert_eq!(remaining, 0);
        assert!(!backend.has_new_candidates());
    }

    #[test]
    fn test_max_sensor_distance_gates_candidates() {
        let mut backend = stub_backend();
        backend.set_gicp_config(GicpConfig {
            max_sensor_distance: 1.0,
            ..GicpConfig::default()
        });
        // Well-spread vertices with tight covariances: only the loop
        // pair is close enough.
        for i in 0..5 {
            backend
                .add_vertex(
                    Pose::translation(i as f64 * 10.0, 0.0, 0.0),
                    Matrix6::identity() * 1e-4,
                    test_cloud(),
                    false,
                )
                .unwrap();
        }
        backend
            .add_vertex(
                Pose::translation(0.2, 0.0, 0.0),
                Matrix6::identity() * 1e-4,
                test_cloud(),
                false,
            )
            .unwrap();
        backend.optimize(10, false).unwrap();

        backend.find_edge_candidates().unwrap();

        let tail = backend.graph().vertex(VertexId::new(5)).unwrap();
        assert!(tail.candidate(VertexId::new(0)).is_some());
        assert!(tail.candidate(VertexId::new(2)).is_none());
    }
}
