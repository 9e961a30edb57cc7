//! Optimization seam.
//!
//! Bundle adjustment itself is provided by an external [`Optimizer`]. This
//! module runs it in three phases, all under the map-update lock:
//! 1. Collect the problem from the map
//! 2. Solve, polling a stop condition so a new keyframe can cancel the run
//! 3. Apply the result through the node mutators
//!
//! Applying through the mutators flags every touched node, so the changes are
//! picked up by [`MapChangeEvent::collect_modified`] and replicated.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::Vector3;
use tracing::{debug, info, warn};

use crate::map::{KeyFrameId, KeyPoint, Map, MapPointId, Pose};
use crate::protocol::MapChangeEvent;

/// Which part of the map to optimize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationScope {
    /// Every KeyFrame and MapPoint. Origins stay fixed.
    Global,

    /// A KeyFrame and its best covisible neighbors. KeyFrames outside the
    /// window that observe the window's points are included as fixed.
    Local {
        keyframe: KeyFrameId,
        neighbors: usize,
    },
}

/// A KeyFrame pose parameter.
#[derive(Debug, Clone)]
pub struct PoseParam {
    pub id: KeyFrameId,

    /// World-to-camera transform (T_cw).
    pub pose: Pose,

    /// Fixed poses are constraints only.
    pub fixed: bool,
}

/// A MapPoint position parameter.
#[derive(Debug, Clone)]
pub struct PointParam {
    pub id: MapPointId,
    pub position: Vector3<f64>,
}

/// A visual observation.
#[derive(Debug, Clone)]
pub struct OptimizationObservation {
    pub keyframe: KeyFrameId,
    pub map_point: MapPointId,

    /// Observed keypoint.
    pub keypoint: KeyPoint,

    /// Right-image coordinate for stereo observations.
    pub right: Option<f32>,
}

/// Data for one optimization run.
#[derive(Debug, Clone)]
pub struct OptimizationProblem {
    pub scope: OptimizationScope,
    pub keyframes: Vec<PoseParam>,
    pub map_points: Vec<PointParam>,
    pub observations: Vec<OptimizationObservation>,
}

/// Output of an optimizer.
#[derive(Debug, Clone, Default)]
pub struct OptimizationResult {
    /// Optimized poses (T_cw).
    pub poses: Vec<(KeyFrameId, Pose)>,

    /// Optimized map point positions.
    pub points: Vec<(MapPointId, Vector3<f64>)>,

    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,
}

/// Bundle adjustment backend.
pub trait Optimizer: Send {
    /// Solve `problem`. Implementations poll `should_stop` between
    /// iterations and return None when it fires.
    fn optimize(
        &mut self,
        problem: &OptimizationProblem,
        should_stop: &dyn Fn() -> bool,
    ) -> Option<OptimizationResult>;
}

/// Summary of an applied run.
#[derive(Debug, Clone)]
pub struct OptimizationReport {
    pub iterations: usize,
    pub initial_error: f64,
    pub final_error: f64,

    /// Number of poses and positions written back.
    pub updated: usize,

    /// Nodes changed by the run.
    pub changes: MapChangeEvent,
}

/// PHASE 1: Collect the problem for `scope`.
///
/// Returns None when there is nothing to optimize.
pub fn collect_problem(map: &Map, scope: OptimizationScope) -> Option<OptimizationProblem> {
    let origins: BTreeSet<KeyFrameId> = map.keyframe_origins().into_iter().collect();

    let window: Vec<KeyFrameId> = match scope {
        OptimizationScope::Global => map
            .all_keyframes()
            .iter()
            .filter(|kf| !kf.is_bad())
            .map(|kf| kf.id())
            .collect(),
        OptimizationScope::Local {
            keyframe,
            neighbors,
        } => {
            let center = map.keyframe(keyframe)?;
            if center.is_bad() {
                return None;
            }
            std::iter::once(keyframe)
                .chain(center.best_covisibles(neighbors))
                .filter(|id| map.keyframe(*id).is_some_and(|kf| !kf.is_bad()))
                .collect()
        }
    };

    if window.is_empty() {
        return None;
    }

    // Points observed by the window.
    let mut point_ids = BTreeSet::new();
    for kf_id in &window {
        if let Some(kf) = map.keyframe(*kf_id) {
            point_ids.extend(kf.map_point_indices().into_iter().map(|(_, id)| id));
        }
    }

    let window_set: BTreeSet<KeyFrameId> = window.iter().copied().collect();
    let mut poses: BTreeMap<KeyFrameId, PoseParam> = BTreeMap::new();
    for kf_id in &window {
        if let Some(kf) = map.keyframe(*kf_id) {
            poses.insert(
                *kf_id,
                PoseParam {
                    id: *kf_id,
                    pose: kf.pose(),
                    fixed: origins.contains(kf_id),
                },
            );
        }
    }

    let mut map_points = Vec::new();
    let mut observations = Vec::new();
    for mp_id in point_ids {
        let Some(mp) = map.map_point(mp_id) else {
            continue;
        };
        if mp.is_bad() {
            continue;
        }
        map_points.push(PointParam {
            id: mp_id,
            position: mp.world_pos(),
        });

        for (kf_id, idx) in mp.observations() {
            let Some(kf) = map.keyframe(kf_id) else {
                continue;
            };
            if kf.is_bad() {
                continue;
            }
            let Some(data) = kf.data() else {
                continue;
            };
            let Some(keypoint) = data.keypoints.get(idx).copied() else {
                continue;
            };
            if !window_set.contains(&kf_id) {
                poses.entry(kf_id).or_insert_with(|| PoseParam {
                    id: kf_id,
                    pose: kf.pose(),
                    fixed: true,
                });
            }
            observations.push(OptimizationObservation {
                keyframe: kf_id,
                map_point: mp_id,
                keypoint,
                right: data.is_stereo(idx).then(|| data.right[idx]),
            });
        }
    }

    // Anchor the gauge when no origin is in the problem.
    if !poses.values().any(|p| p.fixed) {
        if let Some(first) = poses.values_mut().next() {
            first.fixed = true;
        }
    }

    Some(OptimizationProblem {
        scope,
        keyframes: poses.into_values().collect(),
        map_points,
        observations,
    })
}

/// PHASE 3: Write the result back. Fixed and bad nodes are skipped.
///
/// A point whose normal cannot be refreshed keeps its new position and the
/// rest of the result is still applied.
pub fn apply_result(map: &Map, problem: &OptimizationProblem, result: &OptimizationResult) -> usize {
    let fixed: BTreeSet<KeyFrameId> = problem
        .keyframes
        .iter()
        .filter(|p| p.fixed)
        .map(|p| p.id)
        .collect();
    let mut updated = 0;

    for (kf_id, pose) in &result.poses {
        if fixed.contains(kf_id) {
            continue;
        }
        if let Some(kf) = map.keyframe(*kf_id) {
            if !kf.is_bad() {
                kf.set_pose(*pose);
                updated += 1;
            }
        }
    }

    for (mp_id, position) in &result.points {
        if let Some(mp) = map.map_point(*mp_id) {
            if !mp.is_bad() {
                mp.set_world_pos(*position);
                if let Err(e) = mp.update_normal_and_depth(map) {
                    warn!("{}: normal and depth not refreshed: {}", mp_id, e);
                }
                updated += 1;
            }
        }
    }

    updated
}

/// Run one optimization under the map-update lock.
///
/// `should_stop` is polled by the solver and once more before applying;
/// when it fires the run ends without touching the map. It is never reset
/// here, so a request raised before the lock was acquired still counts.
/// A global run raises the map's big-change index.
pub fn run_optimization(
    map: &Map,
    optimizer: &mut dyn Optimizer,
    scope: OptimizationScope,
    should_stop: &dyn Fn() -> bool,
) -> Option<OptimizationReport> {
    let _update = map.update_lock();

    // Phase 1: Collect
    let Some(problem) = collect_problem(map, scope) else {
        debug!(?scope, "Nothing to optimize");
        return None;
    };

    // Phase 2: Solve
    let Some(result) = optimizer.optimize(&problem, should_stop) else {
        info!(?scope, "Optimization stopped before completion");
        return None;
    };
    if should_stop() {
        info!(?scope, "Optimization stopped, discarding result");
        return None;
    }

    // Phase 3: Apply
    let updated = apply_result(map, &problem, &result);
    if scope == OptimizationScope::Global {
        map.inform_new_big_change();
    }
    let changes = MapChangeEvent::collect_modified(map);

    info!(
        "Optimization ({:?}) complete: {} iterations, error {:.4} -> {:.4}, {} updated",
        scope, result.iterations, result.initial_error, result.final_error, updated
    );

    Some(OptimizationReport {
        iterations: result.iterations,
        initial_error: result.initial_error,
        final_error: result.final_error,
        updated,
        changes,
    })
}
