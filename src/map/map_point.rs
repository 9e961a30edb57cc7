//! MapPoint - A 3D landmark observed by KeyFrames.
//!
//! MapPoints are the fundamental 3D structure elements in the map.
//! Each MapPoint tracks which KeyFrames observe it, maintains quality
//! metrics for culling decisions, and stores viewing geometry constraints.
//!
//! State is split across two locks, always taken position before features.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::Vector3;
use parking_lot::Mutex;

use crate::protocol::{MapPointRecord, ProtocolError};

use super::error::MapError;
use super::keyframe::KeyFrame;
use super::map::Map;
use super::types::{Descriptor, KeyFrameId, MapPointId, ScalePyramid};

/// Observation count at or below which an unlinked point turns bad.
pub const MIN_OBSERVATIONS: usize = 2;

/// Viewing geometry, guarded by the position lock.
#[derive(Debug, Clone)]
struct Position {
    world_pos: Vector3<f64>,

    /// Mean viewing direction (unit vector, world frame).
    normal: Vector3<f64>,

    /// Scale invariance limits derived from the ORB pyramid.
    min_distance: f64,
    max_distance: f64,
}

/// Observation state, guarded by the features lock.
#[derive(Debug, Clone)]
struct Features {
    /// observations[kf_id] = feature index of this point in that KeyFrame.
    observations: BTreeMap<KeyFrameId, usize>,

    /// Observation count; stereo features count twice.
    n_obs: usize,

    reference_kf: Option<KeyFrameId>,

    /// KeyFrame that created this MapPoint.
    first_kf: Option<KeyFrameId>,

    /// Number of times this point was in a tracked frame's frustum.
    visible: u32,

    /// Number of times this point was successfully matched.
    found: u32,

    is_bad: bool,

    /// Point that superseded this one.
    replaced: Option<MapPointId>,

    /// Representative ORB descriptor.
    descriptor: Descriptor,
}

/// A 3D map point (landmark) observed by one or more KeyFrames.
pub struct MapPoint {
    id: MapPointId,
    position: Mutex<Position>,
    features: Mutex<Features>,
    modified: AtomicBool,

    /// Stand-in created for a replacement target not yet received.
    placeholder: AtomicBool,
}

impl MapPoint {
    /// Create a new MapPoint.
    ///
    /// # Arguments
    /// * `id` - Identifier from the creating tracker's (or local mapper's) lease
    /// * `position` - 3D position in world frame
    /// * `first_kf` - KeyFrame that created this point
    pub fn new(id: MapPointId, position: Vector3<f64>, first_kf: KeyFrameId) -> Self {
        Self::with_state(id, position, Some(first_kf), false)
    }

    /// Create an id-only stand-in whose state arrives later.
    pub fn placeholder(id: MapPointId) -> Self {
        Self::with_state(id, Vector3::zeros(), None, true)
    }

    fn with_state(
        id: MapPointId,
        world_pos: Vector3<f64>,
        first_kf: Option<KeyFrameId>,
        placeholder: bool,
    ) -> Self {
        Self {
            id,
            position: Mutex::new(Position {
                world_pos,
                normal: Vector3::zeros(),
                min_distance: 0.0,
                max_distance: 0.0,
            }),
            features: Mutex::new(Features {
                observations: BTreeMap::new(),
                n_obs: 0,
                reference_kf: None,
                first_kf,
                visible: 1,
                found: 1,
                is_bad: false,
                replaced: None,
                descriptor: Descriptor::zeros(),
            }),
            modified: AtomicBool::new(!placeholder),
            placeholder: AtomicBool::new(placeholder),
        }
    }

    pub fn id(&self) -> MapPointId {
        self.id
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Geometry
    // ─────────────────────────────────────────────────────────────────────────

    pub fn world_pos(&self) -> Vector3<f64> {
        self.position.lock().world_pos
    }

    pub fn set_world_pos(&self, pos: Vector3<f64>) {
        self.position.lock().world_pos = pos;
        self.set_modified(true);
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.position.lock().normal
    }

    pub fn min_distance(&self) -> f64 {
        self.position.lock().min_distance
    }

    pub fn max_distance(&self) -> f64 {
        self.position.lock().max_distance
    }

    /// Closest distance at which the point is still expected to match.
    pub fn min_distance_invariance(&self) -> f64 {
        0.8 * self.min_distance()
    }

    /// Farthest distance at which the point is still expected to match.
    pub fn max_distance_invariance(&self) -> f64 {
        1.2 * self.max_distance()
    }

    /// Check if a viewing distance is within the valid range.
    pub fn is_in_distance_range(&self, distance: f64) -> bool {
        let pos = self.position.lock();
        distance >= pos.min_distance && distance <= pos.max_distance
    }

    /// Predict the pyramid level at which the point appears at `distance`.
    pub fn predict_scale(&self, distance: f64, pyramid: &ScalePyramid) -> u32 {
        let ratio = self.max_distance() / distance;
        let level = (ratio.ln() / pyramid.log_scale_factor()).ceil();
        if !level.is_finite() || level < 0.0 {
            0
        } else {
            (level as u32).min(pyramid.levels - 1)
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observations
    // ─────────────────────────────────────────────────────────────────────────

    /// Add an observation from a KeyFrame.
    ///
    /// Adopts the KeyFrame as reference if none is set. A stereo feature
    /// counts as two observations. Returns false if the KeyFrame already
    /// observes this point.
    ///
    /// Only the point side is updated; see [`Map::associate`] for the
    /// bidirectional link.
    pub fn add_observation(&self, kf: &KeyFrame, feature_idx: usize) -> bool {
        let mut feat = self.features.lock();
        if feat.observations.contains_key(&kf.id()) {
            return false;
        }
        feat.observations.insert(kf.id(), feature_idx);
        feat.n_obs += if kf.is_stereo(feature_idx) { 2 } else { 1 };
        if feat.reference_kf.is_none() {
            feat.reference_kf = Some(kf.id());
        }
        drop(feat);
        self.set_modified(true);
        true
    }

    /// Remove an observation.
    ///
    /// If the removed KeyFrame was the reference, the lowest remaining
    /// observer becomes the reference (or none). The point turns bad once its
    /// observation count drops to [`MIN_OBSERVATIONS`] or below. Returns true
    /// if the observation existed.
    pub fn erase_observation(&self, kf: &KeyFrame) -> bool {
        let mut feat = self.features.lock();
        let Some(idx) = feat.observations.remove(&kf.id()) else {
            return false;
        };
        let weight = if kf.is_stereo(idx) { 2 } else { 1 };
        feat.n_obs = feat.n_obs.saturating_sub(weight);

        if feat.reference_kf == Some(kf.id()) {
            feat.reference_kf = feat.observations.keys().next().copied();
        }
        if feat.n_obs <= MIN_OBSERVATIONS {
            feat.is_bad = true;
        }
        drop(feat);
        self.set_modified(true);
        true
    }

    /// Copy of the observation set.
    pub fn observations(&self) -> BTreeMap<KeyFrameId, usize> {
        self.features.lock().observations.clone()
    }

    /// Observation count (stereo observations count twice).
    pub fn num_observations(&self) -> usize {
        self.features.lock().n_obs
    }

    /// Number of distinct observing KeyFrames.
    pub fn num_observers(&self) -> usize {
        self.features.lock().observations.len()
    }

    pub fn index_in_keyframe(&self, kf_id: KeyFrameId) -> Option<usize> {
        self.features.lock().observations.get(&kf_id).copied()
    }

    pub fn is_in_keyframe(&self, kf_id: KeyFrameId) -> bool {
        self.features.lock().observations.contains_key(&kf_id)
    }

    pub fn reference_keyframe(&self) -> Option<KeyFrameId> {
        self.features.lock().reference_kf
    }

    pub fn first_keyframe(&self) -> Option<KeyFrameId> {
        self.features.lock().first_kf
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Quality
    // ─────────────────────────────────────────────────────────────────────────

    pub fn increase_visible(&self, n: u32) {
        self.features.lock().visible += n;
        self.set_modified(true);
    }

    pub fn increase_found(&self, n: u32) {
        self.features.lock().found += n;
        self.set_modified(true);
    }

    pub fn visible(&self) -> u32 {
        self.features.lock().visible
    }

    pub fn found(&self) -> u32 {
        self.features.lock().found
    }

    /// Compute the found ratio: found / visible.
    pub fn found_ratio(&self) -> f64 {
        let feat = self.features.lock();
        if feat.visible == 0 {
            1.0
        } else {
            feat.found as f64 / feat.visible as f64
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        self.features.lock().descriptor
    }

    pub fn set_descriptor(&self, descriptor: Descriptor) {
        self.features.lock().descriptor = descriptor;
        self.set_modified(true);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Bad flag and replacement
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_bad(&self) -> bool {
        self.features.lock().is_bad
    }

    /// Mark this point as bad and detach it from every observing KeyFrame.
    ///
    /// The point stays in the map index until it is explicitly erased.
    pub fn set_bad_flag(&self, map: &Map) {
        let observations = {
            let mut feat = self.features.lock();
            feat.is_bad = true;
            feat.n_obs = 0;
            feat.reference_kf = None;
            std::mem::take(&mut feat.observations)
        };
        self.set_modified(true);

        for (kf_id, idx) in observations {
            if let Some(kf) = map.keyframe(kf_id) {
                if kf.map_point(idx) == Some(self.id) {
                    kf.erase_map_point_match(idx);
                }
            }
        }
    }

    /// Point that directly superseded this one.
    pub fn replaced_by(&self) -> Option<MapPointId> {
        self.features.lock().replaced
    }

    /// Mark as replaced by `by`: bad, detached, linked.
    ///
    /// Returns the detached observations and the visible/found counters so
    /// the caller can move them to the replacer.
    pub(crate) fn mark_replaced(&self, by: MapPointId) -> (BTreeMap<KeyFrameId, usize>, u32, u32) {
        let mut feat = self.features.lock();
        feat.is_bad = true;
        feat.replaced = Some(by);
        feat.n_obs = 0;
        feat.reference_kf = None;
        let observations = std::mem::take(&mut feat.observations);
        let counters = (feat.visible, feat.found);
        drop(feat);
        self.set_modified(true);
        (observations, counters.0, counters.1)
    }

    /// Follow the replacement chain to its end.
    ///
    /// Returns this point if it was never replaced. A chain that revisits a
    /// point, or that leads to a point missing from `map`, is an error.
    pub fn find_final_replacement(self: &Arc<Self>, map: &Map) -> Result<Arc<MapPoint>, MapError> {
        let mut seen = HashSet::from([self.id]);
        let mut current = Arc::clone(self);
        while let Some(next) = current.replaced_by() {
            if !seen.insert(next) {
                return Err(MapError::ReplacementLoop(next));
            }
            current = map
                .map_point(next)
                .ok_or(MapError::DanglingReplacement(next))?;
        }
        Ok(current)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Derived quantities
    // ─────────────────────────────────────────────────────────────────────────

    /// Select the observation descriptor with the least median distance to
    /// all other observation descriptors.
    pub fn compute_distinctive_descriptors(&self, map: &Map) {
        let observations = {
            let feat = self.features.lock();
            if feat.is_bad {
                return;
            }
            feat.observations.clone()
        };

        let descriptors: Vec<Descriptor> = observations
            .iter()
            .filter_map(|(kf_id, idx)| {
                let kf = map.keyframe(*kf_id)?;
                if kf.is_bad() {
                    return None;
                }
                kf.descriptor(*idx)
            })
            .collect();

        if descriptors.is_empty() {
            return;
        }

        let n = descriptors.len();
        let median_idx = (n - 1) / 2;
        let mut best = (u32::MAX, 0usize);
        for (i, di) in descriptors.iter().enumerate() {
            let mut dists: Vec<u32> = descriptors.iter().map(|dj| di.distance(dj)).collect();
            dists.sort_unstable();
            let median = dists[median_idx];
            if median < best.0 {
                best = (median, i);
            }
        }

        self.set_descriptor(descriptors[best.1]);
    }

    /// Recompute the mean viewing direction and the scale-invariance range.
    ///
    /// The normal averages the unit directions from every observer's camera
    /// center. The distance range is derived from the distance to the
    /// reference KeyFrame and the pyramid level the point was detected at.
    pub fn update_normal_and_depth(&self, map: &Map) -> Result<(), MapError> {
        let (observations, reference) = {
            let feat = self.features.lock();
            if feat.is_bad || feat.observations.is_empty() {
                return Ok(());
            }
            (feat.observations.clone(), feat.reference_kf)
        };
        let reference = reference.ok_or(MapError::MissingReferenceKeyFrame(self.id))?;
        let ref_kf = map
            .keyframe(reference)
            .ok_or(MapError::UnknownKeyFrame(reference))?;

        let pos = self.world_pos();

        let mut normal_sum = Vector3::zeros();
        let mut n = 0usize;
        for kf_id in observations.keys() {
            let Some(kf) = map.keyframe(*kf_id) else {
                continue;
            };
            let dir = pos - kf.camera_center();
            let dist = dir.norm();
            if dist > 1e-10 {
                normal_sum += dir / dist;
                n += 1;
            }
        }

        let dist = (pos - ref_kf.camera_center()).norm();
        let (pyramid, level) = match (ref_kf.data(), observations.get(&reference)) {
            (Some(data), Some(&idx)) => (
                data.pyramid,
                data.keypoints.get(idx).map_or(0, |kp| kp.octave),
            ),
            (Some(data), None) => (data.pyramid, 0),
            (None, _) => (ScalePyramid::default(), 0),
        };

        let max_distance = dist * pyramid.scale_at(level);
        {
            let mut p = self.position.lock();
            p.max_distance = max_distance;
            p.min_distance = max_distance / pyramid.max_scale();
            if n > 0 {
                p.normal = normal_sum / n as f64;
            }
        }
        self.set_modified(true);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Replication
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::SeqCst)
    }

    pub fn set_modified(&self, modified: bool) {
        self.modified.store(modified, Ordering::SeqCst);
    }

    /// Full current state as a wire record.
    pub fn to_record(&self) -> MapPointRecord {
        let pos = self.position.lock().clone();
        let feat = self.features.lock().clone();
        MapPointRecord {
            id: self.id,
            first_kf: feat.first_kf,
            n_obs: feat.n_obs,
            reference_kf: feat.reference_kf,
            visible: feat.visible,
            found: feat.found,
            is_bad: feat.is_bad,
            replaced: feat.replaced,
            min_distance: pos.min_distance,
            max_distance: pos.max_distance,
            world_pos: pos.world_pos,
            normal: pos.normal,
            descriptor: feat.descriptor,
            observations: feat.observations.into_iter().collect(),
        }
    }

    /// Overwrite this point's state with a received record.
    ///
    /// The bad flag is only ever raised. Clears the placeholder mark.
    pub fn apply_record(&self, record: &MapPointRecord) -> Result<(), ProtocolError> {
        if record.id != self.id {
            return Err(ProtocolError::MapPointIdMismatch {
                expected: self.id,
                found: record.id,
            });
        }

        {
            let mut pos = self.position.lock();
            pos.world_pos = record.world_pos;
            pos.normal = record.normal;
            pos.min_distance = record.min_distance;
            pos.max_distance = record.max_distance;
        }
        {
            let mut feat = self.features.lock();
            feat.observations = record.observations.iter().copied().collect();
            feat.n_obs = record.n_obs;
            feat.reference_kf = record.reference_kf;
            feat.first_kf = record.first_kf;
            feat.visible = record.visible;
            feat.found = record.found;
            feat.is_bad |= record.is_bad;
            feat.replaced = record.replaced;
            feat.descriptor = record.descriptor;
        }
        self.placeholder.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl From<&MapPoint> for MapPointId {
    fn from(mp: &MapPoint) -> Self {
        mp.id
    }
}

impl From<&Arc<MapPoint>> for MapPointId {
    fn from(mp: &Arc<MapPoint>) -> Self {
        mp.id
    }
}

impl std::fmt::Debug for MapPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let feat = self.features.lock();
        f.debug_struct("MapPoint")
            .field("id", &self.id)
            .field("observations", &feat.observations.len())
            .field("n_obs", &feat.n_obs)
            .field("reference_kf", &feat.reference_kf)
            .field("visible", &feat.visible)
            .field("found", &feat.found)
            .field("is_bad", &feat.is_bad)
            .field("replaced", &feat.replaced)
            .finish()
    }
}
