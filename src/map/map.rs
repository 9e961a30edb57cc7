//! Map - Container for KeyFrames and MapPoints.
//!
//! The Map is the central data structure that holds the SLAM graph:
//! - KeyFrames with their poses and features
//! - MapPoints (3D landmarks) with their observations
//! - The big-change counter used to invalidate cached graph computations
//!
//! The index owns one `Arc` per node. Nodes reference each other by id only,
//! so erasing a node never leaves a cycle behind; the node is freed once the
//! last snapshot or change event holding it is dropped.
//!
//! Three locks live here:
//! - the index lock, held only while reading or writing the id tables and
//!   never while a node lock is taken
//! - the map-update lock, held by whoever needs a globally consistent graph
//!   (optimization, full enumeration)
//! - the creation lock, serializing find-or-create of nodes received from
//!   remote change events

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::error::MapError;
use super::keyframe::KeyFrame;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapPointId};

#[derive(Default)]
struct MapIndex {
    keyframes: HashMap<KeyFrameId, Arc<KeyFrame>>,
    map_points: HashMap<MapPointId, Arc<MapPoint>>,

    /// Highest KeyFrame id ever inserted since the last clear.
    max_kf_id: Option<KeyFrameId>,

    big_change_idx: u64,

    /// First KeyFrame of every initialization.
    keyframe_origins: Vec<KeyFrameId>,

    /// KeyFrames erased since the last [`Map::take_erased_keyframes`].
    erased_keyframes: BTreeSet<KeyFrameId>,
}

impl MapIndex {
    fn insert_keyframe(&mut self, kf: Arc<KeyFrame>) -> Option<Arc<KeyFrame>> {
        let id = kf.id();
        self.max_kf_id = self.max_kf_id.max(Some(id));
        self.erased_keyframes.remove(&id);
        self.keyframes.insert(id, kf)
    }
}

/// Point-in-time copy of the map contents, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct MapSnapshot {
    pub keyframes: Vec<Arc<KeyFrame>>,
    pub map_points: Vec<Arc<MapPoint>>,
    pub big_change_idx: u64,
}

/// The shared SLAM map containing KeyFrames and MapPoints.
#[derive(Default)]
pub struct Map {
    index: Mutex<MapIndex>,
    update: Mutex<()>,
    creation: Mutex<()>,
}

impl Map {
    /// Create a new empty Map.
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // KeyFrame Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a KeyFrame, replacing any KeyFrame with the same id.
    ///
    /// Returns the replaced KeyFrame.
    pub fn add_keyframe(&self, kf: Arc<KeyFrame>) -> Result<Option<Arc<KeyFrame>>, MapError> {
        if kf.id().is_null() {
            return Err(MapError::NullIdentifier);
        }
        Ok(self.index.lock().insert_keyframe(kf))
    }

    /// Remove a KeyFrame from the index.
    ///
    /// The id is remembered until [`Map::take_erased_keyframes`] so the
    /// deletion can be replicated. This does NOT update covisibility,
    /// spanning tree or observations.
    pub fn erase_keyframe(&self, kf: impl Into<KeyFrameId>) -> Option<Arc<KeyFrame>> {
        let id = kf.into();
        let mut index = self.index.lock();
        let erased = index.keyframes.remove(&id);
        if erased.is_some() {
            index.erased_keyframes.insert(id);
        }
        erased
    }

    /// Remove a KeyFrame whose deletion came from another map.
    pub(crate) fn discard_keyframe(&self, id: KeyFrameId) -> Option<Arc<KeyFrame>> {
        self.index.lock().keyframes.remove(&id)
    }

    /// Drain the ids erased since the last call.
    pub fn take_erased_keyframes(&self) -> BTreeSet<KeyFrameId> {
        std::mem::take(&mut self.index.lock().erased_keyframes)
    }

    /// Get a KeyFrame by ID.
    pub fn keyframe(&self, id: KeyFrameId) -> Option<Arc<KeyFrame>> {
        self.index.lock().keyframes.get(&id).cloned()
    }

    pub fn contains_keyframe(&self, id: KeyFrameId) -> bool {
        self.index.lock().keyframes.contains_key(&id)
    }

    /// All KeyFrames, ordered by id.
    pub fn all_keyframes(&self) -> Vec<Arc<KeyFrame>> {
        let mut kfs: Vec<Arc<KeyFrame>> = self.index.lock().keyframes.values().cloned().collect();
        kfs.sort_by_key(|kf| kf.id());
        kfs
    }

    /// Get the number of KeyFrames.
    pub fn keyframes_in_map(&self) -> usize {
        self.index.lock().keyframes.len()
    }

    /// Highest KeyFrame id inserted since the last clear.
    pub fn max_keyframe_id(&self) -> Option<KeyFrameId> {
        self.index.lock().max_kf_id
    }

    /// Record the first KeyFrame of an initialization.
    pub fn add_keyframe_origin(&self, id: KeyFrameId) {
        self.index.lock().keyframe_origins.push(id);
    }

    pub fn keyframe_origins(&self) -> Vec<KeyFrameId> {
        self.index.lock().keyframe_origins.clone()
    }

    pub fn is_origin(&self, id: KeyFrameId) -> bool {
        self.index.lock().keyframe_origins.contains(&id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // MapPoint Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert a MapPoint, replacing any MapPoint with the same id.
    pub fn add_map_point(&self, mp: Arc<MapPoint>) -> Result<Option<Arc<MapPoint>>, MapError> {
        if mp.id().is_null() {
            return Err(MapError::NullIdentifier);
        }
        Ok(self.index.lock().map_points.insert(mp.id(), mp))
    }

    /// Remove a MapPoint from the index.
    ///
    /// This does NOT remove observations from KeyFrames.
    pub fn erase_map_point(&self, mp: impl Into<MapPointId>) -> Option<Arc<MapPoint>> {
        let id = mp.into();
        self.index.lock().map_points.remove(&id)
    }

    /// Get a MapPoint by ID.
    pub fn map_point(&self, id: MapPointId) -> Option<Arc<MapPoint>> {
        self.index.lock().map_points.get(&id).cloned()
    }

    pub fn contains_map_point(&self, id: MapPointId) -> bool {
        self.index.lock().map_points.contains_key(&id)
    }

    /// All MapPoints, ordered by id.
    pub fn all_map_points(&self) -> Vec<Arc<MapPoint>> {
        let mut mps: Vec<Arc<MapPoint>> = self.index.lock().map_points.values().cloned().collect();
        mps.sort_by_key(|mp| mp.id());
        mps
    }

    /// Get the number of MapPoints.
    pub fn map_points_in_map(&self) -> usize {
        self.index.lock().map_points.len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Batches and remote creation
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert KeyFrames and MapPoints under a single index lock.
    ///
    /// Every id is checked before anything is inserted, so a null id leaves
    /// the map untouched.
    pub fn insert_batch(
        &self,
        keyframes: &[Arc<KeyFrame>],
        map_points: &[Arc<MapPoint>],
    ) -> Result<(), MapError> {
        if keyframes.iter().any(|kf| kf.id().is_null())
            || map_points.iter().any(|mp| mp.id().is_null())
        {
            return Err(MapError::NullIdentifier);
        }

        let mut index = self.index.lock();
        for kf in keyframes {
            index.insert_keyframe(Arc::clone(kf));
        }
        for mp in map_points {
            index.map_points.insert(mp.id(), Arc::clone(mp));
        }
        Ok(())
    }

    /// Look up a KeyFrame, inserting a placeholder if it is unknown.
    ///
    /// Returns the KeyFrame and whether it was created.
    pub fn find_or_create_keyframe(&self, id: KeyFrameId) -> Result<(Arc<KeyFrame>, bool), MapError> {
        let _creation = self.creation.lock();
        if let Some(kf) = self.keyframe(id) {
            return Ok((kf, false));
        }
        let kf = Arc::new(KeyFrame::placeholder(id));
        self.add_keyframe(Arc::clone(&kf))?;
        Ok((kf, true))
    }

    /// Look up a MapPoint, inserting a placeholder if it is unknown.
    pub fn find_or_create_map_point(&self, id: MapPointId) -> Result<(Arc<MapPoint>, bool), MapError> {
        let _creation = self.creation.lock();
        if let Some(mp) = self.map_point(id) {
            return Ok((mp, false));
        }
        let mp = Arc::new(MapPoint::placeholder(id));
        self.add_map_point(Arc::clone(&mp))?;
        Ok((mp, true))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Associations
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a bidirectional association between a KeyFrame feature and a MapPoint.
    ///
    /// Returns false if the MapPoint already had an observation from this KeyFrame.
    pub fn associate(&self, kf_id: KeyFrameId, feature_idx: usize, mp_id: MapPointId) -> Result<bool, MapError> {
        let kf = self.keyframe(kf_id).ok_or(MapError::UnknownKeyFrame(kf_id))?;
        let mp = self.map_point(mp_id).ok_or(MapError::UnknownMapPoint(mp_id))?;

        kf.add_map_point(feature_idx, mp_id);
        Ok(mp.add_observation(&kf, feature_idx))
    }

    /// Remove the association between a KeyFrame feature and its MapPoint.
    ///
    /// A point left with too few observations is flagged bad and detached
    /// from its remaining observers. Returns the MapPoint ID that was
    /// disassociated, if any.
    pub fn disassociate(&self, kf_id: KeyFrameId, feature_idx: usize) -> Option<MapPointId> {
        let kf = self.keyframe(kf_id)?;
        let mp_id = kf.erase_map_point_match(feature_idx)?;

        if let Some(mp) = self.map_point(mp_id) {
            if mp.erase_observation(&kf) && mp.is_bad() {
                mp.set_bad_flag(self);
            }
        }
        Some(mp_id)
    }

    /// Replace `old_id` with `new_id` everywhere.
    ///
    /// Observations of the old point move to the replacer (KeyFrames that
    /// already observe the replacer just lose the old slot), visibility
    /// counters are merged, and the old point is marked bad with a
    /// replacement link. Refuses to replace a point with itself or to create
    /// a cycle in the replacement chain.
    pub fn replace_map_point(&self, old_id: MapPointId, new_id: MapPointId) -> Result<(), MapError> {
        if old_id == new_id {
            return Err(MapError::SelfReplacement(old_id));
        }
        let old = self.map_point(old_id).ok_or(MapError::UnknownMapPoint(old_id))?;
        let new = self.map_point(new_id).ok_or(MapError::UnknownMapPoint(new_id))?;

        // The replacer must not already resolve to the replaced point.
        let mut seen = HashSet::from([new_id]);
        let mut current = Arc::clone(&new);
        while let Some(next) = current.replaced_by() {
            if next == old_id {
                return Err(MapError::CyclicReplacement {
                    replaced: old_id,
                    replacer: new_id,
                });
            }
            if !seen.insert(next) {
                return Err(MapError::ReplacementLoop(next));
            }
            match self.map_point(next) {
                Some(mp) => current = mp,
                None => break,
            }
        }

        let (observations, visible, found) = old.mark_replaced(new_id);

        for (kf_id, idx) in observations {
            let Some(kf) = self.keyframe(kf_id) else {
                continue;
            };
            if new.is_in_keyframe(kf_id) {
                kf.erase_map_point_match(idx);
            } else {
                kf.add_map_point(idx, new_id);
                new.add_observation(&kf, idx);
            }
        }

        new.increase_found(found);
        new.increase_visible(visible);
        new.compute_distinctive_descriptors(self);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Consistency and versioning
    // ─────────────────────────────────────────────────────────────────────────

    /// Lock held for operations that need a globally consistent graph.
    pub fn update_lock(&self) -> MutexGuard<'_, ()> {
        self.update.lock()
    }

    /// Signal a non-incremental change (loop closure, global optimization).
    pub fn inform_new_big_change(&self) {
        self.index.lock().big_change_idx += 1;
    }

    pub fn last_big_change_idx(&self) -> u64 {
        self.index.lock().big_change_idx
    }

    /// Snapshot of the index. Callers wanting a consistent graph hold
    /// [`Map::update_lock`] or use [`Map::consistent_snapshot`].
    pub fn snapshot(&self) -> MapSnapshot {
        let index = self.index.lock();
        let mut keyframes: Vec<Arc<KeyFrame>> = index.keyframes.values().cloned().collect();
        let mut map_points: Vec<Arc<MapPoint>> = index.map_points.values().cloned().collect();
        let big_change_idx = index.big_change_idx;
        drop(index);

        keyframes.sort_by_key(|kf| kf.id());
        map_points.sort_by_key(|mp| mp.id());
        MapSnapshot {
            keyframes,
            map_points,
            big_change_idx,
        }
    }

    /// Snapshot taken while holding the map-update lock.
    pub fn consistent_snapshot(&self) -> MapSnapshot {
        let _update = self.update.lock();
        self.snapshot()
    }

    /// Drop every node and reset all counters.
    pub fn clear(&self) {
        let old = std::mem::take(&mut *self.index.lock());
        // Nodes are released outside the index lock.
        drop(old);
    }
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.lock();
        f.debug_struct("Map")
            .field("keyframes", &index.keyframes.len())
            .field("map_points", &index.map_points.len())
            .field("max_kf_id", &index.max_kf_id)
            .field("big_change_idx", &index.big_change_idx)
            .finish()
    }
}
