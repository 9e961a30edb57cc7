//! KeyFrame - A retained sensor capture with map structure relationships.
//!
//! KeyFrames are the core nodes of the SLAM graph. They contain:
//! - Sensor data (keypoints, descriptors, stereo coordinates), immutable once set
//! - Pose estimate, behind its own lock
//! - Graph relationships (covisibility, spanning tree, loop edges)
//! - Feature index -> MapPoint slots
//!
//! A KeyFrame never owns MapPoints: slots hold identifiers that are resolved
//! through the [`Map`]. Locks are always taken in the order
//! pose -> connections -> features.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::Vector3;
use parking_lot::Mutex;

use crate::protocol::{KeyFrameRecord, ProtocolError};

use super::map::Map;
use super::types::{Descriptor, KeyFrameId, KeyPoint, MapPointId, Pose, ScalePyramid};

/// Minimum number of shared MapPoints for a covisibility edge.
pub const COVISIBILITY_THRESHOLD: usize = 15;

/// Immutable sensor data of a KeyFrame.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyFrameData {
    /// Capture time in seconds.
    pub timestamp: f64,

    /// Undistorted keypoints.
    pub keypoints: Vec<KeyPoint>,

    /// Right-image u coordinate per keypoint; negative for monocular features.
    pub right: Vec<f32>,

    /// One descriptor per keypoint.
    pub descriptors: Vec<Descriptor>,

    pub pyramid: ScalePyramid,
}

impl KeyFrameData {
    /// Create sensor data. `right` and `descriptors` are padded to the
    /// keypoint count (monocular / zero descriptor) if they are shorter.
    pub fn new(
        timestamp: f64,
        keypoints: Vec<KeyPoint>,
        mut right: Vec<f32>,
        mut descriptors: Vec<Descriptor>,
        pyramid: ScalePyramid,
    ) -> Self {
        let n = keypoints.len();
        right.resize(n, -1.0);
        descriptors.resize(n, Descriptor::zeros());
        Self {
            timestamp,
            keypoints,
            right,
            descriptors,
            pyramid,
        }
    }

    /// Monocular capture: no feature has a right-image match.
    pub fn monocular(
        timestamp: f64,
        keypoints: Vec<KeyPoint>,
        descriptors: Vec<Descriptor>,
        pyramid: ScalePyramid,
    ) -> Self {
        Self::new(timestamp, keypoints, Vec::new(), descriptors, pyramid)
    }

    pub fn len(&self) -> usize {
        self.keypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keypoints.is_empty()
    }

    /// Whether feature `idx` was matched in the right image.
    pub fn is_stereo(&self, idx: usize) -> bool {
        self.right.get(idx).is_some_and(|&u| u >= 0.0)
    }
}

/// Graph relationships, guarded by the connections lock.
#[derive(Debug, Clone, Default)]
struct Connections {
    /// Connected KeyFrame -> number of shared MapPoints.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    /// Cached ordered list of covisible KeyFrames (best first).
    ordered_covisibles: Vec<(KeyFrameId, usize)>,

    /// Flag indicating ordered_covisibles needs rebuilding.
    covisibility_dirty: bool,

    /// Parent in the spanning tree, None for a root.
    parent_id: Option<KeyFrameId>,

    children_ids: BTreeSet<KeyFrameId>,

    loop_edges: BTreeSet<KeyFrameId>,

    /// True until the first covisibility update attached this KeyFrame to the tree.
    first_connection: bool,

    is_bad: bool,
}

impl Connections {
    fn ensure_ordered_covisibles(&mut self) {
        if !self.covisibility_dirty {
            return;
        }

        self.ordered_covisibles = self
            .covisibility_weights
            .iter()
            .map(|(id, w)| (*id, *w))
            .collect();
        // Descending by weight, ties by id so the order is deterministic.
        self.ordered_covisibles
            .sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        self.covisibility_dirty = false;
    }
}

/// A KeyFrame in the shared map.
pub struct KeyFrame {
    id: KeyFrameId,

    /// Sensor data. Unset for placeholders created while decoding a change
    /// event that referenced this KeyFrame before its own record arrived.
    data: OnceLock<KeyFrameData>,

    pose: Mutex<Pose>,

    connections: Mutex<Connections>,

    /// Feature index -> MapPoint association.
    map_points: Mutex<Vec<Option<MapPointId>>>,

    /// Set by every mutator; cleared when the state is collected into a change event.
    modified: AtomicBool,
}

impl KeyFrame {
    /// Create a new KeyFrame.
    ///
    /// # Arguments
    /// * `id` - Identifier from the creating tracker's lease
    /// * `pose` - World-to-camera transform (T_cw)
    /// * `data` - Keypoints, descriptors and pyramid of the capture
    pub fn new(id: KeyFrameId, pose: Pose, data: KeyFrameData) -> Self {
        let slots = vec![None; data.len()];
        Self {
            id,
            data: OnceLock::from(data),
            pose: Mutex::new(pose),
            connections: Mutex::new(Connections {
                first_connection: true,
                ..Connections::default()
            }),
            map_points: Mutex::new(slots),
            modified: AtomicBool::new(true),
        }
    }

    /// Create an id-only stand-in whose sensor data arrives later.
    pub fn placeholder(id: KeyFrameId) -> Self {
        Self {
            id,
            data: OnceLock::new(),
            pose: Mutex::new(Pose::identity()),
            connections: Mutex::new(Connections {
                first_connection: true,
                ..Connections::default()
            }),
            map_points: Mutex::new(Vec::new()),
            modified: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> KeyFrameId {
        self.id
    }

    /// Sensor data, None for an unfilled placeholder.
    pub fn data(&self) -> Option<&KeyFrameData> {
        self.data.get()
    }

    pub fn is_placeholder(&self) -> bool {
        self.data.get().is_none()
    }

    /// Set the sensor data of a placeholder. Returns false if data was already set.
    pub fn fill(&self, data: KeyFrameData) -> bool {
        let n = data.len();
        if self.data.set(data).is_err() {
            return false;
        }
        let mut slots = self.map_points.lock();
        if slots.len() < n {
            slots.resize(n, None);
        }
        self.set_modified(true);
        true
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.data().map(|d| d.timestamp)
    }

    /// Get number of features in this KeyFrame.
    pub fn num_features(&self) -> usize {
        self.data().map_or(0, KeyFrameData::len)
    }

    /// Whether feature `idx` contributes a stereo (double) observation.
    pub fn is_stereo(&self, idx: usize) -> bool {
        self.data().is_some_and(|d| d.is_stereo(idx))
    }

    pub fn descriptor(&self, idx: usize) -> Option<Descriptor> {
        self.data().and_then(|d| d.descriptors.get(idx).copied())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pose
    // ─────────────────────────────────────────────────────────────────────────

    pub fn pose(&self) -> Pose {
        *self.pose.lock()
    }

    pub fn set_pose(&self, pose: Pose) {
        *self.pose.lock() = pose;
        self.set_modified(true);
    }

    /// Camera center in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.lock().inverse().translation.vector
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Map Point Associations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the MapPoint ID for a given feature index.
    pub fn map_point(&self, feature_idx: usize) -> Option<MapPointId> {
        self.map_points.lock().get(feature_idx).copied().flatten()
    }

    /// Associate a feature with a MapPoint.
    ///
    /// Returns the previous MapPoint ID if there was one. Out-of-range indices
    /// are ignored.
    pub fn add_map_point(&self, feature_idx: usize, mp_id: MapPointId) -> Option<MapPointId> {
        let mut slots = self.map_points.lock();
        let slot = slots.get_mut(feature_idx)?;
        let prev = slot.replace(mp_id);
        drop(slots);
        self.set_modified(true);
        prev
    }

    /// Remove the association for a feature.
    pub fn erase_map_point_match(&self, feature_idx: usize) -> Option<MapPointId> {
        let prev = self.map_points.lock().get_mut(feature_idx)?.take();
        if prev.is_some() {
            self.set_modified(true);
        }
        prev
    }

    /// Remove every slot associated with `mp_id`. Returns the number of cleared slots.
    pub fn erase_map_point(&self, mp_id: MapPointId) -> usize {
        let mut cleared = 0;
        for slot in self.map_points.lock().iter_mut() {
            if *slot == Some(mp_id) {
                *slot = None;
                cleared += 1;
            }
        }
        if cleared > 0 {
            self.set_modified(true);
        }
        cleared
    }

    /// Copy of all slots, indexed by feature.
    pub fn map_point_matches(&self) -> Vec<Option<MapPointId>> {
        self.map_points.lock().clone()
    }

    /// Get all associated MapPoint IDs with their feature indices.
    pub fn map_point_indices(&self) -> Vec<(usize, MapPointId)> {
        self.map_points
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
            .collect()
    }

    /// Count the number of associated MapPoints.
    pub fn num_map_points(&self) -> usize {
        self.map_points.lock().iter().filter(|mp| mp.is_some()).count()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Covisibility Graph
    // ─────────────────────────────────────────────────────────────────────────

    /// Add or update a covisibility connection.
    ///
    /// # Arguments
    /// * `kf_id` - The connected KeyFrame
    /// * `weight` - Number of shared MapPoints
    pub fn add_connection(&self, kf_id: KeyFrameId, weight: usize) {
        if kf_id == self.id {
            return; // Don't connect to self
        }
        let mut conn = self.connections.lock();
        if conn.covisibility_weights.insert(kf_id, weight) != Some(weight) {
            conn.covisibility_dirty = true;
            drop(conn);
            self.set_modified(true);
        }
    }

    /// Remove a covisibility connection.
    pub fn erase_connection(&self, kf_id: KeyFrameId) {
        let mut conn = self.connections.lock();
        if conn.covisibility_weights.remove(&kf_id).is_some() {
            conn.covisibility_dirty = true;
            drop(conn);
            self.set_modified(true);
        }
    }

    /// Get the covisibility weight with another KeyFrame.
    pub fn connection_weight(&self, kf_id: KeyFrameId) -> usize {
        self.connections
            .lock()
            .covisibility_weights
            .get(&kf_id)
            .copied()
            .unwrap_or(0)
    }

    /// Copy of the covisibility weights.
    pub fn covisibility_weights(&self) -> HashMap<KeyFrameId, usize> {
        self.connections.lock().covisibility_weights.clone()
    }

    /// Get the N best covisible KeyFrames (most shared points first).
    pub fn best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        let mut conn = self.connections.lock();
        conn.ensure_ordered_covisibles();
        conn.ordered_covisibles
            .iter()
            .take(n)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Get covisible KeyFrames with at least `min_weight` shared points.
    pub fn covisibles_above_weight(&self, min_weight: usize) -> Vec<KeyFrameId> {
        let mut conn = self.connections.lock();
        conn.ensure_ordered_covisibles();
        conn.ordered_covisibles
            .iter()
            .take_while(|(_, w)| *w >= min_weight)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Recompute covisibility from the MapPoints this KeyFrame observes.
    ///
    /// Counts, for every other observer of every associated MapPoint, the
    /// number of shared points. Edges with at least [`COVISIBILITY_THRESHOLD`]
    /// shared points are kept (or only the strongest one if none reaches it),
    /// and written on both ends. On the first update the strongest neighbor
    /// becomes the spanning-tree parent.
    pub fn update_connections(&self, map: &Map) {
        let mut counter: HashMap<KeyFrameId, usize> = HashMap::new();
        for (_, mp_id) in self.map_point_indices() {
            let Some(mp) = map.map_point(mp_id) else {
                continue;
            };
            if mp.is_bad() {
                continue;
            }
            for kf_id in mp.observations().into_keys() {
                if kf_id != self.id {
                    *counter.entry(kf_id).or_default() += 1;
                }
            }
        }

        if counter.is_empty() {
            return;
        }

        let best = counter
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(id, w)| (*id, *w));

        let mut kept: HashMap<KeyFrameId, usize> = counter
            .iter()
            .filter(|(_, w)| **w >= COVISIBILITY_THRESHOLD)
            .map(|(id, w)| (*id, *w))
            .collect();
        if kept.is_empty() {
            if let Some((id, w)) = best {
                kept.insert(id, w);
            }
        }

        for (&kf_id, &weight) in &kept {
            if let Some(other) = map.keyframe(kf_id) {
                other.add_connection(self.id, weight);
            }
        }

        // Index lock before node lock.
        let is_origin = map.is_origin(self.id);
        let new_parent = {
            let mut conn = self.connections.lock();
            conn.covisibility_weights = kept;
            conn.covisibility_dirty = true;
            if conn.first_connection && !is_origin {
                conn.first_connection = false;
                best.map(|(id, _)| id)
            } else {
                None
            }
        };
        self.set_modified(true);

        if let Some(parent_id) = new_parent {
            self.set_parent(parent_id);
            if let Some(parent) = map.keyframe(parent_id) {
                parent.add_child(self.id);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Spanning Tree and Loop Edges
    // ─────────────────────────────────────────────────────────────────────────

    /// Parent KeyFrame in the spanning tree.
    pub fn parent(&self) -> Option<KeyFrameId> {
        self.connections.lock().parent_id
    }

    /// Set the parent KeyFrame in the spanning tree.
    pub fn set_parent(&self, parent_id: KeyFrameId) {
        self.connections.lock().parent_id = Some(parent_id);
        self.set_modified(true);
    }

    /// Add a child KeyFrame in the spanning tree.
    pub fn add_child(&self, child_id: KeyFrameId) {
        if self.connections.lock().children_ids.insert(child_id) {
            self.set_modified(true);
        }
    }

    /// Remove a child KeyFrame from the spanning tree.
    pub fn erase_child(&self, child_id: KeyFrameId) {
        if self.connections.lock().children_ids.remove(&child_id) {
            self.set_modified(true);
        }
    }

    pub fn children(&self) -> BTreeSet<KeyFrameId> {
        self.connections.lock().children_ids.clone()
    }

    /// Check if this is a root KeyFrame (no parent).
    pub fn is_root(&self) -> bool {
        self.connections.lock().parent_id.is_none()
    }

    pub fn add_loop_edge(&self, kf_id: KeyFrameId) {
        if self.connections.lock().loop_edges.insert(kf_id) {
            self.set_modified(true);
        }
    }

    pub fn loop_edges(&self) -> BTreeSet<KeyFrameId> {
        self.connections.lock().loop_edges.clone()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Status
    // ─────────────────────────────────────────────────────────────────────────

    /// Mark this KeyFrame as bad. Bad is permanent.
    pub fn set_bad(&self) {
        self.connections.lock().is_bad = true;
        self.set_modified(true);
    }

    pub fn is_bad(&self) -> bool {
        self.connections.lock().is_bad
    }

    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::SeqCst)
    }

    pub fn set_modified(&self, modified: bool) {
        self.modified.store(modified, Ordering::SeqCst);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Replication
    // ─────────────────────────────────────────────────────────────────────────

    /// Full current state as a wire record.
    pub fn to_record(&self) -> KeyFrameRecord {
        let pose = self.pose();
        let conn = self.connections.lock().clone();
        let map_points = self.map_point_matches();

        let mut covisibility: Vec<(KeyFrameId, usize)> =
            conn.covisibility_weights.into_iter().collect();
        covisibility.sort();

        KeyFrameRecord {
            id: self.id,
            is_bad: conn.is_bad,
            parent: conn.parent_id,
            pose,
            data: self.data().cloned(),
            map_points,
            covisibility,
            children: conn.children_ids.into_iter().collect(),
            loop_edges: conn.loop_edges.into_iter().collect(),
        }
    }

    /// Overwrite this KeyFrame's state with a received record.
    ///
    /// The record must carry this KeyFrame's id. Sensor data fills a
    /// placeholder and is otherwise ignored (it is immutable). The bad flag is
    /// only ever raised.
    pub fn apply_record(&self, record: &KeyFrameRecord) -> Result<(), ProtocolError> {
        if record.id != self.id {
            return Err(ProtocolError::KeyFrameIdMismatch {
                expected: self.id,
                found: record.id,
            });
        }

        if let Some(data) = &record.data {
            if self.data.get().is_none() {
                let _ = self.data.set(data.clone());
            }
        }

        *self.pose.lock() = record.pose;
        {
            let mut conn = self.connections.lock();
            conn.covisibility_weights = record.covisibility.iter().copied().collect();
            conn.covisibility_dirty = true;
            conn.parent_id = record.parent;
            conn.children_ids = record.children.iter().copied().collect();
            conn.loop_edges = record.loop_edges.iter().copied().collect();
            conn.is_bad |= record.is_bad;
            conn.first_connection = record.parent.is_none() && conn.first_connection;
        }
        *self.map_points.lock() = record.map_points.clone();
        Ok(())
    }
}

impl From<&KeyFrame> for KeyFrameId {
    fn from(kf: &KeyFrame) -> Self {
        kf.id
    }
}

impl From<&Arc<KeyFrame>> for KeyFrameId {
    fn from(kf: &Arc<KeyFrame>) -> Self {
        kf.id
    }
}

impl std::fmt::Debug for KeyFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let conn = self.connections.lock();
        f.debug_struct("KeyFrame")
            .field("id", &self.id)
            .field("placeholder", &self.is_placeholder())
            .field("num_features", &self.num_features())
            .field("covisibles", &conn.covisibility_weights.len())
            .field("has_parent", &conn.parent_id.is_some())
            .field("num_children", &conn.children_ids.len())
            .field("is_bad", &conn.is_bad)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_keyframe(id: u64) -> KeyFrame {
        create_keyframe_with_features(id, 0)
    }

    fn create_keyframe_with_features(id: u64, num_features: usize) -> KeyFrame {
        let keypoints = (0..num_features)
            .map(|i| KeyPoint::new(i as f32, i as f32, 0))
            .collect();
        KeyFrame::new(
            KeyFrameId::new(id),
            Pose::identity(),
            KeyFrameData::monocular(id as f64, keypoints, Vec::new(), ScalePyramid::default()),
        )
    }

    #[test]
    fn test_map_point_association() {
        let kf = create_keyframe_with_features(1, 10);

        // Associate feature 3 with MapPoint 100
        kf.add_map_point(3, MapPointId::new(100));
        assert_eq!(kf.map_point(3), Some(MapPointId::new(100)));
        assert_eq!(kf.map_point(4), None);
        assert_eq!(kf.num_map_points(), 1);

        // Overwrite association
        let prev = kf.add_map_point(3, MapPointId::new(200));
        assert_eq!(prev, Some(MapPointId::new(100)));
        assert_eq!(kf.map_point(3), Some(MapPointId::new(200)));

        // Erase association
        let erased = kf.erase_map_point_match(3);
        assert_eq!(erased, Some(MapPointId::new(200)));
        assert_eq!(kf.map_point(3), None);

        // Out of range slot is ignored
        assert_eq!(kf.add_map_point(42, MapPointId::new(1)), None);
        assert_eq!(kf.num_map_points(), 0);
    }

    #[test]
    fn test_erase_map_point_by_id() {
        let kf = create_keyframe_with_features(1, 5);
        kf.add_map_point(0, MapPointId::new(7));
        kf.add_map_point(4, MapPointId::new(7));
        kf.add_map_point(2, MapPointId::new(8));

        assert_eq!(kf.erase_map_point(MapPointId::new(7)), 2);
        assert_eq!(kf.map_point_indices(), vec![(2, MapPointId::new(8))]);
    }

    #[test]
    fn test_covisibility_graph() {
        let kf = create_test_keyframe(1);

        kf.add_connection(KeyFrameId::new(2), 50);
        kf.add_connection(KeyFrameId::new(3), 100);
        kf.add_connection(KeyFrameId::new(4), 25);

        assert_eq!(kf.connection_weight(KeyFrameId::new(2)), 50);
        assert_eq!(kf.connection_weight(KeyFrameId::new(5)), 0); // Not connected

        // Get best covisibles (should be ordered by weight descending)
        let best = kf.best_covisibles(2);
        assert_eq!(best, vec![KeyFrameId::new(3), KeyFrameId::new(2)]);

        // Get above threshold
        let above_30 = kf.covisibles_above_weight(30);
        assert_eq!(above_30.len(), 2); // 100 and 50, not 25

        kf.erase_connection(KeyFrameId::new(3));
        assert_eq!(kf.best_covisibles(1), vec![KeyFrameId::new(2)]);
    }

    #[test]
    fn test_covisibility_no_self_connection() {
        let kf = create_test_keyframe(1);
        kf.add_connection(KeyFrameId::new(1), 100); // Try to connect to self
        assert_eq!(kf.connection_weight(KeyFrameId::new(1)), 0);
    }

    #[test]
    fn test_spanning_tree() {
        let kf1 = create_test_keyframe(1);
        let kf2 = create_test_keyframe(2);

        assert!(kf1.is_root());

        // Set kf1 as parent of kf2
        kf2.set_parent(KeyFrameId::new(1));
        kf1.add_child(KeyFrameId::new(2));

        assert!(!kf2.is_root());
        assert_eq!(kf2.parent(), Some(KeyFrameId::new(1)));
        assert!(kf1.children().contains(&KeyFrameId::new(2)));

        kf1.erase_child(KeyFrameId::new(2));
        assert!(kf1.children().is_empty());
    }

    #[test]
    fn test_stereo_features() {
        let data = KeyFrameData::new(
            0.0,
            vec![KeyPoint::new(1.0, 1.0, 0), KeyPoint::new(2.0, 2.0, 1)],
            vec![12.5],
            Vec::new(),
            ScalePyramid::default(),
        );
        let kf = KeyFrame::new(KeyFrameId::new(0), Pose::identity(), data);

        assert!(kf.is_stereo(0));
        // Padded right coordinate means monocular.
        assert!(!kf.is_stereo(1));
        assert!(!kf.is_stereo(5));
    }

    #[test]
    fn test_new_keyframe_is_filled() {
        let kf = create_keyframe_with_features(3, 6);
        assert!(!kf.is_placeholder());
        assert_eq!(kf.timestamp(), Some(3.0));
        assert_eq!(kf.num_features(), 6);
        assert_eq!(kf.map_point_matches().len(), 6);
    }

    #[test]
    fn test_origin_never_adopts_parent() {
        use crate::map::MapPoint;

        let map = Map::new();
        let kfs: Vec<Arc<KeyFrame>> = (0..2)
            .map(|i| Arc::new(create_keyframe_with_features(i, 3)))
            .collect();
        for kf in &kfs {
            map.add_keyframe(Arc::clone(kf)).unwrap();
        }
        map.add_keyframe_origin(kfs[0].id());
        let mp_id = MapPointId::new(5);
        map.add_map_point(Arc::new(MapPoint::new(mp_id, Vector3::new(0.0, 0.0, 2.0), kfs[0].id())))
            .unwrap();
        for kf in &kfs {
            map.associate(kf.id(), 0, mp_id).unwrap();
        }

        kfs[0].update_connections(&map);
        assert!(kfs[0].is_root());
        assert_eq!(kfs[0].connection_weight(kfs[1].id()), 1);

        kfs[1].update_connections(&map);
        assert_eq!(kfs[1].parent(), Some(kfs[0].id()));
        assert!(kfs[0].children().contains(&kfs[1].id()));
    }

    #[test]
    fn test_placeholder_fill() {
        let kf = KeyFrame::placeholder(KeyFrameId::new(9));
        assert!(kf.is_placeholder());
        assert_eq!(kf.num_features(), 0);
        assert!(!kf.is_stereo(0));

        let data = KeyFrameData::monocular(
            3.0,
            vec![KeyPoint::new(0.0, 0.0, 0); 4],
            Vec::new(),
            ScalePyramid::default(),
        );
        assert!(kf.fill(data.clone()));
        assert!(!kf.is_placeholder());
        assert_eq!(kf.num_features(), 4);
        assert_eq!(kf.map_point_matches().len(), 4);

        // Sensor data is immutable once set.
        assert!(!kf.fill(data));
    }

    #[test]
    fn test_camera_center() {
        let kf = create_test_keyframe(1);
        // T_cw translates the world by -2 on x, so the camera sits at x = 2.
        kf.set_pose(Pose::translation(-2.0, 0.0, 0.0));
        let center = kf.camera_center();
        assert!((center - Vector3::new(2.0, 0.0, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_modified_flag_and_bad() {
        let kf = create_test_keyframe(1);
        assert!(kf.is_modified());
        kf.set_modified(false);

        kf.add_loop_edge(KeyFrameId::new(4));
        assert!(kf.is_modified());
        assert!(kf.loop_edges().contains(&KeyFrameId::new(4)));

        kf.set_modified(false);
        kf.set_bad();
        assert!(kf.is_bad());
        assert!(kf.is_modified());
    }

    #[test]
    fn test_record_id_mismatch() {
        let kf1 = create_test_keyframe(1);
        let kf2 = create_test_keyframe(2);

        let result = kf1.apply_record(&kf2.to_record());
        assert!(matches!(
            result,
            Err(ProtocolError::KeyFrameIdMismatch { .. })
        ));
    }
}
