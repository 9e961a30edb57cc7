//! MapperServer - Owner of the canonical map.
//!
//! Trackers log in to a slot, receive an identifier lease, seed the map once
//! through [`Mapper::initialize`] and then stream keyframes in with
//! [`Mapper::insert_keyframe`]. Every accepted mutation is collected from the
//! nodes' dirty flags into a [`MapChangeEvent`] and handed to the registered
//! observers after all locks are released.
//!
//! Lock order: map-update lock, then server state, then the map index and
//! node locks. The login lock is only ever taken first.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::map::{KeyFrame, KeyFrameId, Map, MapError, MapPoint, MapPointId, Pose, ScalePyramid, TrackerId};
use crate::optimizer::{self, OptimizationReport, OptimizationScope, Optimizer};
use crate::protocol::MapChangeEvent;

use super::error::MapperError;
use super::identity::{
    keyframe_id_span, keyframe_owner, map_point_id_span, map_point_owner, IdentityLease,
    MapPointOwner,
};
use super::observer::MapObserver;
use super::Mapper;

/// Runtime configuration of a [`MapperServer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapperConfig {
    /// Number of tracker slots. Fixes the identifier spans.
    pub max_trackers: u32,

    /// Scale pyramid shared by every tracker's feature extractor.
    pub pyramid: ScalePyramid,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            max_trackers: 2,
            pyramid: ScalePyramid::default(),
        }
    }
}

/// Connection state of a tracker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    LoggedOut,
    LoggedIn,
    /// The tracker has contributed to the map.
    Initialized,
}

/// Bookkeeping for one tracker slot.
///
/// The identifier counters survive logout, so a slot that is reused
/// continues where its previous holder stopped.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerStatus {
    pub state: SlotState,
    pub next_keyframe_id: KeyFrameId,
    pub next_map_point_id: MapPointId,

    /// Latest camera pose (T_cw) reported by the tracker.
    pub pose: Option<Pose>,

    /// Rig pivot calibration given at login.
    pub pivot: Option<Pose>,
}

impl TrackerStatus {
    fn new(tracker: TrackerId) -> Self {
        let t = u64::from(tracker.0);
        Self {
            state: SlotState::LoggedOut,
            next_keyframe_id: KeyFrameId(t),
            next_map_point_id: MapPointId(t),
            pose: None,
            pivot: None,
        }
    }

    fn is_logged_in(&self) -> bool {
        self.state != SlotState::LoggedOut
    }

    fn advance(&mut self, keyframes: &[Arc<KeyFrame>], map_points: &[Arc<MapPoint>], max_trackers: u32) {
        for kf in keyframes {
            let next = KeyFrameId(kf.id().0 + keyframe_id_span(max_trackers));
            self.next_keyframe_id = self.next_keyframe_id.max(next);
        }
        for mp in map_points {
            let next = MapPointId(mp.id().0 + map_point_id_span(max_trackers));
            self.next_map_point_id = self.next_map_point_id.max(next);
        }
    }
}

/// Granted by a successful login.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerLogin {
    pub tracker: TrackerId,

    /// Identifier spaces the tracker allocates from.
    pub lease: IdentityLease,

    pub pivot: Pose,
}

struct ServerState {
    trackers: Vec<TrackerStatus>,
    initialized: bool,
}

impl ServerState {
    fn slot(&self, tracker: TrackerId) -> Result<&TrackerStatus, MapperError> {
        let status = self
            .trackers
            .get(tracker.index())
            .ok_or(MapperError::InvalidTracker(tracker))?;
        if !status.is_logged_in() {
            return Err(MapperError::NotLoggedIn(tracker));
        }
        Ok(status)
    }

    fn slot_mut(&mut self, tracker: TrackerId) -> Result<&mut TrackerStatus, MapperError> {
        self.slot(tracker)?;
        self.trackers
            .get_mut(tracker.index())
            .ok_or(MapperError::InvalidTracker(tracker))
    }
}

/// The canonical shared map and its tracker sessions.
pub struct MapperServer {
    config: MapperConfig,
    map: Arc<Map>,
    state: Mutex<ServerState>,
    login: Mutex<()>,
    observers: RwLock<Vec<Arc<dyn MapObserver>>>,

    /// Set by the background mapper around long optimizations.
    pause_requested: AtomicBool,

    /// Keyframe insertions waiting for or holding the map-update lock.
    /// A running optimization stops while this is non-zero.
    pending_inserts: AtomicUsize,
}

/// Counts an insertion as pending for as long as it is alive.
struct PendingInsert<'a>(&'a AtomicUsize);

impl<'a> PendingInsert<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingInsert<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MapperServer {
    pub fn new(config: MapperConfig) -> Self {
        let trackers = (0..config.max_trackers)
            .map(|t| TrackerStatus::new(TrackerId(t)))
            .collect();
        Self {
            config,
            map: Arc::new(Map::new()),
            state: Mutex::new(ServerState {
                trackers,
                initialized: false,
            }),
            login: Mutex::new(()),
            observers: RwLock::new(Vec::new()),
            pause_requested: AtomicBool::new(false),
            pending_inserts: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &MapperConfig {
        &self.config
    }

    /// Lease of the background mapper: map points only.
    pub fn local_mapper_lease(&self) -> IdentityLease {
        IdentityLease::local_mapper(self.config.max_trackers)
    }

    pub fn tracker_status(&self, tracker: TrackerId) -> Option<TrackerStatus> {
        self.state.lock().trackers.get(tracker.index()).cloned()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Observers
    // ─────────────────────────────────────────────────────────────────────────

    pub fn add_observer(&self, observer: Arc<dyn MapObserver>) {
        self.observers.write().push(observer);
    }

    /// Unregister by identity. Returns false if it was not registered.
    pub fn remove_observer(&self, observer: &Arc<dyn MapObserver>) -> bool {
        let target = Arc::as_ptr(observer).cast::<()>();
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|o| Arc::as_ptr(o).cast::<()>() != target);
        observers.len() != before
    }

    pub fn num_observers(&self) -> usize {
        self.observers.read().len()
    }

    fn observer_list(&self) -> Vec<Arc<dyn MapObserver>> {
        self.observers.read().clone()
    }

    /// Notify observers. Must be called without any lock held.
    fn publish(&self, event: &MapChangeEvent) {
        if event.is_empty() {
            return;
        }
        for observer in self.observer_list() {
            observer.handle_map_changed(event);
        }
    }

    /// Collect and publish every pending node change.
    pub fn publish_changes(&self) -> MapChangeEvent {
        let event = {
            let _update = self.map.update_lock();
            MapChangeEvent::collect_modified(&self.map)
        };
        self.publish(&event);
        event
    }

    /// Full map state as an event, for bootstrapping a new replica.
    ///
    /// Dirty flags are left untouched.
    pub fn snapshot_event(&self) -> MapChangeEvent {
        let snapshot = self.map.consistent_snapshot();
        let mut event = MapChangeEvent::new();
        for kf in snapshot.keyframes {
            event.record_keyframe(kf);
        }
        for mp in snapshot.map_points {
            event.record_map_point(mp);
        }
        event
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Back-pressure and optimization
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask trackers to stop inserting keyframes.
    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    pub fn release_pause(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    /// Run an optimization on the canonical map and publish its changes.
    ///
    /// The run is cancelled while a keyframe insertion is pending, including
    /// one that started waiting before the run took the map.
    pub fn run_optimization(
        &self,
        optimizer: &mut dyn Optimizer,
        scope: OptimizationScope,
    ) -> Option<OptimizationReport> {
        let should_stop = || self.pending_inserts.load(Ordering::SeqCst) > 0;
        let report = optimizer::run_optimization(&self.map, optimizer, scope, &should_stop);
        if let Some(report) = &report {
            self.publish(&report.changes);
        }
        report
    }

    /// Remove a keyframe from the canonical map and publish the deletion.
    ///
    /// Its point observations are detached, its covisibility edges dropped
    /// and its children handed to its parent. Returns false if the keyframe
    /// is not in the map.
    pub fn erase_keyframe(&self, id: KeyFrameId) -> Result<bool, MapperError> {
        let event = {
            let _update = self.map.update_lock();
            let Some(kf) = self.map.keyframe(id) else {
                return Ok(false);
            };
            if self.map.is_origin(id) {
                return Err(MapperError::OriginKeyFrame(id));
            }

            kf.set_bad();
            for (idx, _) in kf.map_point_indices() {
                self.map.disassociate(id, idx);
            }
            for other in kf.covisibility_weights().into_keys() {
                if let Some(other) = self.map.keyframe(other) {
                    other.erase_connection(id);
                }
            }
            if let Some(parent) = kf.parent().and_then(|p| self.map.keyframe(p)) {
                parent.erase_child(id);
                for child_id in kf.children() {
                    if let Some(child) = self.map.keyframe(child_id) {
                        child.set_parent(parent.id());
                        parent.add_child(child_id);
                    }
                }
            }

            self.map.erase_keyframe(id);
            MapChangeEvent::collect_modified(&self.map)
        };

        debug!("{} erased", id);
        self.publish(&event);
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Background mapper
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert points created by the background mapper.
    ///
    /// The points must come from the local-mapper lease and every observer
    /// must already be in the map. The observing keyframes' slots are linked
    /// to the new points.
    pub fn insert_mapper_points(&self, map_points: Vec<Arc<MapPoint>>) -> Result<(), MapperError> {
        if map_points.is_empty() {
            return Ok(());
        }
        let event = {
            let _update = self.map.update_lock();
            let state = self.state.lock();
            if !state.initialized {
                return Err(MapperError::NotInitialized);
            }
            self.validate_batch(MapPointOwner::LocalMapper, &[], &map_points)?;

            self.map.insert_batch(&[], &map_points)?;
            let touched = self.link_batch(&[], &map_points);
            for kf in touched {
                kf.update_connections(&self.map);
            }
            drop(state);
            MapChangeEvent::collect_modified(&self.map)
        };

        debug!("Inserted {} local mapper points", map_points.len());
        self.publish(&event);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Validation and linking
    // ─────────────────────────────────────────────────────────────────────────

    /// Check a batch against the map without modifying anything.
    fn validate_batch(
        &self,
        owner: MapPointOwner,
        keyframes: &[Arc<KeyFrame>],
        map_points: &[Arc<MapPoint>],
    ) -> Result<(), MapperError> {
        let max_trackers = self.config.max_trackers;

        let mut kf_ids = HashSet::new();
        for kf in keyframes {
            let id = kf.id();
            if id.is_null() {
                return Err(MapError::NullIdentifier.into());
            }
            match owner {
                MapPointOwner::Tracker(tracker) if keyframe_owner(id, max_trackers) == tracker => {}
                MapPointOwner::Tracker(tracker) => {
                    return Err(MapperError::ForeignKeyFrameId { owner: tracker, id })
                }
                MapPointOwner::LocalMapper => {
                    return Err(MapperError::ForeignKeyFrameId {
                        owner: keyframe_owner(id, max_trackers),
                        id,
                    })
                }
            }
            if self.map.contains_keyframe(id) || !kf_ids.insert(id) {
                return Err(MapperError::DuplicateKeyFrame(id));
            }
        }

        let mut mp_ids = HashSet::new();
        for mp in map_points {
            let id = mp.id();
            if id.is_null() {
                return Err(MapError::NullIdentifier.into());
            }
            if map_point_owner(id, max_trackers) != owner {
                return Err(MapperError::ForeignMapPointId(id));
            }
            if self.map.contains_map_point(id) || !mp_ids.insert(id) {
                return Err(MapperError::DuplicateMapPoint(id));
            }
        }

        for kf in keyframes {
            for (_, mp_id) in kf.map_point_indices() {
                if !mp_ids.contains(&mp_id) && !self.map.contains_map_point(mp_id) {
                    return Err(MapperError::UnresolvedMapPoint {
                        keyframe: kf.id(),
                        map_point: mp_id,
                    });
                }
            }
        }

        // Slots claimed by the new points, so two of them cannot take the
        // same feature.
        let mut claimed: HashMap<(KeyFrameId, usize), MapPointId> = HashMap::new();
        for mp in map_points {
            for (kf_id, idx) in mp.observations() {
                let kf = match keyframes.iter().find(|kf| kf.id() == kf_id) {
                    Some(kf) => Arc::clone(kf),
                    None => self.map.keyframe(kf_id).ok_or(MapperError::UnresolvedKeyFrame {
                        map_point: mp.id(),
                        keyframe: kf_id,
                    })?,
                };
                if idx >= kf.num_features() {
                    return Err(MapperError::ObservationOutOfRange {
                        map_point: mp.id(),
                        keyframe: kf_id,
                        index: idx,
                    });
                }
                let occupant = kf
                    .map_point(idx)
                    .or_else(|| claimed.get(&(kf_id, idx)).copied())
                    .filter(|occupant| *occupant != mp.id());
                if let Some(occupant) = occupant {
                    return Err(MapperError::SlotOccupied {
                        keyframe: kf_id,
                        index: idx,
                        occupant,
                    });
                }
                claimed.insert((kf_id, idx), mp.id());
            }
        }

        Ok(())
    }

    /// Complete both ends of every association in an inserted batch.
    ///
    /// Returns the existing keyframes whose slots changed.
    fn link_batch(&self, keyframes: &[Arc<KeyFrame>], map_points: &[Arc<MapPoint>]) -> Vec<Arc<KeyFrame>> {
        for kf in keyframes {
            for (idx, mp_id) in kf.map_point_indices() {
                if let Some(mp) = self.map.map_point(mp_id) {
                    mp.add_observation(kf, idx);
                }
            }
        }

        let batch: HashSet<KeyFrameId> = keyframes.iter().map(|kf| kf.id()).collect();
        let mut touched = Vec::new();
        for mp in map_points {
            for (kf_id, idx) in mp.observations() {
                let Some(kf) = self.map.keyframe(kf_id) else {
                    continue;
                };
                if kf.map_point(idx) != Some(mp.id()) {
                    kf.add_map_point(idx, mp.id());
                }
                if !batch.contains(&kf_id) && !touched.iter().any(|t: &Arc<KeyFrame>| t.id() == kf_id) {
                    touched.push(kf);
                }
            }
        }
        touched
    }
}

impl Mapper for MapperServer {
    fn map(&self) -> &Arc<Map> {
        &self.map
    }

    fn max_trackers(&self) -> u32 {
        self.config.max_trackers
    }

    fn login_tracker(&self, pivot: Pose) -> Result<TrackerLogin, MapperError> {
        let _login = self.login.lock();
        let mut state = self.state.lock();

        let (index, status) = state
            .trackers
            .iter_mut()
            .enumerate()
            .find(|(_, s)| !s.is_logged_in())
            .ok_or(MapperError::NoFreeSlot)?;

        status.state = SlotState::LoggedIn;
        status.pivot = Some(pivot);
        status.pose = None;

        let tracker = TrackerId(index as u32);
        let lease = IdentityLease::resume(
            status.next_keyframe_id,
            status.next_map_point_id,
            self.config.max_trackers,
        );
        info!(
            "{} logged in (next {} / {})",
            tracker, status.next_keyframe_id, status.next_map_point_id
        );

        Ok(TrackerLogin {
            tracker,
            lease,
            pivot,
        })
    }

    fn logout_tracker(&self, tracker: TrackerId) -> Result<(), MapperError> {
        let _login = self.login.lock();
        let mut state = self.state.lock();
        let status = state.slot_mut(tracker)?;
        status.state = SlotState::LoggedOut;
        status.pose = None;
        status.pivot = None;
        info!("{} logged out", tracker);
        Ok(())
    }

    fn initialize(
        &self,
        tracker: TrackerId,
        keyframes: Vec<Arc<KeyFrame>>,
        map_points: Vec<Arc<MapPoint>>,
    ) -> Result<(), MapperError> {
        let event = {
            let _update = self.map.update_lock();
            let mut state = self.state.lock();
            state.slot(tracker)?;
            if state.initialized {
                return Err(MapperError::AlreadyInitialized);
            }
            let Some(origin) = keyframes.first().map(|kf| kf.id()) else {
                return Err(MapperError::EmptyInitialization);
            };
            self.validate_batch(MapPointOwner::Tracker(tracker), &keyframes, &map_points)?;

            self.map.insert_batch(&keyframes, &map_points)?;
            self.map.add_keyframe_origin(origin);
            self.link_batch(&keyframes, &map_points);
            for kf in &keyframes {
                kf.update_connections(&self.map);
            }

            state.initialized = true;
            let max_trackers = self.config.max_trackers;
            let status = state.slot_mut(tracker)?;
            status.state = SlotState::Initialized;
            status.advance(&keyframes, &map_points, max_trackers);
            drop(state);

            MapChangeEvent::collect_modified(&self.map)
        };

        info!(
            "Map initialized by {}: {} keyframes, {} map points",
            tracker,
            keyframes.len(),
            map_points.len()
        );
        self.publish(&event);
        Ok(())
    }

    fn insert_keyframe(
        &self,
        tracker: TrackerId,
        keyframe: Arc<KeyFrame>,
        new_points: Vec<Arc<MapPoint>>,
    ) -> Result<(), MapperError> {
        self.state.lock().slot(tracker)?;
        if self.pause_requested() {
            debug!("{} rejected from {}: paused", keyframe.id(), tracker);
            return Err(MapperError::Paused);
        }

        let event = {
            let _pending = PendingInsert::new(&self.pending_inserts);
            let _update = self.map.update_lock();
            let mut state = self.state.lock();
            state.slot(tracker)?;
            if !state.initialized {
                return Err(MapperError::NotInitialized);
            }
            // A pause may have been requested while waiting for the map.
            if self.pause_requested() {
                debug!("{} rejected from {}: paused", keyframe.id(), tracker);
                return Err(MapperError::Paused);
            }
            let keyframes = [keyframe];
            self.validate_batch(MapPointOwner::Tracker(tracker), &keyframes, &new_points)?;

            self.map.insert_batch(&keyframes, &new_points)?;
            self.link_batch(&keyframes, &new_points);
            for kf in &keyframes {
                kf.update_connections(&self.map);
            }

            let max_trackers = self.config.max_trackers;
            let status = state.slot_mut(tracker)?;
            status.state = SlotState::Initialized;
            status.advance(&keyframes, &new_points, max_trackers);
            drop(state);

            MapChangeEvent::collect_modified(&self.map)
        };

        self.publish(&event);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    fn update_pose(&self, tracker: TrackerId, pose: Pose) -> Result<(), MapperError> {
        self.state.lock().slot_mut(tracker)?.pose = Some(pose);
        Ok(())
    }

    fn tracker_poses(&self) -> Vec<Option<Pose>> {
        self.state.lock().trackers.iter().map(|s| s.pose).collect()
    }

    fn tracker_pivots(&self) -> Vec<Option<Pose>> {
        self.state.lock().trackers.iter().map(|s| s.pivot).collect()
    }

    fn reset(&self) -> Result<(), MapperError> {
        {
            let _update = self.map.update_lock();
            let mut state = self.state.lock();
            self.map.clear();
            state.initialized = false;
            for status in &mut state.trackers {
                if status.state == SlotState::Initialized {
                    status.state = SlotState::LoggedIn;
                }
            }
        }

        info!("Map reset");
        for observer in self.observer_list() {
            observer.handle_reset();
        }
        Ok(())
    }
}

impl std::fmt::Debug for MapperServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapperServer")
            .field("config", &self.config)
            .field("map", &self.map)
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{KeyFrameData, KeyPoint};
    use crate::mapper::IdAllocator;
    use crate::optimizer::{OptimizationProblem, OptimizationResult};
    use nalgebra::Vector3;
    use std::thread;

    #[derive(Default)]
    struct RecordingObserver {
        resets: Mutex<usize>,
        events: Mutex<Vec<MapChangeEvent>>,
    }

    impl MapObserver for RecordingObserver {
        fn handle_reset(&self) {
            *self.resets.lock() += 1;
        }

        fn handle_map_changed(&self, event: &MapChangeEvent) {
            self.events.lock().push(event.clone());
        }
    }

    fn create_test_keyframe(id: KeyFrameId) -> Arc<KeyFrame> {
        Arc::new(KeyFrame::new(
            id,
            Pose::identity(),
            KeyFrameData::monocular(
                id.0 as f64,
                vec![KeyPoint::new(10.0, 20.0, 0); 8],
                Vec::new(),
                ScalePyramid::default(),
            ),
        ))
    }

    /// Keyframe with one new point in slot 0.
    fn keyframe_with_point(alloc: &IdAllocator) -> (Arc<KeyFrame>, Arc<MapPoint>) {
        let kf = create_test_keyframe(alloc.next_keyframe_id().unwrap());
        let mp_id = alloc.next_map_point_id();
        let mp = Arc::new(MapPoint::new(mp_id, Vector3::new(0.0, 0.0, 5.0), kf.id()));
        kf.add_map_point(0, mp_id);
        (kf, mp)
    }

    fn logged_in(server: &MapperServer) -> (TrackerId, IdAllocator) {
        let login = server.login_tracker(Pose::identity()).unwrap();
        (login.tracker, IdAllocator::new(login.lease))
    }

    fn initialized_server() -> (MapperServer, TrackerId, IdAllocator) {
        let server = MapperServer::new(MapperConfig::default());
        let (tracker, alloc) = logged_in(&server);
        let (kf, mp) = keyframe_with_point(&alloc);
        server.initialize(tracker, vec![kf], vec![mp]).unwrap();
        (server, tracker, alloc)
    }

    #[test]
    fn test_two_trackers_shard_keyframe_ids() {
        let (server, t0, alloc0) = initialized_server();
        let (t1, alloc1) = logged_in(&server);
        assert_eq!(t1, TrackerId(1));

        for _ in 0..4 {
            let (kf, mp) = keyframe_with_point(&alloc0);
            server.insert_keyframe(t0, kf, vec![mp]).unwrap();
        }
        for _ in 0..5 {
            let (kf, mp) = keyframe_with_point(&alloc1);
            server.insert_keyframe(t1, kf, vec![mp]).unwrap();
        }

        let ids_of = |tracker: TrackerId| -> Vec<u64> {
            server
                .map()
                .all_keyframes()
                .iter()
                .map(|kf| kf.id())
                .filter(|id| keyframe_owner(*id, 2) == tracker)
                .map(|id| id.0)
                .collect()
        };
        assert_eq!(ids_of(t0), vec![0, 2, 4, 6, 8]);
        assert_eq!(ids_of(t1), vec![1, 3, 5, 7, 9]);
        assert_eq!(server.map().map_points_in_map(), 10);

        let status = server.tracker_status(t1).unwrap();
        assert_eq!(status.state, SlotState::Initialized);
        assert_eq!(status.next_keyframe_id, KeyFrameId(11));
    }

    #[test]
    fn test_paused_insert_is_retryable() {
        let (server, tracker, alloc) = initialized_server();
        let before = (server.map().keyframes_in_map(), server.map().map_points_in_map());

        server.request_pause();
        assert!(!server.accept_keyframes());
        let (kf, mp) = keyframe_with_point(&alloc);
        let err = server
            .insert_keyframe(tracker, Arc::clone(&kf), vec![Arc::clone(&mp)])
            .unwrap_err();
        assert_eq!(err, MapperError::Paused);
        assert!(err.is_retryable());
        assert_eq!(
            (server.map().keyframes_in_map(), server.map().map_points_in_map()),
            before
        );

        server.release_pause();
        server.insert_keyframe(tracker, kf, vec![mp]).unwrap();
        assert_eq!(server.map().keyframes_in_map(), before.0 + 1);
    }

    #[test]
    fn test_no_free_slot_then_reuse() {
        let server = MapperServer::new(MapperConfig::default());
        let (t0, alloc0) = logged_in(&server);
        let (_t1, _) = logged_in(&server);

        let err = server.login_tracker(Pose::identity()).unwrap_err();
        assert_eq!(err, MapperError::NoFreeSlot);
        assert!(err.is_retryable());

        let (kf, mp) = keyframe_with_point(&alloc0);
        server.initialize(t0, vec![kf], vec![mp]).unwrap();
        server.logout_tracker(t0).unwrap();
        assert_eq!(server.logout_tracker(t0), Err(MapperError::NotLoggedIn(t0)));

        // The freed slot continues its identifier sequence.
        let login = server.login_tracker(Pose::identity()).unwrap();
        assert_eq!(login.tracker, t0);
        let alloc = IdAllocator::new(login.lease);
        assert_eq!(alloc.next_keyframe_id(), Some(KeyFrameId(2)));
        assert_eq!(alloc.next_map_point_id(), MapPointId(3));
    }

    #[test]
    fn test_initialization_rules() {
        let server = MapperServer::new(MapperConfig::default());
        let (tracker, alloc) = logged_in(&server);

        let (kf, mp) = keyframe_with_point(&alloc);
        assert_eq!(
            server.insert_keyframe(tracker, Arc::clone(&kf), vec![Arc::clone(&mp)]),
            Err(MapperError::NotInitialized)
        );
        assert_eq!(
            server.initialize(tracker, Vec::new(), Vec::new()),
            Err(MapperError::EmptyInitialization)
        );

        server.initialize(tracker, vec![kf], vec![mp]).unwrap();
        assert!(server.is_initialized());
        assert_eq!(server.map().keyframe_origins(), vec![KeyFrameId(0)]);

        let (kf, mp) = keyframe_with_point(&alloc);
        assert_eq!(
            server.initialize(tracker, vec![kf], vec![mp]),
            Err(MapperError::AlreadyInitialized)
        );
        assert_eq!(
            server.initialize(TrackerId(1), Vec::new(), Vec::new()),
            Err(MapperError::NotLoggedIn(TrackerId(1)))
        );
        assert_eq!(
            server.update_pose(TrackerId(7), Pose::identity()),
            Err(MapperError::InvalidTracker(TrackerId(7)))
        );
    }

    #[test]
    fn test_rejected_batches_leave_map_unchanged() {
        let (server, tracker, alloc) = initialized_server();
        let counts = || (server.map().keyframes_in_map(), server.map().map_points_in_map());
        let before = counts();

        // Keyframe id from the other tracker's residue.
        let foreign = create_test_keyframe(KeyFrameId(3));
        assert_eq!(
            server.insert_keyframe(tracker, foreign, Vec::new()),
            Err(MapperError::ForeignKeyFrameId {
                owner: tracker,
                id: KeyFrameId(3)
            })
        );

        // Slot pointing at a point that is neither new nor known.
        let kf = create_test_keyframe(alloc.next_keyframe_id().unwrap());
        kf.add_map_point(1, MapPointId(99));
        assert_eq!(
            server.insert_keyframe(tracker, Arc::clone(&kf), Vec::new()),
            Err(MapperError::UnresolvedMapPoint {
                keyframe: kf.id(),
                map_point: MapPointId(99)
            })
        );

        // Point id from the local-mapper residue.
        let kf = create_test_keyframe(alloc.next_keyframe_id().unwrap());
        let mp = Arc::new(MapPoint::new(MapPointId(2), Vector3::zeros(), kf.id()));
        assert_eq!(
            server.insert_keyframe(tracker, kf, vec![mp]),
            Err(MapperError::ForeignMapPointId(MapPointId(2)))
        );

        // Re-inserting the origin.
        let dup = create_test_keyframe(KeyFrameId(0));
        assert_eq!(
            server.insert_keyframe(tracker, dup, Vec::new()),
            Err(MapperError::DuplicateKeyFrame(KeyFrameId(0)))
        );

        assert_eq!(counts(), before);
    }

    #[test]
    fn test_insert_links_existing_points() {
        let (server, tracker, alloc) = initialized_server();
        let origin_point = MapPointId(0);

        let kf = create_test_keyframe(alloc.next_keyframe_id().unwrap());
        kf.add_map_point(3, origin_point);
        server.insert_keyframe(tracker, Arc::clone(&kf), Vec::new()).unwrap();

        let mp = server.map().map_point(origin_point).unwrap();
        assert_eq!(mp.index_in_keyframe(kf.id()), Some(3));
        assert_eq!(mp.num_observers(), 2);
        assert_eq!(kf.connection_weight(KeyFrameId(0)), 1);
        assert_eq!(kf.parent(), Some(KeyFrameId(0)));
    }

    #[test]
    fn test_local_mapper_points() {
        let (server, _tracker, _alloc) = initialized_server();
        let mapper = IdAllocator::new(server.local_mapper_lease());

        let mp = Arc::new(MapPoint::new(
            mapper.next_map_point_id(),
            Vector3::new(1.0, 0.0, 4.0),
            KeyFrameId(0),
        ));
        let origin = server.map().keyframe(KeyFrameId(0)).unwrap();
        mp.add_observation(&origin, 5);
        server.insert_mapper_points(vec![Arc::clone(&mp)]).unwrap();

        assert_eq!(mp.id(), MapPointId(2));
        assert_eq!(origin.map_point(5), Some(mp.id()));

        let tracker_point = Arc::new(MapPoint::new(MapPointId(4), Vector3::zeros(), KeyFrameId(0)));
        assert_eq!(
            server.insert_mapper_points(vec![tracker_point]),
            Err(MapperError::ForeignMapPointId(MapPointId(4)))
        );
    }

    #[test]
    fn test_observers_see_changes_and_reset() {
        let server = MapperServer::new(MapperConfig::default());
        let observer = Arc::new(RecordingObserver::default());
        let handle: Arc<dyn MapObserver> = observer.clone();
        server.add_observer(Arc::clone(&handle));

        let (tracker, alloc) = logged_in(&server);
        let (kf, mp) = keyframe_with_point(&alloc);
        server.initialize(tracker, vec![Arc::clone(&kf)], vec![mp]).unwrap();

        {
            let events = observer.events.lock();
            assert_eq!(events.len(), 1);
            assert!(events[0].updated_keyframes.contains_key(&kf.id()));
            assert_eq!(events[0].updated_map_points.len(), 1);
        }

        server.update_pose(tracker, Pose::translation(1.0, 0.0, 0.0)).unwrap();
        assert_eq!(
            server.tracker_poses()[0],
            Some(Pose::translation(1.0, 0.0, 0.0))
        );
        assert_eq!(server.tracker_pivots(), vec![Some(Pose::identity()), None]);

        server.reset().unwrap();
        assert_eq!(*observer.resets.lock(), 1);
        assert!(!server.is_initialized());
        assert_eq!(server.map().keyframes_in_map(), 0);
        assert_eq!(
            server.tracker_status(tracker).unwrap().state,
            SlotState::LoggedIn
        );

        assert!(server.remove_observer(&handle));
        assert!(!server.remove_observer(&handle));
    }

    #[test]
    fn test_optimization_publishes_changes() {
        struct Lift;

        impl Optimizer for Lift {
            fn optimize(
                &mut self,
                problem: &OptimizationProblem,
                _should_stop: &dyn Fn() -> bool,
            ) -> Option<OptimizationResult> {
                Some(OptimizationResult {
                    points: problem
                        .map_points
                        .iter()
                        .map(|p| (p.id, p.position + Vector3::new(0.0, 0.0, 1.0)))
                        .collect(),
                    iterations: 3,
                    ..Default::default()
                })
            }
        }

        let (server, _tracker, _alloc) = initialized_server();
        let observer = Arc::new(RecordingObserver::default());
        server.add_observer(observer.clone());

        let report = server
            .run_optimization(&mut Lift, OptimizationScope::Global)
            .unwrap();
        assert_eq!(report.iterations, 3);
        assert_eq!(
            server.map().map_point(MapPointId(0)).unwrap().world_pos(),
            Vector3::new(0.0, 0.0, 6.0)
        );

        let events = observer.events.lock();
        assert_eq!(events.len(), 1);
        assert!(events[0].updated_map_points.contains_key(&MapPointId(0)));
    }

    #[test]
    fn test_pause_requested_while_waiting_for_map() {
        let (server, tracker, alloc) = initialized_server();
        let (kf, mp) = keyframe_with_point(&alloc);

        let result = thread::scope(|s| {
            let update = server.map().update_lock();
            let insert = s.spawn(|| server.insert_keyframe(tracker, kf, vec![mp]));
            // Past the first pause check and blocked on the map.
            while server.pending_inserts.load(Ordering::SeqCst) == 0 {
                thread::yield_now();
            }
            server.request_pause();
            drop(update);
            insert.join().unwrap()
        });

        assert_eq!(result, Err(MapperError::Paused));
        assert_eq!(server.map().keyframes_in_map(), 1);
        assert_eq!(server.map().map_points_in_map(), 1);
        assert_eq!(server.pending_inserts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_insert_cancels_running_optimization() {
        /// Spins until told to stop, after announcing that it holds the map.
        struct Spin<'a> {
            started: &'a AtomicBool,
        }

        impl Optimizer for Spin<'_> {
            fn optimize(
                &mut self,
                _problem: &OptimizationProblem,
                should_stop: &dyn Fn() -> bool,
            ) -> Option<OptimizationResult> {
                self.started.store(true, Ordering::SeqCst);
                while !should_stop() {
                    thread::yield_now();
                }
                None
            }
        }

        let (server, tracker, alloc) = initialized_server();
        let started = AtomicBool::new(false);
        let (kf, mp) = keyframe_with_point(&alloc);

        let (report, inserted) = thread::scope(|s| {
            let run = s.spawn(|| {
                let mut optimizer = Spin { started: &started };
                server.run_optimization(&mut optimizer, OptimizationScope::Global)
            });
            while !started.load(Ordering::SeqCst) {
                thread::yield_now();
            }
            let inserted = server.insert_keyframe(tracker, kf, vec![mp]);
            (run.join().unwrap(), inserted)
        });

        assert!(report.is_none());
        assert_eq!(inserted, Ok(()));
        assert_eq!(server.map().keyframes_in_map(), 2);
    }

    #[test]
    fn test_conflicting_observations_rejected() {
        let (server, tracker, alloc) = initialized_server();
        let mapper = IdAllocator::new(server.local_mapper_lease());
        let origin = server.map().keyframe(KeyFrameId(0)).unwrap();
        let counts = || (server.map().keyframes_in_map(), server.map().map_points_in_map());
        let before = counts();

        // Slot 0 of the origin already holds point 0.
        let mp = Arc::new(MapPoint::new(mapper.next_map_point_id(), Vector3::zeros(), origin.id()));
        mp.add_observation(&origin, 0);
        assert_eq!(
            server.insert_mapper_points(vec![mp]),
            Err(MapperError::SlotOccupied {
                keyframe: origin.id(),
                index: 0,
                occupant: MapPointId(0)
            })
        );

        // The origin has 8 features.
        let mp = Arc::new(MapPoint::new(mapper.next_map_point_id(), Vector3::zeros(), origin.id()));
        mp.add_observation(&origin, 8);
        assert_eq!(
            server.insert_mapper_points(vec![Arc::clone(&mp)]),
            Err(MapperError::ObservationOutOfRange {
                map_point: mp.id(),
                keyframe: origin.id(),
                index: 8
            })
        );

        // Two new points of one batch claiming the same feature.
        let first = Arc::new(MapPoint::new(mapper.next_map_point_id(), Vector3::zeros(), origin.id()));
        let second = Arc::new(MapPoint::new(mapper.next_map_point_id(), Vector3::zeros(), origin.id()));
        first.add_observation(&origin, 6);
        second.add_observation(&origin, 6);
        assert_eq!(
            server.insert_mapper_points(vec![Arc::clone(&first), second]),
            Err(MapperError::SlotOccupied {
                keyframe: origin.id(),
                index: 6,
                occupant: first.id()
            })
        );

        // A tracker point stealing a feature of an existing keyframe.
        let (kf, mp) = keyframe_with_point(&alloc);
        mp.add_observation(&origin, 0);
        assert!(matches!(
            server.insert_keyframe(tracker, kf, vec![mp]),
            Err(MapperError::SlotOccupied { .. })
        ));

        assert_eq!(counts(), before);
        assert_eq!(origin.map_point(0), Some(MapPointId(0)));
        assert_eq!(origin.map_point(6), None);
        assert_eq!(server.map().map_point(MapPointId(0)).unwrap().num_observers(), 1);
    }

    #[test]
    fn test_erase_keyframe_publishes_deletion() {
        let (server, tracker, alloc) = initialized_server();
        let observer = Arc::new(RecordingObserver::default());
        server.add_observer(observer.clone());

        let (kf, mp) = keyframe_with_point(&alloc);
        kf.add_map_point(1, MapPointId(0));
        server.insert_keyframe(tracker, Arc::clone(&kf), vec![mp]).unwrap();
        let origin = server.map().keyframe(KeyFrameId(0)).unwrap();
        assert!(origin.children().contains(&kf.id()));

        assert_eq!(
            server.erase_keyframe(KeyFrameId(0)),
            Err(MapperError::OriginKeyFrame(KeyFrameId(0)))
        );
        assert_eq!(server.erase_keyframe(kf.id()), Ok(true));
        assert_eq!(server.erase_keyframe(kf.id()), Ok(false));

        assert!(!server.map().contains_keyframe(kf.id()));
        assert!(kf.is_bad());
        assert!(!origin.children().contains(&kf.id()));
        assert_eq!(origin.connection_weight(kf.id()), 0);
        let shared = server.map().map_point(MapPointId(0)).unwrap();
        assert_eq!(shared.index_in_keyframe(kf.id()), None);

        let events = observer.events.lock();
        let last = events.last().unwrap();
        assert!(last.deleted_keyframes.contains(&kf.id()));
        assert!(last.updated_keyframes.contains_key(&KeyFrameId(0)));
    }

    #[test]
    fn test_parallel_inserts_from_two_trackers() {
        const PER_TRACKER: u64 = 12;
        let (server, t0, alloc0) = initialized_server();
        let (t1, alloc1) = logged_in(&server);

        thread::scope(|s| {
            for (tracker, alloc) in [(t0, &alloc0), (t1, &alloc1)] {
                let server = &server;
                s.spawn(move || {
                    for _ in 0..PER_TRACKER {
                        let (kf, mp) = keyframe_with_point(alloc);
                        // Every keyframe also sees the origin's point.
                        kf.add_map_point(1, MapPointId(0));
                        server.insert_keyframe(tracker, kf, vec![mp]).unwrap();
                    }
                });
            }
        });

        let map = server.map();
        let ids_of = |tracker: TrackerId| -> Vec<u64> {
            map.all_keyframes()
                .iter()
                .map(|kf| kf.id())
                .filter(|id| keyframe_owner(*id, 2) == tracker)
                .map(|id| id.0)
                .collect()
        };
        let expected_t0: Vec<u64> = (0..=PER_TRACKER).map(|i| 2 * i).collect();
        let expected_t1: Vec<u64> = (0..PER_TRACKER).map(|i| 2 * i + 1).collect();
        assert_eq!(ids_of(t0), expected_t0);
        assert_eq!(ids_of(t1), expected_t1);
        assert_eq!(map.map_points_in_map() as u64, 1 + 2 * PER_TRACKER);
        assert_eq!(
            map.map_point(MapPointId(0)).unwrap().num_observers() as u64,
            1 + 2 * PER_TRACKER
        );

        // Both ends of every association agree.
        for mp in map.all_map_points() {
            for (kf_id, idx) in mp.observations() {
                let kf = map.keyframe(kf_id).unwrap();
                assert_eq!(kf.map_point(idx), Some(mp.id()), "{} in {}", mp.id(), kf_id);
            }
        }
        for kf in map.all_keyframes() {
            for (idx, mp_id) in kf.map_point_indices() {
                let mp = map.map_point(mp_id).unwrap();
                assert_eq!(mp.index_in_keyframe(kf.id()), Some(idx), "{} in {}", mp_id, kf.id());
            }
            if kf.id() != KeyFrameId(0) {
                assert!(kf.parent().is_some());
            }
        }

        assert_eq!(
            server.tracker_status(t1).unwrap().next_keyframe_id,
            KeyFrameId(2 * PER_TRACKER + 1)
        );
    }
}
