//! MapperClient - Tracker-side facade over a [`MapperServer`].
//!
//! Mutating calls are forwarded to the server. The client registers an
//! observer that serializes every published event and queues the bytes on a
//! channel; [`MapperClient::sync`] applies the queue to a local replica. The
//! replica therefore trails the server until the next sync, and every
//! forwarded mutating call syncs before returning.

use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::map::{KeyFrame, Map, MapPoint, Pose, TrackerId};
use crate::protocol::{MapChangeEvent, UnknownKeyFramePolicy};

use super::error::MapperError;
use super::observer::MapObserver;
use super::server::{MapperServer, TrackerLogin};
use super::Mapper;

/// Message queued from the server to a client.
#[derive(Debug, Clone)]
pub enum Notification {
    Reset,
    /// A serialized [`MapChangeEvent`].
    Changed(Bytes),
}

/// Server-side end of a client's queue.
///
/// Events carry node handles and are serialized on the publishing thread.
/// Serializing and enqueueing happen under `order`, so a frame that read
/// newer node state is never queued ahead of one that read older state.
struct ClientLink {
    sender: Sender<Notification>,
    max_trackers: u32,
    order: Mutex<()>,
}

impl ClientLink {
    /// Caller holds `order`.
    fn send(&self, notification: Notification) {
        if self.sender.send(notification).is_err() {
            debug!("Client queue closed, dropping notification");
        }
    }

    fn send_event(&self, event: &MapChangeEvent) {
        self.send(Notification::Changed(event.to_bytes(self.max_trackers)));
    }
}

impl MapObserver for ClientLink {
    fn handle_reset(&self) {
        let _order = self.order.lock();
        self.send(Notification::Reset);
    }

    fn handle_map_changed(&self, event: &MapChangeEvent) {
        let _order = self.order.lock();
        self.send_event(event);
    }
}

pub struct MapperClient {
    server: Arc<MapperServer>,
    replica: Arc<Map>,
    link: Arc<ClientLink>,
    receiver: Receiver<Notification>,

    /// Serializes queue draining so frames are applied in order.
    apply: Mutex<()>,
}

impl MapperClient {
    /// Connect to `server` and bootstrap the replica from its current state.
    pub fn new(server: Arc<MapperServer>) -> Result<Self, MapperError> {
        let (sender, receiver) = unbounded();
        let link = Arc::new(ClientLink {
            sender,
            max_trackers: server.max_trackers(),
            order: Mutex::new(()),
        });

        // Register before taking the snapshot so nothing published in
        // between is missed. Holding the link's lock until the snapshot is
        // queued keeps those publications behind it.
        {
            let _order = link.order.lock();
            server.add_observer(Arc::clone(&link) as Arc<dyn MapObserver>);
            let snapshot = server.snapshot_event();
            if !snapshot.is_empty() {
                link.send_event(&snapshot);
            }
        }

        let client = Self {
            server,
            replica: Arc::new(Map::new()),
            link,
            receiver,
            apply: Mutex::new(()),
        };
        client.sync()?;
        Ok(client)
    }

    pub fn server(&self) -> &Arc<MapperServer> {
        &self.server
    }

    /// Number of notifications waiting to be applied.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Apply every queued notification to the replica.
    ///
    /// Returns the number of notifications applied.
    pub fn sync(&self) -> Result<usize, MapperError> {
        let _apply = self.apply.lock();
        let max_trackers = self.server.max_trackers();
        let mut applied = 0;

        for notification in self.receiver.try_iter() {
            match notification {
                Notification::Reset => {
                    self.replica.clear();
                    debug!("Replica cleared");
                }
                Notification::Changed(bytes) => {
                    let len = bytes.len();
                    let event = MapChangeEvent::read_bytes(
                        bytes,
                        &self.replica,
                        max_trackers,
                        UnknownKeyFramePolicy::Placeholder,
                    )
                    .map_err(|e| {
                        warn!("Failed to apply map change ({} bytes): {}", len, e);
                        e
                    })?;
                    debug!(
                        "Replica applied {} keyframes, {} map points, {} deletions ({} bytes)",
                        event.updated_keyframes.len(),
                        event.updated_map_points.len(),
                        event.deleted_keyframes.len(),
                        len
                    );
                }
            }
            applied += 1;
        }
        Ok(applied)
    }
}

impl Mapper for MapperClient {
    fn map(&self) -> &Arc<Map> {
        &self.replica
    }

    fn max_trackers(&self) -> u32 {
        self.server.max_trackers()
    }

    fn login_tracker(&self, pivot: Pose) -> Result<TrackerLogin, MapperError> {
        self.server.login_tracker(pivot)
    }

    fn logout_tracker(&self, tracker: TrackerId) -> Result<(), MapperError> {
        self.server.logout_tracker(tracker)
    }

    fn initialize(
        &self,
        tracker: TrackerId,
        keyframes: Vec<Arc<KeyFrame>>,
        map_points: Vec<Arc<MapPoint>>,
    ) -> Result<(), MapperError> {
        self.server.initialize(tracker, keyframes, map_points)?;
        self.sync()?;
        Ok(())
    }

    fn insert_keyframe(
        &self,
        tracker: TrackerId,
        keyframe: Arc<KeyFrame>,
        new_points: Vec<Arc<MapPoint>>,
    ) -> Result<(), MapperError> {
        self.server.insert_keyframe(tracker, keyframe, new_points)?;
        self.sync()?;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.server.is_initialized()
    }

    fn pause_requested(&self) -> bool {
        self.server.pause_requested()
    }

    fn update_pose(&self, tracker: TrackerId, pose: Pose) -> Result<(), MapperError> {
        self.server.update_pose(tracker, pose)
    }

    fn tracker_poses(&self) -> Vec<Option<Pose>> {
        self.server.tracker_poses()
    }

    fn tracker_pivots(&self) -> Vec<Option<Pose>> {
        self.server.tracker_pivots()
    }

    fn reset(&self) -> Result<(), MapperError> {
        self.server.reset()?;
        self.sync()?;
        Ok(())
    }
}

impl Drop for MapperClient {
    fn drop(&mut self) {
        let link: Arc<dyn MapObserver> = self.link.clone();
        self.server.remove_observer(&link);
    }
}

impl std::fmt::Debug for MapperClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapperClient")
            .field("replica", &self.replica)
            .field("pending", &self.receiver.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{KeyFrameData, KeyFrameId, KeyPoint, MapPointId, ScalePyramid};
    use crate::mapper::{IdAllocator, MapperConfig};
    use nalgebra::Vector3;

    fn create_test_keyframe(id: KeyFrameId) -> Arc<KeyFrame> {
        Arc::new(KeyFrame::new(
            id,
            Pose::translation(0.0, 0.0, -(id.0 as f64)),
            KeyFrameData::monocular(
                id.0 as f64 * 0.05,
                vec![KeyPoint::new(1.0, 2.0, 1); 4],
                Vec::new(),
                ScalePyramid::default(),
            ),
        ))
    }

    fn keyframe_with_point(alloc: &IdAllocator) -> (Arc<KeyFrame>, Arc<MapPoint>) {
        let kf = create_test_keyframe(alloc.next_keyframe_id().unwrap());
        let mp = Arc::new(MapPoint::new(
            alloc.next_map_point_id(),
            Vector3::new(1.0, 1.0, 3.0),
            kf.id(),
        ));
        kf.add_map_point(0, mp.id());
        (kf, mp)
    }

    #[test]
    fn test_replica_follows_server() {
        let server = Arc::new(MapperServer::new(MapperConfig::default()));
        let a = MapperClient::new(Arc::clone(&server)).unwrap();
        let b = MapperClient::new(Arc::clone(&server)).unwrap();
        assert_eq!(server.num_observers(), 2);

        let login = a.login_tracker(Pose::identity()).unwrap();
        let alloc = IdAllocator::new(login.lease);
        let (kf, mp) = keyframe_with_point(&alloc);
        a.initialize(login.tracker, vec![kf], vec![mp]).unwrap();

        // Shares point 0 with the origin.
        let (kf, mp) = keyframe_with_point(&alloc);
        kf.add_map_point(1, MapPointId(0));
        a.insert_keyframe(login.tracker, kf, vec![mp]).unwrap();

        // `a` synced on return, `b` has the frames queued.
        assert_eq!(a.map().keyframes_in_map(), 2);
        assert_eq!(b.pending(), 2);
        assert_eq!(b.sync().unwrap(), 2);

        for client in [&a, &b] {
            let replica = client.map();
            assert_eq!(replica.map_points_in_map(), 2);
            let kf = replica.keyframe(KeyFrameId(2)).unwrap();
            assert!(!kf.is_placeholder());
            assert_eq!(kf.map_point(1), Some(MapPointId(0)));
            assert_eq!(kf.parent(), Some(KeyFrameId(0)));

            let shared = replica.map_point(MapPointId(0)).unwrap();
            let original = server.map().map_point(MapPointId(0)).unwrap();
            assert_eq!(shared.observations(), original.observations());
            assert_eq!(shared.world_pos(), original.world_pos());
        }
    }

    #[test]
    fn test_late_client_bootstraps_from_snapshot() {
        let server = Arc::new(MapperServer::new(MapperConfig::default()));
        let login = server.login_tracker(Pose::identity()).unwrap();
        let alloc = IdAllocator::new(login.lease);
        let (kf, mp) = keyframe_with_point(&alloc);
        server.initialize(login.tracker, vec![kf], vec![mp]).unwrap();

        let client = MapperClient::new(Arc::clone(&server)).unwrap();
        assert_eq!(client.map().keyframes_in_map(), 1);
        assert_eq!(client.map().map_points_in_map(), 1);
        assert!(client.is_initialized());
    }

    #[test]
    fn test_reset_clears_replica() {
        let server = Arc::new(MapperServer::new(MapperConfig::default()));
        let client = MapperClient::new(Arc::clone(&server)).unwrap();

        let login = client.login_tracker(Pose::identity()).unwrap();
        let alloc = IdAllocator::new(login.lease);
        let (kf, mp) = keyframe_with_point(&alloc);
        client.initialize(login.tracker, vec![kf], vec![mp]).unwrap();
        assert_eq!(client.map().keyframes_in_map(), 1);

        client.reset().unwrap();
        assert_eq!(client.map().keyframes_in_map(), 0);
        assert_eq!(client.map().map_points_in_map(), 0);
        assert!(!client.is_initialized());
    }

    #[test]
    fn test_drop_unregisters() {
        let server = Arc::new(MapperServer::new(MapperConfig::default()));
        let client = MapperClient::new(Arc::clone(&server)).unwrap();
        assert_eq!(server.num_observers(), 1);
        drop(client);
        assert_eq!(server.num_observers(), 0);
    }

    #[test]
    fn test_back_pressure_passes_through() {
        let server = Arc::new(MapperServer::new(MapperConfig::default()));
        let client = MapperClient::new(Arc::clone(&server)).unwrap();
        let login = client.login_tracker(Pose::identity()).unwrap();
        let alloc = IdAllocator::new(login.lease);
        let (kf, mp) = keyframe_with_point(&alloc);
        client.initialize(login.tracker, vec![kf], vec![mp]).unwrap();

        server.request_pause();
        assert!(!client.accept_keyframes());
        let (kf, mp) = keyframe_with_point(&alloc);
        let err = client.insert_keyframe(login.tracker, kf, vec![mp]).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(client.map().keyframes_in_map(), 1);
    }

    #[test]
    fn test_replica_converges_under_concurrent_inserts() {
        let server = Arc::new(MapperServer::new(MapperConfig::default()));
        let client = MapperClient::new(Arc::clone(&server)).unwrap();
        let first = client.login_tracker(Pose::identity()).unwrap();
        let second = client.login_tracker(Pose::identity()).unwrap();
        let alloc0 = IdAllocator::new(first.lease);
        let alloc1 = IdAllocator::new(second.lease);
        let (kf, mp) = keyframe_with_point(&alloc0);
        client.initialize(first.tracker, vec![kf], vec![mp]).unwrap();

        std::thread::scope(|s| {
            for (tracker, alloc) in [(first.tracker, &alloc0), (second.tracker, &alloc1)] {
                let server = &server;
                s.spawn(move || {
                    for _ in 0..10 {
                        // Every insert also rewrites the shared point 0.
                        let (kf, mp) = keyframe_with_point(alloc);
                        kf.add_map_point(1, MapPointId(0));
                        server.insert_keyframe(tracker, kf, vec![mp]).unwrap();
                    }
                });
            }
            s.spawn(|| {
                for _ in 0..20 {
                    client.sync().unwrap();
                    std::thread::yield_now();
                }
            });
        });
        client.sync().unwrap();

        let replica = client.map();
        assert_eq!(replica.keyframes_in_map(), 21);
        assert_eq!(replica.map_points_in_map(), server.map().map_points_in_map());
        for kf in server.map().all_keyframes() {
            let copy = replica.keyframe(kf.id()).unwrap();
            assert_eq!(copy.map_point_matches(), kf.map_point_matches(), "{}", kf.id());
            assert_eq!(copy.parent(), kf.parent(), "{}", kf.id());
        }
        for mp in server.map().all_map_points() {
            let copy = replica.map_point(mp.id()).unwrap();
            assert_eq!(copy.observations(), mp.observations(), "{}", mp.id());
            assert_eq!(copy.world_pos(), mp.world_pos(), "{}", mp.id());
        }
    }

    #[test]
    fn test_erasure_reaches_replica() {
        let server = Arc::new(MapperServer::new(MapperConfig::default()));
        let client = MapperClient::new(Arc::clone(&server)).unwrap();
        let login = client.login_tracker(Pose::identity()).unwrap();
        let alloc = IdAllocator::new(login.lease);
        let (kf, mp) = keyframe_with_point(&alloc);
        client.initialize(login.tracker, vec![kf], vec![mp]).unwrap();
        let (kf, mp) = keyframe_with_point(&alloc);
        kf.add_map_point(1, MapPointId(0));
        client.insert_keyframe(login.tracker, Arc::clone(&kf), vec![mp]).unwrap();
        assert!(client.map().contains_keyframe(kf.id()));

        assert!(server.erase_keyframe(kf.id()).unwrap());
        assert_eq!(client.sync().unwrap(), 1);

        let replica = client.map();
        assert!(!replica.contains_keyframe(kf.id()));
        let origin = replica.keyframe(KeyFrameId(0)).unwrap();
        assert!(origin.children().is_empty());
        assert_eq!(
            replica.map_point(MapPointId(0)).unwrap().index_in_keyframe(kf.id()),
            None
        );
    }
}
