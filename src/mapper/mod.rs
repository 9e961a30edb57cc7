//! Mapper session layer.
//!
//! [`MapperServer`] owns the canonical map; each tracker talks to it through
//! a [`MapperClient`] that keeps a replica in sync. Both implement
//! [`Mapper`], so tracking code does not care which side it holds.

pub mod client;
pub mod error;
pub mod identity;
pub mod observer;
pub mod server;

use std::sync::Arc;

use crate::map::{KeyFrame, Map, MapPoint, Pose, TrackerId};

pub use client::{MapperClient, Notification};
pub use error::MapperError;
pub use identity::{IdAllocator, IdSequence, IdentityLease, MapPointOwner};
pub use observer::MapObserver;
pub use server::{MapperConfig, MapperServer, SlotState, TrackerLogin, TrackerStatus};

/// Operations shared by the server and its clients.
pub trait Mapper: Send + Sync {
    /// The map this side reads from: canonical on the server, the replica
    /// on a client.
    fn map(&self) -> &Arc<Map>;

    fn max_trackers(&self) -> u32;

    /// Claim a free tracker slot. Fails with [`MapperError::NoFreeSlot`]
    /// (retryable) when every slot is taken.
    fn login_tracker(&self, pivot: Pose) -> Result<TrackerLogin, MapperError>;

    fn logout_tracker(&self, tracker: TrackerId) -> Result<(), MapperError>;

    /// Seed the empty map. The first keyframe becomes a keyframe origin.
    fn initialize(
        &self,
        tracker: TrackerId,
        keyframes: Vec<Arc<KeyFrame>>,
        map_points: Vec<Arc<MapPoint>>,
    ) -> Result<(), MapperError>;

    /// Add a keyframe together with the points it created, all or nothing.
    ///
    /// Ownership of the nodes passes to the map. Fails with the retryable
    /// [`MapperError::Paused`] while the background mapper holds a pause.
    fn insert_keyframe(
        &self,
        tracker: TrackerId,
        keyframe: Arc<KeyFrame>,
        new_points: Vec<Arc<MapPoint>>,
    ) -> Result<(), MapperError>;

    fn is_initialized(&self) -> bool;

    fn pause_requested(&self) -> bool;

    /// Whether a keyframe inserted now would be accepted.
    fn accept_keyframes(&self) -> bool {
        !self.pause_requested()
    }

    fn update_pose(&self, tracker: TrackerId, pose: Pose) -> Result<(), MapperError>;

    /// Latest pose per slot, None for slots without a reported pose.
    fn tracker_poses(&self) -> Vec<Option<Pose>>;

    /// Pivot calibration per slot, None for free slots.
    fn tracker_pivots(&self) -> Vec<Option<Pose>>;

    /// Drop the whole map and return to the uninitialized state.
    fn reset(&self) -> Result<(), MapperError>;
}
