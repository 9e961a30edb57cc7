//! Identifier sharding.
//!
//! Every tracker slot `t` owns a residue class of each identifier space:
//! KeyFrames `t, t + K, t + 2K, ...` with `K = max_trackers` and MapPoints
//! `t, t + M, t + 2M, ...` with `M = max_trackers + 1`. Residue
//! `max_trackers` of the MapPoint space belongs to the local mapper, which
//! creates points but never KeyFrames. Residue classes are disjoint, so ids
//! are allocated without any coordination between trackers.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::map::{KeyFrameId, MapPointId, TrackerId};

/// Step between consecutive KeyFrame ids of one tracker.
pub fn keyframe_id_span(max_trackers: u32) -> u64 {
    u64::from(max_trackers)
}

/// Step between consecutive MapPoint ids of one tracker or the local mapper.
pub fn map_point_id_span(max_trackers: u32) -> u64 {
    u64::from(max_trackers) + 1
}

/// Owner of a MapPoint id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapPointOwner {
    Tracker(TrackerId),
    LocalMapper,
}

pub fn keyframe_owner(id: KeyFrameId, max_trackers: u32) -> TrackerId {
    TrackerId((id.0 % keyframe_id_span(max_trackers)) as u32)
}

pub fn map_point_owner(id: MapPointId, max_trackers: u32) -> MapPointOwner {
    let residue = id.0 % map_point_id_span(max_trackers);
    if residue == u64::from(max_trackers) {
        MapPointOwner::LocalMapper
    } else {
        MapPointOwner::Tracker(TrackerId(residue as u32))
    }
}

/// Arithmetic sequence `first, first + span, first + 2 * span, ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdSequence {
    pub first: u64,
    pub span: u64,
}

impl IdSequence {
    /// The `n`-th identifier of the sequence.
    pub fn nth(&self, n: u64) -> u64 {
        self.first + n * self.span
    }

    /// Whether `id` lies in this sequence's residue class.
    pub fn same_class(&self, id: u64) -> bool {
        id % self.span == self.first % self.span
    }
}

/// Identifier spaces leased to one tracker slot or to the local mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityLease {
    /// None for the local mapper.
    pub keyframes: Option<IdSequence>,
    pub map_points: IdSequence,
}

impl IdentityLease {
    /// Lease for tracker slot `tracker`, starting at the slot's first ids.
    pub fn for_tracker(tracker: TrackerId, max_trackers: u32) -> Self {
        let t = u64::from(tracker.0);
        Self::resume(KeyFrameId(t), MapPointId(t), max_trackers)
    }

    /// Lease continuing at the given ids, for a slot that was used before.
    pub fn resume(next_keyframe: KeyFrameId, next_map_point: MapPointId, max_trackers: u32) -> Self {
        Self {
            keyframes: Some(IdSequence {
                first: next_keyframe.0,
                span: keyframe_id_span(max_trackers),
            }),
            map_points: IdSequence {
                first: next_map_point.0,
                span: map_point_id_span(max_trackers),
            },
        }
    }

    /// Lease of the local mapper: MapPoint residue `max_trackers`, no KeyFrames.
    pub fn local_mapper(max_trackers: u32) -> Self {
        Self {
            keyframes: None,
            map_points: IdSequence {
                first: u64::from(max_trackers),
                span: map_point_id_span(max_trackers),
            },
        }
    }

    pub fn owns_keyframe(&self, id: KeyFrameId) -> bool {
        self.keyframes.is_some_and(|seq| seq.same_class(id.0))
    }

    pub fn owns_map_point(&self, id: MapPointId) -> bool {
        self.map_points.same_class(id.0)
    }
}

/// Lock-free id allocator over a lease.
///
/// An id is consumed when it is handed out.
#[derive(Debug)]
pub struct IdAllocator {
    lease: IdentityLease,
    keyframes: AtomicU64,
    map_points: AtomicU64,
}

impl IdAllocator {
    pub fn new(lease: IdentityLease) -> Self {
        Self {
            lease,
            keyframes: AtomicU64::new(0),
            map_points: AtomicU64::new(0),
        }
    }

    pub fn lease(&self) -> &IdentityLease {
        &self.lease
    }

    /// Next KeyFrame id, None for a lease without a KeyFrame space.
    pub fn next_keyframe_id(&self) -> Option<KeyFrameId> {
        let seq = self.lease.keyframes?;
        let n = self.keyframes.fetch_add(1, Ordering::SeqCst);
        Some(KeyFrameId(seq.nth(n)))
    }

    pub fn next_map_point_id(&self) -> MapPointId {
        let n = self.map_points.fetch_add(1, Ordering::SeqCst);
        MapPointId(self.lease.map_points.nth(n))
    }

    pub fn keyframes_allocated(&self) -> u64 {
        self.keyframes.load(Ordering::SeqCst)
    }

    pub fn map_points_allocated(&self) -> u64 {
        self.map_points.load(Ordering::SeqCst)
    }
}
