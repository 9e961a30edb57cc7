//! MapChangeEvent - The delta that keeps map replicas in sync.
//!
//! An event names the KeyFrames and MapPoints whose state changed and the
//! KeyFrames that were deleted. Updated nodes are held by handle; their full
//! current state is captured when the event is serialized.
//!
//! # Frame layout
//!
//! ```text
//! version: u32 | max_trackers: u32
//! n_keyframes: u64   | KeyFrame records
//! n_deleted: u64     | deleted KeyFrame ids (u64 each)
//! n_map_points: u64  | MapPoint records
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::map::{KeyFrame, KeyFrameId, Map, MapPoint, MapPointId};

use super::codec;
use super::error::ProtocolError;
use super::records::{KeyFrameRecord, MapPointRecord};

/// Version of the frame layout. Bumped on any incompatible change.
pub const PROTOCOL_VERSION: u32 = 1;

const FRAME_HEADER_LEN: usize = 4 + 4;

/// What to do when a received MapPoint refers to a KeyFrame the receiving
/// map does not hold and the same event does not carry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownKeyFramePolicy {
    /// Insert an id-only placeholder, filled by a later event.
    #[default]
    Placeholder,
    /// Fail the whole read with [`ProtocolError::UnknownKeyFrame`].
    Reject,
}

/// Accumulated changes since the last synchronization point.
#[derive(Debug, Clone, Default)]
pub struct MapChangeEvent {
    pub updated_keyframes: BTreeMap<KeyFrameId, Arc<KeyFrame>>,
    pub deleted_keyframes: BTreeSet<KeyFrameId>,
    pub updated_map_points: BTreeMap<MapPointId, Arc<MapPoint>>,
}

/// Records parsed from a frame, before touching any map.
struct DecodedFrame {
    keyframes: Vec<KeyFrameRecord>,
    deleted: Vec<KeyFrameId>,
    map_points: Vec<MapPointRecord>,
}

impl MapChangeEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any change was recorded.
    pub fn is_empty(&self) -> bool {
        self.updated_keyframes.is_empty()
            && self.deleted_keyframes.is_empty()
            && self.updated_map_points.is_empty()
    }

    pub fn record_keyframe(&mut self, kf: Arc<KeyFrame>) {
        self.deleted_keyframes.remove(&kf.id());
        self.updated_keyframes.insert(kf.id(), kf);
    }

    pub fn record_deleted_keyframe(&mut self, id: KeyFrameId) {
        self.updated_keyframes.remove(&id);
        self.deleted_keyframes.insert(id);
    }

    pub fn record_map_point(&mut self, mp: Arc<MapPoint>) {
        self.updated_map_points.insert(mp.id(), mp);
    }

    /// Fold a later event into this one.
    pub fn merge(&mut self, other: MapChangeEvent) {
        for (_, kf) in other.updated_keyframes {
            self.record_keyframe(kf);
        }
        for id in other.deleted_keyframes {
            self.record_deleted_keyframe(id);
        }
        self.updated_map_points.extend(other.updated_map_points);
    }

    /// Gather every node whose modified flag is set, clearing the flags,
    /// and every KeyFrame erased since the last collection.
    ///
    /// Callers that need a consistent cut hold the map-update lock.
    pub fn collect_modified(map: &Map) -> Self {
        let snapshot = map.snapshot();
        let mut event = Self::new();
        for id in map.take_erased_keyframes() {
            event.record_deleted_keyframe(id);
        }
        for kf in snapshot.keyframes {
            if kf.is_modified() {
                kf.set_modified(false);
                event.record_keyframe(kf);
            }
        }
        for mp in snapshot.map_points {
            if mp.is_modified() {
                mp.set_modified(false);
                event.record_map_point(mp);
            }
        }
        event
    }

    fn records(&self) -> (Vec<KeyFrameRecord>, Vec<MapPointRecord>) {
        let keyframes = self.updated_keyframes.values().map(|kf| kf.to_record()).collect();
        let map_points = self.updated_map_points.values().map(|mp| mp.to_record()).collect();
        (keyframes, map_points)
    }

    /// Size in bytes of the serialized frame at this moment.
    pub fn buffer_size(&self) -> usize {
        let (keyframes, map_points) = self.records();
        frame_len(&keyframes, self.deleted_keyframes.len(), &map_points)
    }

    /// Serialize the current state of every recorded node.
    pub fn write_bytes(&self, buf: &mut impl BufMut, max_trackers: u32) {
        let (keyframes, map_points) = self.records();
        write_frame(buf, max_trackers, &keyframes, &self.deleted_keyframes, &map_points);
    }

    pub fn to_bytes(&self, max_trackers: u32) -> Bytes {
        let (keyframes, map_points) = self.records();
        let mut out = BytesMut::with_capacity(frame_len(
            &keyframes,
            self.deleted_keyframes.len(),
            &map_points,
        ));
        write_frame(&mut out, max_trackers, &keyframes, &self.deleted_keyframes, &map_points);
        out.freeze()
    }

    /// Apply a serialized frame to `map`.
    ///
    /// The whole frame is parsed before the map is touched, so corrupted
    /// bytes leave the map unchanged. Records overwrite the state of nodes
    /// with the same id, creating them if needed; applying a frame twice
    /// yields the same map. Returns the event describing what was applied.
    pub fn read_bytes(
        mut buf: impl Buf,
        map: &Map,
        max_trackers: u32,
        policy: UnknownKeyFramePolicy,
    ) -> Result<MapChangeEvent, ProtocolError> {
        let frame = decode_frame(&mut buf, max_trackers)?;

        if policy == UnknownKeyFramePolicy::Reject {
            let carried: BTreeSet<KeyFrameId> = frame.keyframes.iter().map(|r| r.id).collect();
            for record in &frame.map_points {
                for kf_id in record.referenced_keyframes() {
                    if !carried.contains(&kf_id) && !map.contains_keyframe(kf_id) {
                        return Err(ProtocolError::UnknownKeyFrame(kf_id));
                    }
                }
            }
        }

        let mut event = MapChangeEvent::new();
        let mut placeholders = 0usize;

        for record in &frame.keyframes {
            let (kf, _) = map.find_or_create_keyframe(record.id)?;
            kf.apply_record(record)?;
            kf.set_modified(false);
            event.record_keyframe(kf);
        }

        for record in &frame.map_points {
            for kf_id in record.referenced_keyframes() {
                let (_, created) = map.find_or_create_keyframe(kf_id)?;
                placeholders += usize::from(created);
            }
            if let Some(target) = record.replaced {
                let (_, created) = map.find_or_create_map_point(target)?;
                placeholders += usize::from(created);
            }

            let (mp, _) = map.find_or_create_map_point(record.id)?;
            mp.apply_record(record)?;
            mp.set_modified(false);
            event.record_map_point(mp);
        }

        // Deletions last so that observations in this frame cannot revive them.
        for id in frame.deleted {
            map.discard_keyframe(id);
            event.record_deleted_keyframe(id);
        }

        debug!(
            keyframes = event.updated_keyframes.len(),
            deleted = event.deleted_keyframes.len(),
            map_points = event.updated_map_points.len(),
            placeholders,
            "Applied change event"
        );
        Ok(event)
    }
}

fn frame_len(keyframes: &[KeyFrameRecord], n_deleted: usize, map_points: &[MapPointRecord]) -> usize {
    FRAME_HEADER_LEN
        + 8
        + keyframes.iter().map(KeyFrameRecord::encoded_len).sum::<usize>()
        + 8
        + n_deleted * 8
        + 8
        + map_points.iter().map(MapPointRecord::encoded_len).sum::<usize>()
}

fn write_frame(
    buf: &mut impl BufMut,
    max_trackers: u32,
    keyframes: &[KeyFrameRecord],
    deleted: &BTreeSet<KeyFrameId>,
    map_points: &[MapPointRecord],
) {
    buf.put_u32_le(PROTOCOL_VERSION);
    buf.put_u32_le(max_trackers);

    buf.put_u64_le(keyframes.len() as u64);
    for record in keyframes {
        record.encode(buf);
    }

    buf.put_u64_le(deleted.len() as u64);
    for id in deleted {
        buf.put_u64_le(id.0);
    }

    buf.put_u64_le(map_points.len() as u64);
    for record in map_points {
        record.encode(buf);
    }
}

fn decode_frame(buf: &mut impl Buf, max_trackers: u32) -> Result<DecodedFrame, ProtocolError> {
    let version = codec::get_u32(buf)?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: version,
        });
    }
    let span = codec::get_u32(buf)?;
    if span != max_trackers {
        return Err(ProtocolError::TrackerSpanMismatch {
            expected: max_trackers,
            found: span,
        });
    }

    let n = codec::get_len(buf, KeyFrameRecord::MIN_LEN)?;
    let keyframes = (0..n)
        .map(|_| KeyFrameRecord::decode(buf))
        .collect::<Result<Vec<_>, _>>()?;

    let n = codec::get_len(buf, 8)?;
    let mut deleted = Vec::with_capacity(n);
    for _ in 0..n {
        let raw = codec::get_u64(buf)?;
        deleted.push(KeyFrameId::from_wire(raw).ok_or(crate::map::MapError::NullIdentifier)?);
    }

    let n = codec::get_len(buf, MapPointRecord::MIN_LEN)?;
    let map_points = (0..n)
        .map(|_| MapPointRecord::decode(buf))
        .collect::<Result<Vec<_>, _>>()?;

    if buf.has_remaining() {
        return Err(ProtocolError::TrailingBytes(buf.remaining()));
    }

    Ok(DecodedFrame {
        keyframes,
        deleted,
        map_points,
    })
}
