//! Node records: the full state of one KeyFrame or MapPoint on the wire.
//!
//! Each record starts with a fixed-size header carrying the identifier and
//! the scalar state, followed by length-prefixed blocks. Absent ids are
//! written as [`NULL_ID`](crate::map::NULL_ID).

use bytes::{Buf, BufMut};
use nalgebra::Vector3;

use crate::map::{
    Descriptor, KeyFrameData, KeyFrameId, KeyPoint, MapError, MapPointId, Pose, ScalePyramid,
};

use super::codec::{self, get_f64, get_u32, get_u64};
use super::error::ProtocolError;

const FLAG_BAD: u8 = 0b01;
const FLAG_HAS_DATA: u8 = 0b10;

/// Fixed-size KeyFrame record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyFrameHeader {
    pub id: u64,
    pub parent: u64,
    pub flags: u8,
    pub n_slots: u64,
    pub n_covisible: u64,
    pub n_children: u64,
    pub n_loop_edges: u64,
}

impl KeyFrameHeader {
    pub const SIZE: usize = 6 * 8 + 1;

    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.id);
        buf.put_u64_le(self.parent);
        buf.put_u8(self.flags);
        buf.put_u64_le(self.n_slots);
        buf.put_u64_le(self.n_covisible);
        buf.put_u64_le(self.n_children);
        buf.put_u64_le(self.n_loop_edges);
    }

    fn read(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        codec::ensure_remaining(buf, Self::SIZE)?;
        Ok(Self {
            id: buf.get_u64_le(),
            parent: buf.get_u64_le(),
            flags: buf.get_u8(),
            n_slots: buf.get_u64_le(),
            n_covisible: buf.get_u64_le(),
            n_children: buf.get_u64_le(),
            n_loop_edges: buf.get_u64_le(),
        })
    }
}

/// Fixed-size MapPoint record header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapPointHeader {
    pub id: u64,
    pub first_kf: u64,
    pub n_obs: u64,
    pub reference_kf: u64,
    pub visible: u32,
    pub found: u32,
    pub is_bad: u8,
    pub replaced: u64,
    pub min_distance: f64,
    pub max_distance: f64,
}

impl MapPointHeader {
    pub const SIZE: usize = 4 * 8 + 2 * 4 + 1 + 3 * 8;

    fn write(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.id);
        buf.put_u64_le(self.first_kf);
        buf.put_u64_le(self.n_obs);
        buf.put_u64_le(self.reference_kf);
        buf.put_u32_le(self.visible);
        buf.put_u32_le(self.found);
        buf.put_u8(self.is_bad);
        buf.put_u64_le(self.replaced);
        buf.put_f64_le(self.min_distance);
        buf.put_f64_le(self.max_distance);
    }

    fn read(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        codec::ensure_remaining(buf, Self::SIZE)?;
        Ok(Self {
            id: buf.get_u64_le(),
            first_kf: buf.get_u64_le(),
            n_obs: buf.get_u64_le(),
            reference_kf: buf.get_u64_le(),
            visible: buf.get_u32_le(),
            found: buf.get_u32_le(),
            is_bad: buf.get_u8(),
            replaced: buf.get_u64_le(),
            min_distance: buf.get_f64_le(),
            max_distance: buf.get_f64_le(),
        })
    }
}

/// Full state of a KeyFrame.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyFrameRecord {
    pub id: KeyFrameId,
    pub is_bad: bool,
    pub parent: Option<KeyFrameId>,
    pub pose: Pose,

    /// Sensor data; None for a placeholder that was never filled.
    pub data: Option<KeyFrameData>,

    /// Feature slots.
    pub map_points: Vec<Option<MapPointId>>,

    /// Covisibility weights, sorted by id.
    pub covisibility: Vec<(KeyFrameId, usize)>,
    pub children: Vec<KeyFrameId>,
    pub loop_edges: Vec<KeyFrameId>,
}

/// Keypoint row: x, y, octave, angle.
const KEYPOINT_COLS: usize = 4;

impl KeyFrameRecord {
    /// Smallest possible encoded record: header and pose.
    pub const MIN_LEN: usize = KeyFrameHeader::SIZE + codec::POSE_LEN;

    fn header(&self) -> KeyFrameHeader {
        let mut flags = 0;
        if self.is_bad {
            flags |= FLAG_BAD;
        }
        if self.data.is_some() {
            flags |= FLAG_HAS_DATA;
        }
        KeyFrameHeader {
            id: self.id.0,
            parent: KeyFrameId::to_wire(self.parent),
            flags,
            n_slots: self.map_points.len() as u64,
            n_covisible: self.covisibility.len() as u64,
            n_children: self.children.len() as u64,
            n_loop_edges: self.loop_edges.len() as u64,
        }
    }

    /// Size in bytes of the encoded record.
    pub fn encoded_len(&self) -> usize {
        let data_len = self.data.as_ref().map_or(0, |d| {
            let n = d.len();
            // timestamp, scale factor, levels, keypoints, right coords, descriptors
            8 + 8 + 4 + (8 + n * KEYPOINT_COLS * 4) + (8 + n * 4) + codec::descriptors_len(n)
        });
        KeyFrameHeader::SIZE
            + codec::POSE_LEN
            + data_len
            + self.map_points.len() * 8
            + self.covisibility.len() * 16
            + self.children.len() * 8
            + self.loop_edges.len() * 8
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        self.header().write(buf);
        codec::put_pose(buf, &self.pose);

        if let Some(data) = &self.data {
            buf.put_f64_le(data.timestamp);
            buf.put_f64_le(data.pyramid.scale_factor);
            buf.put_u32_le(data.pyramid.levels);

            codec::put_matrix_header(buf, data.len(), KEYPOINT_COLS);
            for kp in &data.keypoints {
                buf.put_f32_le(kp.x);
                buf.put_f32_le(kp.y);
                buf.put_u32_le(kp.octave);
                buf.put_f32_le(kp.angle);
            }
            codec::put_matrix_header(buf, data.len(), 1);
            for u in &data.right {
                buf.put_f32_le(*u);
            }
            codec::put_descriptors(buf, &data.descriptors);
        }

        for slot in &self.map_points {
            buf.put_u64_le(MapPointId::to_wire(*slot));
        }
        for (id, weight) in &self.covisibility {
            buf.put_u64_le(id.0);
            buf.put_u64_le(*weight as u64);
        }
        for id in &self.children {
            buf.put_u64_le(id.0);
        }
        for id in &self.loop_edges {
            buf.put_u64_le(id.0);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        let header = KeyFrameHeader::read(buf)?;
        let id = KeyFrameId::from_wire(header.id).ok_or(MapError::NullIdentifier)?;
        let pose = codec::get_pose(buf)?;

        let data = if header.flags & FLAG_HAS_DATA != 0 {
            Some(decode_keyframe_data(buf)?)
        } else {
            None
        };

        let map_points = read_vec(buf, header.n_slots, 8, |buf| {
            Ok(MapPointId::from_wire(buf.get_u64_le()))
        })?;
        let covisibility = read_vec(buf, header.n_covisible, 16, |buf| {
            let id = KeyFrameId(buf.get_u64_le());
            let weight = codec::to_index(buf.get_u64_le())?;
            Ok((id, weight))
        })?;
        let children = read_vec(buf, header.n_children, 8, |buf| {
            Ok(KeyFrameId(buf.get_u64_le()))
        })?;
        let loop_edges = read_vec(buf, header.n_loop_edges, 8, |buf| {
            Ok(KeyFrameId(buf.get_u64_le()))
        })?;

        Ok(Self {
            id,
            is_bad: header.flags & FLAG_BAD != 0,
            parent: KeyFrameId::from_wire(header.parent),
            pose,
            data,
            map_points,
            covisibility,
            children,
            loop_edges,
        })
    }
}

fn decode_keyframe_data(buf: &mut impl Buf) -> Result<KeyFrameData, ProtocolError> {
    let timestamp = get_f64(buf)?;
    let scale_factor = get_f64(buf)?;
    let levels = get_u32(buf)?;
    if levels == 0 {
        return Err(ProtocolError::InvalidValue {
            what: "pyramid levels",
            value: 0,
        });
    }

    let n = codec::get_matrix_header(buf, "keypoint", None, KEYPOINT_COLS)?;
    codec::ensure_remaining(buf, n * KEYPOINT_COLS * 4)?;
    let keypoints = (0..n)
        .map(|_| KeyPoint {
            x: buf.get_f32_le(),
            y: buf.get_f32_le(),
            octave: buf.get_u32_le(),
            angle: buf.get_f32_le(),
        })
        .collect();

    codec::get_matrix_header(buf, "right coordinate", Some(n), 1)?;
    codec::ensure_remaining(buf, n * 4)?;
    let right = (0..n).map(|_| buf.get_f32_le()).collect();

    let descriptors = codec::get_descriptors(buf, Some(n))?;

    Ok(KeyFrameData::new(
        timestamp,
        keypoints,
        right,
        descriptors,
        ScalePyramid::new(scale_factor, levels),
    ))
}

/// Read `count` fixed-size elements after checking they are all present.
fn read_vec<B: Buf, T>(
    buf: &mut B,
    count: u64,
    elem_size: usize,
    mut read: impl FnMut(&mut B) -> Result<T, ProtocolError>,
) -> Result<Vec<T>, ProtocolError> {
    let count = usize::try_from(count).map_err(|_| ProtocolError::InvalidValue {
        what: "count",
        value: count,
    })?;
    codec::ensure_remaining(buf, count.saturating_mul(elem_size))?;
    (0..count).map(|_| read(buf)).collect()
}

/// Full state of a MapPoint.
#[derive(Debug, Clone, PartialEq)]
pub struct MapPointRecord {
    pub id: MapPointId,
    pub first_kf: Option<KeyFrameId>,
    pub n_obs: usize,
    pub reference_kf: Option<KeyFrameId>,
    pub visible: u32,
    pub found: u32,
    pub is_bad: bool,
    pub replaced: Option<MapPointId>,
    pub min_distance: f64,
    pub max_distance: f64,
    pub world_pos: Vector3<f64>,
    pub normal: Vector3<f64>,
    pub descriptor: Descriptor,

    /// (KeyFrame, feature index) pairs, sorted by KeyFrame.
    pub observations: Vec<(KeyFrameId, usize)>,
}

impl MapPointRecord {
    pub const MIN_LEN: usize =
        MapPointHeader::SIZE + 2 * codec::VECTOR3_LEN + 8 + crate::map::DESCRIPTOR_LEN + 8;

    /// KeyFrames this record refers to: observers and the reference.
    pub fn referenced_keyframes(&self) -> impl Iterator<Item = KeyFrameId> + '_ {
        self.observations
            .iter()
            .map(|(id, _)| *id)
            .chain(self.reference_kf)
    }

    pub fn encoded_len(&self) -> usize {
        MapPointHeader::SIZE
            + 2 * codec::VECTOR3_LEN
            + codec::descriptors_len(1)
            + 8
            + self.observations.len() * 16
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        MapPointHeader {
            id: self.id.0,
            first_kf: KeyFrameId::to_wire(self.first_kf),
            n_obs: self.n_obs as u64,
            reference_kf: KeyFrameId::to_wire(self.reference_kf),
            visible: self.visible,
            found: self.found,
            is_bad: u8::from(self.is_bad),
            replaced: MapPointId::to_wire(self.replaced),
            min_distance: self.min_distance,
            max_distance: self.max_distance,
        }
        .write(buf);

        codec::put_vector3(buf, &self.world_pos);
        codec::put_vector3(buf, &self.normal);
        codec::put_descriptors(buf, std::slice::from_ref(&self.descriptor));

        buf.put_u64_le(self.observations.len() as u64);
        for (kf_id, idx) in &self.observations {
            buf.put_u64_le(kf_id.0);
            buf.put_u64_le(*idx as u64);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        let header = MapPointHeader::read(buf)?;
        let id = MapPointId::from_wire(header.id).ok_or(MapError::NullIdentifier)?;
        let world_pos = codec::get_vector3(buf, "position")?;
        let normal = codec::get_vector3(buf, "normal")?;
        let descriptor = codec::get_descriptors(buf, Some(1))?
            .pop()
            .unwrap_or_default();

        let n = codec::get_len(buf, 16)?;
        let mut observations = Vec::with_capacity(n);
        for _ in 0..n {
            let kf_id = KeyFrameId::from_wire(get_u64(buf)?).ok_or(MapError::NullIdentifier)?;
            let idx = codec::to_index(get_u64(buf)?)?;
            observations.push((kf_id, idx));
        }

        if header.is_bad > 1 {
            return Err(ProtocolError::InvalidValue {
                what: "bad flag",
                value: u64::from(header.is_bad),
            });
        }

        Ok(Self {
            id,
            first_kf: KeyFrameId::from_wire(header.first_kf),
            n_obs: codec::to_index(header.n_obs)?,
            reference_kf: KeyFrameId::from_wire(header.reference_kf),
            visible: header.visible,
            found: header.found,
            is_bad: header.is_bad == 1,
            replaced: MapPointId::from_wire(header.replaced),
            min_distance: header.min_distance,
            max_distance: header.max_distance,
            world_pos,
            normal,
            descriptor,
            observations,
        })
    }
}
