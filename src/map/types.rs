//! Core ID and value types shared by the map structures.

use nalgebra::Isometry3;

/// Identifier value reserved as "no node".
///
/// It marks empty keyframe slots, absent reference keyframes and absent
/// replacements on the wire, and can never be inserted into a [`Map`](super::Map).
pub const NULL_ID: u64 = u64::MAX;

/// Camera pose, world-to-camera (T_cw).
pub type Pose = Isometry3<f64>;

/// Unique identifier for a KeyFrame.
///
/// KeyFrameIds are leased per tracker (see [`crate::mapper::identity`]) so
/// that trackers can create keyframes concurrently. They serve as lightweight
/// handles for cross-referencing without needing Arc/Rc, which keeps the
/// KeyFrame <-> MapPoint graph free of ownership cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyFrameId(pub u64);

impl KeyFrameId {
    pub const NULL: KeyFrameId = KeyFrameId(NULL_ID);

    /// Create a new KeyFrameId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn is_null(self) -> bool {
        self.0 == NULL_ID
    }

    /// Wire form of an optional id: `None` becomes the sentinel.
    pub fn to_wire(id: Option<KeyFrameId>) -> u64 {
        id.map_or(NULL_ID, |id| id.0)
    }

    pub fn from_wire(raw: u64) -> Option<KeyFrameId> {
        (raw != NULL_ID).then_some(KeyFrameId(raw))
    }
}

impl std::fmt::Display for KeyFrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KF{}", self.0)
    }
}

/// Unique identifier for a MapPoint.
///
/// A MapPoint represents a 3D landmark observed by one or more KeyFrames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapPointId(pub u64);

impl MapPointId {
    pub const NULL: MapPointId = MapPointId(NULL_ID);

    /// Create a new MapPointId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn is_null(self) -> bool {
        self.0 == NULL_ID
    }

    pub fn to_wire(id: Option<MapPointId>) -> u64 {
        id.map_or(NULL_ID, |id| id.0)
    }

    pub fn from_wire(raw: u64) -> Option<MapPointId> {
        (raw != NULL_ID).then_some(MapPointId(raw))
    }
}

impl std::fmt::Display for MapPointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MP{}", self.0)
    }
}

/// Index of a tracker slot on the mapper server (`0..max_trackers`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackerId(pub u32);

impl TrackerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for TrackerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tracker {}", self.0)
    }
}

/// Length in bytes of a binary ORB descriptor.
pub const DESCRIPTOR_LEN: usize = 32;

/// 256-bit binary feature descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(pub [u8; DESCRIPTOR_LEN]);

impl Descriptor {
    pub fn zeros() -> Self {
        Self([0; DESCRIPTOR_LEN])
    }

    pub fn as_bytes(&self) -> &[u8; DESCRIPTOR_LEN] {
        &self.0
    }

    /// Hamming distance between two descriptors.
    pub fn distance(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

impl Default for Descriptor {
    fn default() -> Self {
        Self::zeros()
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Descriptor(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// An undistorted keypoint as produced by the feature extractor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
    /// Pyramid level the feature was detected at.
    pub octave: u32,
    pub angle: f32,
}

impl KeyPoint {
    pub fn new(x: f32, y: f32, octave: u32) -> Self {
        Self {
            x,
            y,
            octave,
            angle: 0.0,
        }
    }
}

/// ORB scale pyramid parameters of the extractor that produced a KeyFrame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalePyramid {
    /// Scale factor between levels (typically 1.2).
    pub scale_factor: f64,
    /// Number of levels (typically 8).
    pub levels: u32,
}

impl ScalePyramid {
    pub fn new(scale_factor: f64, levels: u32) -> Self {
        Self {
            scale_factor,
            levels: levels.max(1),
        }
    }

    /// Scale of a pyramid level relative to level 0.
    pub fn scale_at(&self, level: u32) -> f64 {
        self.scale_factor.powi(level.min(self.levels - 1) as i32)
    }

    /// Scale of the coarsest level.
    pub fn max_scale(&self) -> f64 {
        self.scale_at(self.levels - 1)
    }

    pub fn log_scale_factor(&self) -> f64 {
        self.scale_factor.ln()
    }
}

impl Default for ScalePyramid {
    fn default() -> Self {
        Self::new(1.2, 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyframe_id_equality() {
        let id1 = KeyFrameId::new(42);
        let id2 = KeyFrameId::new(42);
        let id3 = KeyFrameId::new(43);

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_mappoint_id_display() {
        let id = MapPointId::new(123);
        assert_eq!(format!("{}", id), "MP123");
    }

    #[test]
    fn test_id_as_hashmap_key() {
        use std::collections::HashMap;

        let mut map: HashMap<KeyFrameId, &str> = HashMap::new();
        map.insert(KeyFrameId::new(1), "first");
        map.insert(KeyFrameId::new(2), "second");

        assert_eq!(map.get(&KeyFrameId::new(1)), Some(&"first"));
        assert_eq!(map.get(&KeyFrameId::new(3)), None);
    }

    #[test]
    fn test_wire_sentinel() {
        assert_eq!(KeyFrameId::to_wire(None), NULL_ID);
        assert_eq!(KeyFrameId::from_wire(NULL_ID), None);
        assert_eq!(MapPointId::from_wire(7), Some(MapPointId::new(7)));
        assert!(MapPointId::NULL.is_null());
    }

    #[test]
    fn test_descriptor_distance() {
        let a = Descriptor::zeros();
        let mut bytes = [0u8; DESCRIPTOR_LEN];
        bytes[0] = 0b1011;
        bytes[31] = 0xff;
        let b = Descriptor(bytes);

        assert_eq!(a.distance(&a), 0);
        assert_eq!(a.distance(&b), 11);
        assert_eq!(b.distance(&a), 11);
    }

    #[test]
    fn test_scale_pyramid() {
        let pyramid = ScalePyramid::default();
        assert!((pyramid.scale_at(0) - 1.0).abs() < 1e-12);
        assert!((pyramid.scale_at(2) - 1.44).abs() < 1e-12);
        assert!((pyramid.max_scale() - 1.2f64.powi(7)).abs() < 1e-12);
        // Levels past the top clamp to the coarsest scale.
        assert_eq!(pyramid.scale_at(20), pyramid.max_scale());
    }
}
