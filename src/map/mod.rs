//! Map module - The shared SLAM graph.
//!
//! This module contains:
//! - [`KeyFrame`] - Selected frames with poses and feature observations
//! - [`MapPoint`] - 3D landmarks observed by KeyFrames
//! - [`Map`] - Container owning every node by identifier
//!
//! # Architecture
//!
//! The map forms a bipartite graph structure:
//! - KeyFrames observe MapPoints (KF → MP via feature slots)
//! - MapPoints track their observers (MP → KF via `observations`)
//!
//! Both directions hold identifiers, never owning handles, and are resolved
//! through the [`Map`]. Every node carries its own locks so trackers, the
//! local mapper and replica updates can touch different nodes in parallel.
//!
//! KeyFrames also maintain two graph structures:
//! - **Covisibility Graph**: Edges weighted by shared MapPoint count
//! - **Spanning Tree**: Parent/children links plus loop edges
//!
//! # Example
//!
//! ```ignore
//! use team_slam::map::{Map, KeyFrame, MapPoint, KeyFrameId, MapPointId};
//!
//! let map = Map::new();
//! map.add_keyframe(Arc::new(KeyFrame::new(kf_id, pose, data)))?;
//! map.add_map_point(Arc::new(MapPoint::new(mp_id, position, kf_id)))?;
//!
//! // Associate KeyFrame feature with MapPoint (bidirectional)
//! map.associate(kf_id, feature_idx, mp_id)?;
//! ```

pub mod error;
pub mod keyframe;
#[allow(clippy::module_inception)]
pub mod map;
pub mod map_point;
pub mod types;

pub use error::MapError;
pub use keyframe::{KeyFrame, KeyFrameData};
pub use map::{Map, MapSnapshot};
pub use map_point::MapPoint;
pub use types::{
    Descriptor, KeyFrameId, KeyPoint, MapPointId, Pose, ScalePyramid, TrackerId, DESCRIPTOR_LEN,
    NULL_ID,
};
