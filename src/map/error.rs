use thiserror::Error;

use super::types::{KeyFrameId, MapPointId};

/// Invariant violations in the map graph.
///
/// These are never recoverable by retrying: they indicate a caller bug or a
/// corrupted graph and must be surfaced, not swallowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("the sentinel identifier can not be stored in the map")]
    NullIdentifier,

    #[error("{0} can not replace itself")]
    SelfReplacement(MapPointId),

    #[error("replacing {replaced} with {replacer} would create a replacement cycle")]
    CyclicReplacement {
        replaced: MapPointId,
        replacer: MapPointId,
    },

    #[error("detected a loop in the replacement chain at {0}")]
    ReplacementLoop(MapPointId),

    #[error("replacement chain points to {0}, which is not in the map")]
    DanglingReplacement(MapPointId),

    #[error("{0} has no reference keyframe")]
    MissingReferenceKeyFrame(MapPointId),

    #[error("{0} is not in the map")]
    UnknownKeyFrame(KeyFrameId),

    #[error("{0} is not in the map")]
    UnknownMapPoint(MapPointId),
}
