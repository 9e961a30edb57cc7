use thiserror::Error;

use crate::map::{KeyFrameId, MapError, MapPointId, TrackerId};
use crate::protocol::ProtocolError;

/// Failures of the mapper session layer.
///
/// Only back-pressure is retryable; see [`MapperError::is_retryable`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapperError {
    #[error("keyframe insertion is paused")]
    Paused,

    #[error("all tracker slots are in use")]
    NoFreeSlot,

    #[error("{0} does not exist")]
    InvalidTracker(TrackerId),

    #[error("{0} is not logged in")]
    NotLoggedIn(TrackerId),

    #[error("the map is already initialized")]
    AlreadyInitialized,

    #[error("the map is not initialized")]
    NotInitialized,

    #[error("initialization needs at least one keyframe")]
    EmptyInitialization,

    #[error("{id} is outside the identifier space of {owner}")]
    ForeignKeyFrameId { owner: TrackerId, id: KeyFrameId },

    #[error("{0} is outside the caller's identifier space")]
    ForeignMapPointId(MapPointId),

    #[error("{0} is already in the map")]
    DuplicateKeyFrame(KeyFrameId),

    #[error("{0} is already in the map or the batch")]
    DuplicateMapPoint(MapPointId),

    #[error("{keyframe} references {map_point}, which is neither new nor in the map")]
    UnresolvedMapPoint {
        keyframe: KeyFrameId,
        map_point: MapPointId,
    },

    #[error("{map_point} is observed by {keyframe}, which is not in the map")]
    UnresolvedKeyFrame {
        map_point: MapPointId,
        keyframe: KeyFrameId,
    },

    #[error("{map_point} is observed by feature {index} of {keyframe}, which has no such feature")]
    ObservationOutOfRange {
        map_point: MapPointId,
        keyframe: KeyFrameId,
        index: usize,
    },

    #[error("feature {index} of {keyframe} already holds {occupant}")]
    SlotOccupied {
        keyframe: KeyFrameId,
        index: usize,
        occupant: MapPointId,
    },

    #[error("{0} is a keyframe origin and cannot be erased")]
    OriginKeyFrame(KeyFrameId),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl MapperError {
    /// Back-pressure conditions the caller should retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MapperError::Paused | MapperError::NoFreeSlot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_back_pressure_is_retryable() {
        assert!(MapperError::Paused.is_retryable());
        assert!(MapperError::NoFreeSlot.is_retryable());
        assert!(!MapperError::NotInitialized.is_retryable());
        assert!(!MapperError::SlotOccupied {
            keyframe: KeyFrameId::new(2),
            index: 0,
            occupant: MapPointId::new(0),
        }
        .is_retryable());
        assert!(!MapperError::Map(MapError::NullIdentifier).is_retryable());
        assert!(!MapperError::Protocol(ProtocolError::TrailingBytes(3)).is_retryable());
    }
}
