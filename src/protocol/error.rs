use thiserror::Error;

use crate::map::{KeyFrameId, MapError, MapPointId};

/// Corrupted or incompatible change-event bytes.
///
/// None of these are retryable: the frame must be dropped and the replica
/// resynchronized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("buffer truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("protocol version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("tracker span mismatch: expected {expected}, found {found}")]
    TrackerSpanMismatch { expected: u32, found: u32 },

    #[error("keyframe record for {found} read into {expected}")]
    KeyFrameIdMismatch {
        expected: KeyFrameId,
        found: KeyFrameId,
    },

    #[error("map point record for {found} read into {expected}")]
    MapPointIdMismatch {
        expected: MapPointId,
        found: MapPointId,
    },

    #[error("malformed {what} matrix: {rows}x{cols}")]
    MalformedMatrix {
        what: &'static str,
        rows: u32,
        cols: u32,
    },

    #[error("invalid {what} value {value}")]
    InvalidValue { what: &'static str, value: u64 },

    #[error("observation references unknown {0}")]
    UnknownKeyFrame(KeyFrameId),

    #[error("{0} trailing bytes after change event")]
    TrailingBytes(usize),

    #[error(transparent)]
    Map(#[from] MapError),
}
