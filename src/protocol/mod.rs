//! Binary replication protocol for the shared map.
//!
//! A [`MapChangeEvent`] is serialized into a frame of node records and
//! applied to a replica [`Map`](crate::map::Map) on the receiving side.

pub mod change_event;
pub mod codec;
pub mod error;
pub mod records;

pub use change_event::{MapChangeEvent, UnknownKeyFramePolicy, PROTOCOL_VERSION};
pub use error::ProtocolError;
pub use records::{KeyFrameHeader, KeyFrameRecord, MapPointHeader, MapPointRecord};
