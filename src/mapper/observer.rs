//! Change notification capability.

use crate::protocol::MapChangeEvent;

/// Receiver of map change notifications from a [`MapperServer`](super::MapperServer).
///
/// Observers are called synchronously, after the server released its locks
/// and before the mutating call returns. Implementations must not block.
pub trait MapObserver: Send + Sync {
    /// The map was cleared.
    fn handle_reset(&self);

    /// Nodes were added, updated or deleted.
    fn handle_map_changed(&self, event: &MapChangeEvent);
}
