use serde::Serialize;

/// Snapshot of dispatcher occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Jobs currently holding a slot.
    pub active: usize,
    /// Callers waiting for a slot.
    pub queued: usize,
    pub max_active: usize,
    pub max_queued: usize,
}
