//! Device-wide sync metadata

use serde::{Deserialize, Serialize};

/// Singleton sync bookkeeping for this device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    /// Last successful remote pull (Unix ms)
    pub last_sync_time: Option<i64>,
    /// Number of local records with `sync_status = pending`
    pub pending_changes: u64,
    /// Whether an orchestration run is currently in flight
    pub sync_in_progress: bool,
}

impl SyncMetadata {
    /// Whether the last sync is older than `threshold_ms` at `now_ms`.
    ///
    /// A device that never synced is always expired.
    pub const fn is_expired(&self, now_ms: i64, threshold_ms: i64) -> bool {
        match self.last_sync_time {
            Some(last) => now_ms.saturating_sub(last) > threshold_ms,
            None => true,
        }
    }
}
