//! Sync conflict model

use serde::{Deserialize, Serialize};

use super::PendingOp;

/// Recorded sync conflict resolved by strategy (LWW)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    /// Collection the record belongs to
    pub collection: String,
    /// Record involved in the conflict
    pub record_id: String,
    /// Pending local version's timestamp
    pub local_modified: i64,
    /// Incoming remote version's timestamp that won
    pub incoming_modified: i64,
    /// Discarded local payload (JSON), kept for manual recovery
    pub local_payload: String,
    /// Resolution timestamp (unix ms)
    pub resolved_at: i64,
    /// Resolution strategy name
    pub strategy: String,
    /// Local operation that lost; `None` for rows logged before it was kept
    #[serde(default)]
    pub pending_op: Option<PendingOp>,
    /// Partial patch (JSON) the losing operation would have uploaded
    #[serde(default)]
    pub pending_patch: Option<String>,
}

/// How to settle a record left in `conflict` status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Accept the remote version that won LWW
    KeepRemote,
    /// Replay the discarded local operation (update or delete)
    KeepLocal,
}
