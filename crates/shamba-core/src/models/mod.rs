//! Data models for Shamba

mod event;
mod land;
mod metadata;
mod record;
mod schedule;
mod sync_conflict;

pub use event::{ChangeEnvelope, ChangeKind};
pub use land::{Land, LandPatch};
pub use metadata::SyncMetadata;
pub use record::{
    ListFilters, OwnerId, PendingOp, RecordId, RecordMeta, SyncRecord, SyncStatus, TenantId,
};
pub use schedule::{Schedule, SchedulePatch};
pub use sync_conflict::{ConflictResolution, SyncConflict};
