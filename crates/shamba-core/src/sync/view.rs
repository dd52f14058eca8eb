use serde::Serialize;

use crate::models::{SyncRecord, SyncStatus};

/// Where a result was served from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Authoritative remote response, written through to the replica
    Remote,
    /// Local replica, because the device is offline or the remote failed
    #[default]
    Cache,
}

/// Result of a collection read, also published to subscribers.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionView<R> {
    pub data: Vec<R>,
    pub is_loading: bool,
    /// Served from the local replica instead of the remote
    pub is_stale: bool,
    /// The collection's last successful pull is older than the freshness
    /// threshold (or never happened)
    pub is_expired: bool,
    /// Why the remote was not used, when it failed
    pub error: Option<String>,
    /// Local changes waiting for upload, device-wide
    pub pending_changes: u64,
    pub source: DataSource,
}

impl<R> Default for CollectionView<R> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            is_loading: false,
            is_stale: false,
            is_expired: true,
            error: None,
            pending_changes: 0,
            source: DataSource::Cache,
        }
    }
}

impl<R: SyncRecord> CollectionView<R> {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Records in this view that are waiting for upload
    pub fn pending(&self) -> impl Iterator<Item = &R> {
        self.data
            .iter()
            .filter(|record| record.meta().sync_status == SyncStatus::Pending)
    }
}

/// Result of a single-record read
#[derive(Debug, Clone, Serialize)]
pub struct RecordView<R> {
    pub data: Option<R>,
    pub is_stale: bool,
    pub error: Option<String>,
    pub pending_changes: u64,
    pub source: DataSource,
}

/// Result of a create, mutate or delete
#[derive(Debug, Clone, Serialize)]
pub struct MutationOutcome<R> {
    /// The locally visible record after the operation; `None` once deleted
    pub record: Option<R>,
    /// `Synced` when the remote accepted the write, `Pending` when staged
    /// locally. `None` when nothing remains to upload.
    pub sync_status: Option<SyncStatus>,
    pub pending_changes: u64,
    /// Why the remote write did not happen, when it failed
    pub error: Option<String>,
}

impl<R> MutationOutcome<R> {
    pub fn is_pending(&self) -> bool {
        self.sync_status == Some(SyncStatus::Pending)
    }
}
