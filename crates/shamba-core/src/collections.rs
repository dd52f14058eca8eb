//! Public per-collection read/write surface.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::Result;
use crate::models::{ConflictResolution, ListFilters, RecordId, SyncConflict, SyncRecord};
use crate::sync::{CollectionSync, CollectionView, MutationOutcome, RecordView};

/// Typed access to one registered collection.
///
/// Remote and local-store failures never surface as `Err`; they show up as
/// `is_stale`/`error` on the returned view. Errors are reserved for identity
/// and isolation violations, validation failures and unknown ids.
pub struct CollectionAccessor<R: SyncRecord> {
    sync: Arc<CollectionSync<R>>,
}

impl<R: SyncRecord> Clone for CollectionAccessor<R> {
    fn clone(&self) -> Self {
        Self {
            sync: Arc::clone(&self.sync),
        }
    }
}

impl<R: SyncRecord> CollectionAccessor<R> {
    pub(crate) const fn new(sync: Arc<CollectionSync<R>>) -> Self {
        Self { sync }
    }

    pub const fn collection(&self) -> &'static str {
        R::COLLECTION
    }

    pub async fn list(&self, filters: &ListFilters) -> Result<CollectionView<R>> {
        self.sync.fetch(filters).await
    }

    pub async fn list_all(&self) -> Result<CollectionView<R>> {
        self.list(&ListFilters::new()).await
    }

    pub async fn get(&self, id: &RecordId) -> Result<RecordView<R>> {
        self.sync.get(id).await
    }

    /// Create a record from `patch`; the id is generated locally
    pub async fn create(&self, patch: &R::Patch) -> Result<MutationOutcome<R>> {
        self.sync.create(patch).await
    }

    pub async fn mutate(&self, id: &RecordId, patch: &R::Patch) -> Result<MutationOutcome<R>> {
        self.sync.mutate(id, patch).await
    }

    pub async fn delete(&self, id: &RecordId) -> Result<MutationOutcome<R>> {
        self.sync.delete(id).await
    }

    /// Drop the cached result and fetch again with the last filters.
    ///
    /// Never joins a fetch that started before the call.
    pub async fn refetch(&self) -> Result<CollectionView<R>> {
        self.sync.invalidate_flights();
        self.sync.fetch(&self.sync.last_filters()).await
    }

    /// Latest view, updated by every fetch, refetch and change-feed refresh
    pub fn subscribe(&self) -> watch::Receiver<CollectionView<R>> {
        self.sync.subscribe()
    }

    pub async fn conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.sync.conflicts(limit).await
    }

    pub async fn resolve(
        &self,
        id: &RecordId,
        resolution: ConflictResolution,
    ) -> Result<MutationOutcome<R>> {
        self.sync.resolve_conflict(id, resolution).await
    }
}
