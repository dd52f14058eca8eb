//! Fetch and mutation pipeline for one collection.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::FutureExt;
use tokio::sync::watch;

use super::flight::{FlightGroup, FlightResult};
use super::orchestrator::{Core, FlushReport, SyncTarget};
use super::view::{CollectionView, DataSource, MutationOutcome, RecordView};
use crate::error::{Error, Result};
use crate::isolation::RequestScope;
use crate::models::{
    ConflictResolution, ListFilters, PendingOp, RecordId, RecordMeta, SyncConflict, SyncRecord,
    SyncStatus,
};
use crate::remote::{RemoteCollection, RemoteError};
use crate::util::{merge_json_objects, now_millis};

pub(crate) struct CollectionSync<R: SyncRecord> {
    core: Arc<Core>,
    remote: Arc<dyn RemoteCollection<R>>,
    flights: FlightGroup<Arc<Vec<RecordId>>>,
    view: watch::Sender<CollectionView<R>>,
    last_filters: Mutex<ListFilters>,
}

impl<R: SyncRecord> CollectionSync<R> {
    pub(crate) fn new(core: Arc<Core>, remote: Arc<dyn RemoteCollection<R>>) -> Self {
        let (view, _) = watch::channel(CollectionView::default());
        Self {
            core,
            remote,
            flights: FlightGroup::new(),
            view,
            last_filters: Mutex::new(ListFilters::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<CollectionView<R>> {
        self.view.subscribe()
    }

    pub(crate) fn invalidate_flights(&self) {
        self.flights.invalidate();
    }

    pub(crate) fn last_filters(&self) -> ListFilters {
        self.last_filters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Collection fetch: remote-authoritative when reachable, the local
    /// replica otherwise.
    pub(crate) async fn fetch(&self, filters: &ListFilters) -> Result<CollectionView<R>> {
        let scope = self.core.isolation().scope()?;
        *self
            .last_filters
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = filters.clone();

        if !self.core.connectivity.is_online() {
            tracing::debug!(collection = R::COLLECTION, "Offline; serving from local replica");
            let view = self.cached_view(filters, None).await?;
            self.view.send_replace(view.clone());
            return Ok(view);
        }

        self.view.send_modify(|view| view.is_loading = true);
        let view = match self.pull(filters, scope.epoch).await {
            Ok(ids) => self.remote_view(filters, &ids).await,
            Err(error) => {
                if let Some(violation) = error.isolation_copy() {
                    self.view.send_modify(|view| view.is_loading = false);
                    return Err(violation);
                }
                tracing::warn!(
                    collection = R::COLLECTION,
                    "Remote fetch failed, serving from local replica: {error}"
                );
                self.cached_view(filters, Some(error.to_string())).await
            }
        };
        let view = match view {
            Ok(view) => view,
            Err(error) => {
                self.view.send_modify(|view| view.is_loading = false);
                return Err(error);
            }
        };
        self.view.send_replace(view.clone());
        Ok(view)
    }

    async fn pull(&self, filters: &ListFilters, epoch: u64) -> FlightResult<Arc<Vec<RecordId>>> {
        let core = Arc::clone(&self.core);
        let remote = Arc::clone(&self.remote);
        let request = filters.clone();
        let (flight, started) = self.flights.join_or_start(filters.cache_key(), epoch, move || {
            async move {
                run_pull(core, remote, request)
                    .await
                    .map(Arc::new)
                    .map_err(Arc::new)
            }
            .boxed()
        });
        if !started {
            tracing::debug!(collection = R::COLLECTION, "Joining in-flight fetch");
        }
        flight.await
    }

    /// Records the remote returned, plus local pending rows matching the
    /// filters. Foreign records were already dropped by the store.
    async fn remote_view(&self, filters: &ListFilters, ids: &[RecordId]) -> Result<CollectionView<R>> {
        let returned: HashSet<&RecordId> = ids.iter().collect();
        let data = self
            .core
            .store
            .get_all::<R>(None)
            .await?
            .into_iter()
            .filter(|record| {
                returned.contains(record.id())
                    || (record.meta().sync_status == SyncStatus::Pending && record.matches(filters))
            })
            .collect();
        Ok(CollectionView {
            data,
            is_loading: false,
            is_stale: false,
            is_expired: false,
            error: None,
            pending_changes: self.core.store.pending_count().await?,
            source: DataSource::Remote,
        })
    }

    /// Local fallback. Store failures are absorbed into `error`; only
    /// isolation violations propagate.
    async fn cached_view(
        &self,
        filters: &ListFilters,
        error: Option<String>,
    ) -> Result<CollectionView<R>> {
        match self.read_cache(filters).await {
            Ok((data, is_expired, pending_changes)) => Ok(CollectionView {
                data,
                is_loading: false,
                is_stale: true,
                is_expired,
                error,
                pending_changes,
                source: DataSource::Cache,
            }),
            Err(store_error) => {
                if let Some(violation) = store_error.isolation_copy() {
                    return Err(violation);
                }
                tracing::error!(
                    collection = R::COLLECTION,
                    "Local replica read failed: {store_error}"
                );
                Ok(CollectionView {
                    error: Some(error.map_or_else(
                        || store_error.to_string(),
                        |error| format!("{error}; {store_error}"),
                    )),
                    is_stale: true,
                    ..CollectionView::default()
                })
            }
        }
    }

    async fn read_cache(&self, filters: &ListFilters) -> Result<(Vec<R>, bool, u64)> {
        let store = &self.core.store;
        let data = store
            .get_all::<R>(None)
            .await?
            .into_iter()
            .filter(|record| record.matches(filters))
            .collect();
        let threshold = i64::try_from(self.core.settings.freshness.as_millis()).unwrap_or(i64::MAX);
        let is_expired = store
            .collection_last_sync(R::COLLECTION)
            .await?
            .is_none_or(|last| now_millis().saturating_sub(last) > threshold);
        Ok((data, is_expired, store.pending_count().await?))
    }

    pub(crate) async fn get(&self, id: &RecordId) -> Result<RecordView<R>> {
        let scope = self.core.isolation().scope()?;
        let store = &self.core.store;

        let error = match self.core.remote_available().await {
            Ok(true) => match self.remote.get(&scope, id).await {
                Ok(found) => {
                    let data = if let Some(record) = found {
                        let _shared = self.core.reload_lock.read().await;
                        store.upsert_many(&scope, vec![record]).await?;
                        store.get::<R>(id).await?
                    } else {
                        store
                            .get::<R>(id)
                            .await?
                            .filter(|record| record.meta().sync_status != SyncStatus::Synced)
                    };
                    return Ok(RecordView {
                        data,
                        is_stale: false,
                        error: None,
                        pending_changes: store.pending_count().await?,
                        source: DataSource::Remote,
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        collection = R::COLLECTION,
                        record_id = %id,
                        "Remote get failed, serving from local replica: {error}"
                    );
                    Some(Error::RemoteFetchFailed(error.to_string()).to_string())
                }
            },
            Ok(false) => None,
            Err(error) => Some(error.to_string()),
        };

        Ok(RecordView {
            data: store.get::<R>(id).await?,
            is_stale: true,
            error,
            pending_changes: store.pending_count().await?,
            source: DataSource::Cache,
        })
    }

    pub(crate) async fn create(&self, patch: &R::Patch) -> Result<MutationOutcome<R>> {
        let scope = self.core.isolation().scope()?;
        let meta = RecordMeta::new_local(scope.tenant_id.clone(), scope.owner_id.clone());
        let record = R::from_patch(meta, patch)?;
        let patch_value = serde_json::to_value(patch)?;

        let error = match self.core.remote_available().await {
            Ok(true) => match self.remote.create(&scope, &record).await {
                Ok(server) => return self.settle_write(&scope, record.id(), server).await,
                Err(error) => Some(self.write_failed("create", record.id(), &error)),
            },
            Ok(false) => None,
            Err(error) => Some(error.to_string()),
        };

        self.stage(&record, PendingOp::Create, patch_value, error).await
    }

    pub(crate) async fn mutate(&self, id: &RecordId, patch: &R::Patch) -> Result<MutationOutcome<R>> {
        let scope = self.core.isolation().scope()?;
        let stored = self
            .core
            .store
            .get_stored::<R>(id)
            .await?
            .filter(|stored| !stored.is_deleted)
            .ok_or_else(|| Error::NotFound(format!("{}/{id}", R::COLLECTION)))?;

        let patch_value = serde_json::to_value(patch)?;
        let mut local = stored.record.clone();
        local.apply_patch(patch);
        local.meta_mut().last_modified = now_millis();

        let error = match self.core.remote_available().await {
            Ok(true) => {
                let result = if stored.pending_op == Some(PendingOp::Create) {
                    self.remote.create(&scope, &local).await
                } else {
                    // Earlier offline edits ride along so they are not reordered
                    let staged = stored.pending_patch.as_ref().map_or_else(
                        || patch_value.clone(),
                        |pending| merge_json_objects(pending, &patch_value),
                    );
                    let staged: R::Patch = serde_json::from_value(staged)?;
                    self.remote.update(&scope, id, &staged).await
                };
                match result {
                    Ok(server) => return self.settle_write(&scope, id, server).await,
                    Err(error) => Some(self.write_failed("update", id, &error)),
                }
            }
            Ok(false) => None,
            Err(error) => Some(error.to_string()),
        };

        self.stage(&local, PendingOp::Update, patch_value, error).await
    }

    pub(crate) async fn delete(&self, id: &RecordId) -> Result<MutationOutcome<R>> {
        let scope = self.core.isolation().scope()?;
        let stored = self
            .core
            .store
            .get_stored::<R>(id)
            .await?
            .filter(|stored| !stored.is_deleted)
            .ok_or_else(|| Error::NotFound(format!("{}/{id}", R::COLLECTION)))?;

        if stored.pending_op == Some(PendingOp::Create) {
            // Never uploaded; dropping the row is the whole delete
            return self
                .stage(&stored.record, PendingOp::Delete, serde_json::json!({}), None)
                .await;
        }

        let error = match self.core.remote_available().await {
            Ok(true) => match self.remote.delete(&scope, id).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => {
                    let _shared = self.core.reload_lock.read().await;
                    self.core.store.remove::<R>(&scope, id).await?;
                    return self.outcome(None, None, None).await;
                }
                Err(error) => Some(self.write_failed("delete", id, &error)),
            },
            Ok(false) => None,
            Err(error) => Some(error.to_string()),
        };

        let mut tombstone = stored.record;
        tombstone.meta_mut().last_modified = now_millis();
        self.stage(&tombstone, PendingOp::Delete, serde_json::json!({}), error)
            .await
    }

    /// Upload this collection's pending rows.
    ///
    /// Successes write through as `synced`. A transient failure stops the
    /// pass; remaining rows stay pending for the next one.
    pub(crate) async fn flush_pending(&self) -> Result<FlushReport> {
        let scope = self.core.isolation().scope()?;
        let mut report = FlushReport::default();
        let pending = self.core.store.pending::<R>().await?;
        if pending.is_empty() {
            return Ok(report);
        }
        if !self.core.remote_available().await? {
            return Err(Error::RemoteWriteFailed(format!(
                "device is offline; {} {} changes not uploaded",
                pending.len(),
                R::COLLECTION
            )));
        }

        tracing::debug!(
            collection = R::COLLECTION,
            "Uploading {} pending changes",
            pending.len()
        );
        for stored in pending {
            let id = stored.record.id().clone();
            let result = match stored.pending_op {
                Some(PendingOp::Create) => self.remote.create(&scope, &stored.record).await.map(Some),
                Some(PendingOp::Delete) => match self.remote.delete(&scope, &id).await {
                    Ok(()) | Err(RemoteError::NotFound(_)) => Ok(None),
                    Err(error) => Err(error),
                },
                Some(PendingOp::Update) | None => {
                    let patch: R::Patch = match stored.pending_patch {
                        Some(patch) => serde_json::from_value(patch)?,
                        None => R::Patch::default(),
                    };
                    self.remote.update(&scope, &id, &patch).await.map(Some)
                }
            };

            let _shared = self.core.reload_lock.read().await;
            match result {
                Ok(Some(server)) => {
                    self.core
                        .store
                        .write_through(&scope, Some(&id), server)
                        .await?;
                    report.uploaded += 1;
                }
                Ok(None) => {
                    self.core.store.remove::<R>(&scope, &id).await?;
                    report.uploaded += 1;
                }
                Err(RemoteError::NotFound(_)) => {
                    tracing::warn!(
                        collection = R::COLLECTION,
                        record_id = %id,
                        "Record was deleted remotely; discarding local edit"
                    );
                    self.core.store.remove::<R>(&scope, &id).await?;
                    report.discarded += 1;
                }
                Err(error) => {
                    self.write_failed("upload", &id, &error);
                    report.failed += 1;
                    if error.is_transient() {
                        break;
                    }
                }
            }
        }
        Ok(report)
    }

    pub(crate) async fn conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        Ok(self
            .core
            .store
            .list_conflicts(limit)
            .await?
            .into_iter()
            .filter(|conflict| conflict.collection == R::COLLECTION)
            .collect())
    }

    /// Settle a `conflict` row.
    ///
    /// `KeepRemote` accepts the stored remote version. `KeepLocal` accepts it
    /// and then replays the losing local operation on top: a delete is
    /// deleted again, an update re-sends its original partial patch.
    pub(crate) async fn resolve_conflict(
        &self,
        id: &RecordId,
        resolution: ConflictResolution,
    ) -> Result<MutationOutcome<R>> {
        let scope = self.core.isolation().scope()?;
        let store = &self.core.store;
        store
            .get::<R>(id)
            .await?
            .filter(|record| record.meta().sync_status == SyncStatus::Conflict)
            .ok_or_else(|| Error::NotFound(format!("no conflict for {}/{id}", R::COLLECTION)))?;

        match resolution {
            ConflictResolution::KeepRemote => {
                let _shared = self.core.reload_lock.read().await;
                if !store.accept_remote::<R>(&scope, id).await? {
                    return self.outcome(None, None, None).await;
                }
                let record = store.get::<R>(id).await?;
                self.outcome(record, Some(SyncStatus::Synced), None).await
            }
            ConflictResolution::KeepLocal => {
                let conflict = store.conflict_for::<R>(id).await?.ok_or_else(|| {
                    Error::NotFound(format!("conflict log for {}/{id}", R::COLLECTION))
                })?;
                let replay = replay_patch::<R>(&conflict)?;
                {
                    let _shared = self.core.reload_lock.read().await;
                    if !store.accept_remote::<R>(&scope, id).await? {
                        return self.outcome(None, None, None).await;
                    }
                }
                match replay {
                    Some(patch) => self.mutate(id, &patch).await,
                    None => self.delete(id).await,
                }
            }
        }
    }

    async fn settle_write(
        &self,
        scope: &RequestScope,
        replaced: &RecordId,
        server: R,
    ) -> Result<MutationOutcome<R>> {
        let server_id = server.id().clone();
        let _shared = self.core.reload_lock.read().await;
        self.core
            .store
            .write_through(scope, Some(replaced), server)
            .await?;
        let record = self.core.store.get::<R>(&server_id).await?;
        self.outcome(record, Some(SyncStatus::Synced), None).await
    }

    async fn stage(
        &self,
        record: &R,
        op: PendingOp,
        patch: serde_json::Value,
        error: Option<String>,
    ) -> Result<MutationOutcome<R>> {
        let _shared = self.core.reload_lock.read().await;
        let staged = self.core.store.mark_pending(record, op, patch).await?;
        let visible = match staged {
            Some(PendingOp::Delete) | None => None,
            Some(_) => self.core.store.get::<R>(record.id()).await?,
        };
        let status = staged.map(|_| SyncStatus::Pending);
        self.outcome(visible, status, error).await
    }

    async fn outcome(
        &self,
        record: Option<R>,
        sync_status: Option<SyncStatus>,
        error: Option<String>,
    ) -> Result<MutationOutcome<R>> {
        Ok(MutationOutcome {
            record,
            sync_status,
            pending_changes: self.core.store.pending_count().await?,
            error,
        })
    }

    fn write_failed(&self, action: &str, id: &RecordId, error: &RemoteError) -> String {
        tracing::warn!(
            collection = R::COLLECTION,
            record_id = %id,
            "Remote {action} failed, keeping change pending: {error}"
        );
        Error::RemoteWriteFailed(error.to_string()).to_string()
    }
}

/// Patch that replays the losing local operation of `conflict`, or `None`
/// when that operation was a delete.
///
/// Conflicts logged without a pending op fall back to every domain field of
/// the discarded payload.
fn replay_patch<R: SyncRecord>(conflict: &SyncConflict) -> Result<Option<R::Patch>> {
    match (conflict.pending_op, conflict.pending_patch.as_deref()) {
        (Some(PendingOp::Delete), _) => Ok(None),
        (Some(PendingOp::Update), Some(patch)) => Ok(Some(serde_json::from_str(patch)?)),
        _ => local_patch::<R>(&conflict.local_payload).map(Some),
    }
}

/// The domain fields of a discarded local version, as a patch
fn local_patch<R: SyncRecord>(payload: &str) -> Result<R::Patch> {
    let mut fields: serde_json::Value = serde_json::from_str(payload)?;
    if let serde_json::Value::Object(map) = &mut fields {
        for key in ["id", "tenant_id", "owner_id", "last_modified", "sync_status"] {
            map.remove(key);
        }
    }
    Ok(serde_json::from_value(fields)?)
}

async fn run_pull<R: SyncRecord>(
    core: Arc<Core>,
    remote: Arc<dyn RemoteCollection<R>>,
    filters: ListFilters,
) -> Result<Vec<RecordId>> {
    core.gate.await_ready(core.settings.readiness_timeout).await?;
    let scope = core.isolation().scope()?;
    let _shared = core.reload_lock.read().await;
    let _running = core.begin_run();
    pull_into_store(&core, remote.as_ref(), &scope, &filters).await
}

/// Remote list, write-through and sync-time bookkeeping
async fn pull_into_store<R: SyncRecord>(
    core: &Core,
    remote: &dyn RemoteCollection<R>,
    scope: &RequestScope,
    filters: &ListFilters,
) -> Result<Vec<RecordId>> {
    let records = remote
        .list(scope, filters)
        .await
        .map_err(|error| Error::RemoteFetchFailed(error.to_string()))?;
    let ids = records.iter().map(|record| record.id().clone()).collect();
    let report = core.store.upsert_many(scope, records).await?;
    tracing::debug!(
        collection = R::COLLECTION,
        written = report.written,
        kept_local = report.kept_local,
        conflicts = report.conflicts,
        rejected = report.rejected,
        "Pulled remote records"
    );
    core.store
        .record_sync_time(scope, R::COLLECTION, now_millis())
        .await?;
    Ok(ids)
}

#[async_trait]
impl<R: SyncRecord> SyncTarget for CollectionSync<R> {
    fn collection(&self) -> &'static str {
        R::COLLECTION
    }

    async fn flush(&self) -> Result<FlushReport> {
        self.flush_pending().await
    }

    async fn refresh(&self) -> Result<Option<usize>> {
        let view = self.fetch(&self.last_filters()).await?;
        Ok((view.source == DataSource::Remote).then_some(view.data.len()))
    }

    async fn reload_exclusive(&self, scope: &RequestScope) -> Result<usize> {
        let ids = pull_into_store(&self.core, self.remote.as_ref(), scope, &ListFilters::new()).await?;
        let filters = self.last_filters();
        let mut view = self.remote_view(&filters, &ids).await?;
        // Pull is unfiltered; publish only the last requested list
        view.data.retain(|record| record.matches(&filters));
        self.view.send_replace(view);
        Ok(ids.len())
    }

    fn invalidate(&self) {
        self.invalidate_flights();
    }

    fn reset(&self) {
        self.flights.clear();
        *self
            .last_filters
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = ListFilters::new();
        self.view.send_replace(CollectionView::default());
    }
}
