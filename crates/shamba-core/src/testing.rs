//! In-memory remote used by the engine tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::isolation::RequestScope;
use crate::models::{ListFilters, RecordId, SyncRecord, SyncStatus};
use crate::remote::{RemoteCollection, RemoteError, RemoteResult};
use crate::util::now_millis;

/// Scriptable remote collection with call counters
pub(crate) struct FakeRemote<R> {
    records: Mutex<Vec<R>>,
    failing: AtomicBool,
    /// Return every stored record regardless of the request scope
    leaky: AtomicBool,
    latency: Duration,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    write_calls: AtomicUsize,
}

impl<R: SyncRecord> FakeRemote<R> {
    pub(crate) fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    pub(crate) fn with_latency(latency: Duration) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            leaky: AtomicBool::new(false),
            latency,
            list_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn seed(&self, records: impl IntoIterator<Item = R>) {
        self.lock().extend(records);
    }

    /// Insert or replace a record server-side
    pub(crate) fn put(&self, record: R) {
        let mut records = self.lock();
        records.retain(|existing| existing.id() != record.id());
        records.push(record);
    }

    pub(crate) fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn set_leaky(&self, leaky: bool) {
        self.leaky.store(leaky, Ordering::SeqCst);
    }

    pub(crate) fn records(&self) -> Vec<R> {
        self.lock().clone()
    }

    pub(crate) fn list_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn get_count(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn write_count(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<R>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn respond(&self) -> RemoteResult<()> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Network("connection refused".to_string()));
        }
        Ok(())
    }

    fn in_scope(&self, scope: &RequestScope, record: &R) -> bool {
        self.leaky.load(Ordering::SeqCst)
            || (record.meta().tenant_id == scope.tenant_id
                && record.meta().owner_id == scope.owner_id)
    }
}

#[async_trait]
impl<R: SyncRecord> RemoteCollection<R> for FakeRemote<R> {
    async fn list(&self, scope: &RequestScope, filters: &ListFilters) -> RemoteResult<Vec<R>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.respond().await?;
        Ok(self
            .lock()
            .iter()
            .filter(|record| self.in_scope(scope, record) && record.matches(filters))
            .cloned()
            .collect())
    }

    async fn get(&self, scope: &RequestScope, id: &RecordId) -> RemoteResult<Option<R>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.respond().await?;
        Ok(self
            .lock()
            .iter()
            .find(|record| record.id() == id && self.in_scope(scope, record))
            .cloned())
    }

    async fn create(&self, _scope: &RequestScope, record: &R) -> RemoteResult<R> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.respond().await?;
        let mut created = record.clone();
        created.meta_mut().sync_status = SyncStatus::Synced;
        created.meta_mut().last_modified = now_millis();
        self.lock().push(created.clone());
        Ok(created)
    }

    async fn update(
        &self,
        scope: &RequestScope,
        id: &RecordId,
        patch: &R::Patch,
    ) -> RemoteResult<R> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.respond().await?;
        let mut records = self.lock();
        let record = records
            .iter_mut()
            .find(|record| record.id() == id && record.meta().tenant_id == scope.tenant_id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        record.apply_patch(patch);
        record.meta_mut().last_modified = now_millis();
        Ok(record.clone())
    }

    async fn delete(&self, scope: &RequestScope, id: &RecordId) -> RemoteResult<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        self.respond().await?;
        let mut records = self.lock();
        let before = records.len();
        records.retain(|record| !(record.id() == id && record.meta().tenant_id == scope.tenant_id));
        if records.len() == before {
            return Err(RemoteError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
