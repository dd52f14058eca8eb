//! Device-level orchestration: the collection registry, `sync_all` and the
//! exclusive full reload.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock as StdRwLock};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::sync::{watch, RwLock};

use super::collection::CollectionSync;
use crate::config::SyncSettings;
use crate::connectivity::Connectivity;
use crate::db::ReplicaStore;
use crate::error::{Error, Result};
use crate::isolation::{IsolationContext, RequestScope};
use crate::models::{SyncMetadata, SyncRecord};
use crate::readiness::ReadinessGate;
use crate::remote::RemoteCollection;
use crate::state::SyncPhase;

/// Shared state every collection's sync pipeline works against
pub(crate) struct Core {
    pub(crate) store: ReplicaStore,
    pub(crate) gate: ReadinessGate,
    pub(crate) connectivity: Connectivity,
    pub(crate) settings: SyncSettings,
    /// Held shared by pulls and writes, exclusively by a full reload
    pub(crate) reload_lock: RwLock<()>,
    running: AtomicUsize,
}

impl Core {
    pub(crate) fn isolation(&self) -> &Arc<IsolationContext> {
        self.store.isolation()
    }

    pub(crate) fn begin_run(self: &Arc<Self>) -> RunGuard {
        self.running.fetch_add(1, Ordering::SeqCst);
        RunGuard(Arc::clone(self))
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) > 0
    }

    /// Whether a remote call may be issued now.
    ///
    /// `Ok(false)` when the device reports offline; an error when the
    /// transport did not become ready in time.
    pub(crate) async fn remote_available(&self) -> Result<bool> {
        if !self.connectivity.is_online() {
            return Ok(false);
        }
        self.gate.await_ready(self.settings.readiness_timeout).await?;
        Ok(true)
    }
}

/// Marks a sync run in progress for as long as it is alive
pub(crate) struct RunGuard(Arc<Core>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Outcome of uploading one collection's pending rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub uploaded: usize,
    /// Local edits dropped because the record was deleted remotely
    pub discarded: usize,
    pub failed: usize,
}

/// Per-collection part of a [`SyncReport`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub collection: &'static str,
    pub flush: FlushReport,
    /// Records returned by the remote pull
    pub pulled: usize,
    pub error: Option<String>,
}

/// Outcome of one `sync_all` or `force_full_reload` run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub phase: SyncPhase,
    pub collections: Vec<CollectionReport>,
}

impl SyncReport {
    fn finish(mut self, fatal: bool) -> Self {
        self.phase = if fatal {
            SyncPhase::Fatal
        } else if self
            .collections
            .iter()
            .any(|report| report.error.is_some() || report.flush.failed > 0)
        {
            SyncPhase::PartialFailure
        } else {
            SyncPhase::Success
        };
        self
    }

    pub fn is_success(&self) -> bool {
        self.phase == SyncPhase::Success
    }
}

/// Type-erased view of a registered collection
#[async_trait]
pub(crate) trait SyncTarget: Send + Sync {
    fn collection(&self) -> &'static str;

    /// Upload pending rows
    async fn flush(&self) -> Result<FlushReport>;

    /// Refetch with the most recently used filters and publish the view.
    ///
    /// Returns the number of records the remote returned, or `None` when
    /// the view was served from cache.
    async fn refresh(&self) -> Result<Option<usize>>;

    /// Pull everything while the caller holds the reload lock exclusively
    async fn reload_exclusive(&self, scope: &RequestScope) -> Result<usize>;

    /// Supersede running pulls so later callers start a new one
    fn invalidate(&self);

    /// Drop cached views and flights after an identity change
    fn reset(&self);
}

type DeviceFlight = Shared<BoxFuture<'static, SyncReport>>;

struct Inner {
    core: Arc<Core>,
    targets: StdRwLock<Vec<Arc<dyn SyncTarget>>>,
    device_flight: Mutex<Option<DeviceFlight>>,
    phase: watch::Sender<SyncPhase>,
}

impl Inner {
    fn targets(&self) -> Vec<Arc<dyn SyncTarget>> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn target(&self, collection: &str) -> Option<Arc<dyn SyncTarget>> {
        self.targets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|target| target.collection() == collection)
            .cloned()
    }
}

/// The reconciliation engine for every registered collection.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        store: ReplicaStore,
        gate: ReadinessGate,
        connectivity: Connectivity,
        settings: SyncSettings,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            inner: Arc::new(Inner {
                core: Arc::new(Core {
                    store,
                    gate,
                    connectivity,
                    settings,
                    reload_lock: RwLock::new(()),
                    running: AtomicUsize::new(0),
                }),
                targets: StdRwLock::new(Vec::new()),
                device_flight: Mutex::new(None),
                phase,
            }),
        }
    }

    pub(crate) fn register<R: SyncRecord>(
        &self,
        remote: Arc<dyn RemoteCollection<R>>,
    ) -> Result<Arc<CollectionSync<R>>> {
        let mut targets = self
            .inner
            .targets
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if targets
            .iter()
            .any(|target| target.collection() == R::COLLECTION)
        {
            return Err(Error::InvalidInput(format!(
                "collection '{}' is already registered",
                R::COLLECTION
            )));
        }
        let collection = Arc::new(CollectionSync::new(Arc::clone(&self.inner.core), remote));
        targets.push(Arc::clone(&collection) as Arc<dyn SyncTarget>);
        tracing::debug!(collection = R::COLLECTION, "Registered collection");
        Ok(collection)
    }

    /// Names of every registered collection, in registration order
    pub fn collections(&self) -> Vec<&'static str> {
        self.inner
            .targets()
            .iter()
            .map(|target| target.collection())
            .collect()
    }

    pub fn isolation(&self) -> &Arc<IsolationContext> {
        self.inner.core.isolation()
    }

    pub fn store(&self) -> &ReplicaStore {
        &self.inner.core.store
    }

    pub fn is_running(&self) -> bool {
        self.inner.core.is_running()
    }

    pub fn phase(&self) -> watch::Receiver<SyncPhase> {
        self.inner.phase.subscribe()
    }

    /// Persisted metadata with `sync_in_progress` taken from live runs
    pub async fn metadata(&self) -> Result<SyncMetadata> {
        let mut metadata = self.inner.core.store.metadata().await?;
        metadata.sync_in_progress = self.inner.core.is_running();
        Ok(metadata)
    }

    /// Invalidate `collection`'s cached result and refetch it.
    ///
    /// Returns `false` for unknown collections.
    pub async fn invalidate(&self, collection: &str) -> bool {
        let Some(target) = self.inner.target(collection) else {
            tracing::debug!(collection, "Ignoring invalidation for unregistered collection");
            return false;
        };
        target.invalidate();
        if let Err(error) = target.refresh().await {
            tracing::warn!(collection, "Refetch after invalidation failed: {error}");
        }
        true
    }

    /// Drop every collection's cached view after an identity change
    pub(crate) fn reset_collections(&self) {
        for target in self.inner.targets() {
            target.reset();
        }
    }

    /// Flush and pull every collection.
    ///
    /// Overlapping calls coalesce into the same run.
    pub async fn sync_all(&self) -> Result<SyncReport> {
        self.isolation().scope()?;
        let flight = {
            let mut slot = self
                .inner
                .device_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(flight) if flight.peek().is_none() => flight.clone(),
                _ => {
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(run_sync_all(inner));
                    let flight = async move {
                        task.await.unwrap_or_else(|error| {
                            tracing::error!("Sync run aborted: {error}");
                            SyncReport::default().finish(true)
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(flight.clone());
                    flight
                }
            }
        };
        Ok(flight.await)
    }

    /// Wipe the replica and re-pull every collection, exclusively.
    ///
    /// Pending rows get one upload attempt first. Refuses to wipe while the
    /// remote is unreachable.
    pub async fn force_full_reload(&self) -> Result<SyncReport> {
        let core = &self.inner.core;
        core.isolation().scope()?;
        if !core.remote_available().await? {
            return Err(Error::RemoteFetchFailed(
                "device is offline; refusing to wipe the local replica".to_string(),
            ));
        }

        let targets = self.inner.targets();
        let mut report = SyncReport::default();
        for target in &targets {
            let flush = target.flush().await.unwrap_or_else(|error| {
                tracing::warn!(
                    collection = target.collection(),
                    "Upload before full reload failed: {error}"
                );
                FlushReport::default()
            });
            report.collections.push(CollectionReport {
                collection: target.collection(),
                flush,
                ..CollectionReport::default()
            });
        }

        self.inner.phase.send_replace(SyncPhase::Running);
        let _exclusive = core.reload_lock.write().await;
        let _running = core.begin_run();
        let scope = match core.isolation().scope() {
            Ok(scope) => scope,
            Err(error) => {
                self.settle(SyncPhase::Fatal);
                return Err(error);
            }
        };

        tracing::info!("Full reload: wiping local replica");
        if let Err(error) = core.store.clear_all().await {
            self.settle(SyncPhase::Fatal);
            return Err(error);
        }

        let mut fatal = false;
        for (target, entry) in targets.iter().zip(report.collections.iter_mut()) {
            target.invalidate();
            match target.reload_exclusive(&scope).await {
                Ok(pulled) => entry.pulled = pulled,
                Err(error) => {
                    fatal |= error.is_isolation_violation();
                    tracing::warn!(
                        collection = target.collection(),
                        "Full reload pull failed: {error}"
                    );
                    entry.error = Some(error.to_string());
                }
            }
        }

        let report = report.finish(fatal);
        tracing::info!(phase = ?report.phase, "Full reload finished");
        self.settle(report.phase);
        Ok(report)
    }

    fn settle(&self, outcome: SyncPhase) {
        self.inner.phase.send_replace(outcome);
        self.inner.phase.send_replace(SyncPhase::Idle);
    }
}

async fn run_sync_all(inner: Arc<Inner>) -> SyncReport {
    inner.phase.send_replace(SyncPhase::Running);
    let _running = inner.core.begin_run();

    let mut report = SyncReport::default();
    let mut fatal = false;
    for target in inner.targets() {
        let mut entry = CollectionReport {
            collection: target.collection(),
            ..CollectionReport::default()
        };

        match target.flush().await {
            Ok(flush) => entry.flush = flush,
            Err(error) => {
                fatal |= error.is_isolation_violation();
                entry.error = Some(error.to_string());
            }
        }

        match target.refresh().await {
            Ok(Some(pulled)) => entry.pulled = pulled,
            Ok(None) => {
                entry
                    .error
                    .get_or_insert_with(|| "served from local replica".to_string());
            }
            Err(error) => {
                fatal |= error.is_isolation_violation();
                entry.error = Some(error.to_string());
            }
        }

        report.collections.push(entry);
    }

    let report = report.finish(fatal);
    tracing::debug!(phase = ?report.phase, "Sync run finished");
    inner.phase.send_replace(report.phase);
    inner.phase.send_replace(SyncPhase::Idle);
    report
}
