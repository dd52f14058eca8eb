//! Composition root wiring the store, identity, gate, orchestrator and
//! change feed together.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::collections::CollectionAccessor;
use crate::config::SyncSettings;
use crate::connectivity::Connectivity;
use crate::db::{Database, ReplicaStore};
use crate::error::Result;
use crate::feed::{ChangeFeedSubscriber, ChangeFeedTransport};
use crate::isolation::{Identity, IdentityChange, IsolationContext};
use crate::models::{SyncConflict, SyncMetadata, SyncRecord};
use crate::readiness::ReadinessGate;
use crate::remote::RemoteCollection;
use crate::state::{SyncPhase, SyncState};
use crate::sync::{Orchestrator, SyncReport};

/// Offline-first sync engine for one device.
///
/// Register every collection before the first [`SyncEngine::set_identity`];
/// the change feed subscribes to the collections known at that point.
pub struct SyncEngine {
    store: ReplicaStore,
    gate: ReadinessGate,
    connectivity: Connectivity,
    orchestrator: Orchestrator,
    settings: SyncSettings,
    feed: Option<ChangeFeedSubscriber>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Open (or create) the replica at `path`
    pub async fn open(path: impl AsRef<Path>, settings: SyncSettings) -> Result<Self> {
        let db = Database::open_with_recovery(path).await?;
        Ok(Self::with_database(db, settings))
    }

    pub async fn open_in_memory(settings: SyncSettings) -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self::with_database(db, settings))
    }

    pub fn with_database(db: Database, settings: SyncSettings) -> Self {
        let store = ReplicaStore::new(db, Arc::new(IsolationContext::new()));
        let gate = ReadinessGate::new();
        let connectivity = Connectivity::default();
        let orchestrator =
            Orchestrator::new(store.clone(), gate.clone(), connectivity.clone(), settings);
        Self {
            store,
            gate,
            connectivity,
            orchestrator,
            settings,
            feed: None,
            background: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_change_feed(mut self, transport: Arc<dyn ChangeFeedTransport>) -> Self {
        self.feed = Some(ChangeFeedSubscriber::new(
            transport,
            self.orchestrator.clone(),
            self.settings.feed_debounce,
        ));
        self
    }

    pub fn register<R: SyncRecord>(
        &self,
        remote: Arc<dyn RemoteCollection<R>>,
    ) -> Result<CollectionAccessor<R>> {
        self.orchestrator
            .register(remote)
            .map(CollectionAccessor::new)
    }

    /// Sign in as `identity`.
    ///
    /// Switching tenant or owner wipes the replica before the new identity
    /// is accepted. Transport headers are updated before this returns, and
    /// the readiness gate opens afterwards.
    pub async fn set_identity(&self, identity: Identity) -> Result<IdentityChange> {
        if self.store.isolation().classify(&identity) == IdentityChange::Unchanged {
            self.gate.signal_ready();
            return Ok(IdentityChange::Unchanged);
        }

        self.gate.reset();
        if let Some(feed) = &self.feed {
            feed.stop();
        }

        let change = self.store.switch_identity(identity).await?;
        if change != IdentityChange::Refreshed {
            self.orchestrator.reset_collections();
        }
        self.gate.signal_ready();

        let scope = self.store.isolation().scope()?;
        tracing::info!(
            tenant_id = %scope.tenant_id,
            owner_id = %scope.owner_id,
            "Identity set ({})",
            match &change {
                IdentityChange::Initial => "initial",
                IdentityChange::Refreshed => "refreshed",
                IdentityChange::Switched { .. } => "switched",
                IdentityChange::Unchanged => "unchanged",
            }
        );
        if let Some(feed) = &self.feed {
            if let Err(error) = feed.start(scope).await {
                tracing::warn!("Change feed unavailable: {error}");
            }
        }
        Ok(change)
    }

    /// Sign out: wipe the replica and drop the identity
    pub async fn clear_identity(&self) -> Result<()> {
        self.gate.reset();
        if let Some(feed) = &self.feed {
            feed.stop();
        }
        if let Some(previous) = self.store.clear_identity().await? {
            tracing::info!(tenant_id = %previous.tenant_id, "Identity cleared");
        }
        self.orchestrator.reset_collections();
        Ok(())
    }

    /// Flush pending changes and pull every collection (single-flight)
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.orchestrator.sync_all().await
    }

    /// Wipe and re-pull everything, exclusively. User-triggered only.
    pub async fn force_full_reload(&self) -> Result<SyncReport> {
        self.orchestrator.force_full_reload().await
    }

    pub async fn metadata(&self) -> Result<SyncMetadata> {
        self.orchestrator.metadata().await
    }

    pub fn phase(&self) -> watch::Receiver<SyncPhase> {
        self.orchestrator.phase()
    }

    pub async fn state(&self) -> Result<SyncState> {
        let metadata = self.metadata().await?;
        let phase = *self.orchestrator.phase().borrow();
        Ok(SyncState::derive(
            self.connectivity.is_online(),
            phase,
            &metadata,
        ))
    }

    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        self.store.list_conflicts(limit).await
    }

    pub const fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn isolation(&self) -> &Arc<IsolationContext> {
        self.store.isolation()
    }

    pub const fn store(&self) -> &ReplicaStore {
        &self.store
    }

    pub const fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Start periodic sync and sync-on-reconnect. Idempotent.
    pub fn spawn_background(&self) {
        let mut tasks = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return;
        }

        if let Some(period) = self.settings.sync_interval {
            let orchestrator = self.orchestrator.clone();
            let connectivity = self.connectivity.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if connectivity.is_online() && orchestrator.isolation().is_set() {
                        background_sync(&orchestrator, "periodic").await;
                    }
                }
            }));
        }

        let orchestrator = self.orchestrator.clone();
        let mut online = self.connectivity.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut was_online = *online.borrow_and_update();
            while online.changed().await.is_ok() {
                let is_online = *online.borrow_and_update();
                if is_online && !was_online && orchestrator.isolation().is_set() {
                    background_sync(&orchestrator, "reconnect").await;
                }
                was_online = is_online;
            }
        }));
        tracing::debug!("Background sync started");
    }

    /// Stop background work and the change feed
    pub fn shutdown(&self) {
        for task in self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        if let Some(feed) = &self.feed {
            feed.stop();
        }
        tracing::debug!("Sync engine shut down");
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn background_sync(orchestrator: &Orchestrator, trigger: &str) {
    match orchestrator.sync_all().await {
        Ok(report) => tracing::debug!(trigger, phase = ?report.phase, "Background sync finished"),
        Err(error) => tracing::warn!(trigger, "Background sync failed: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::Error;
    use crate::feed::LocalChangeFeed;
    use crate::models::{
        ChangeEnvelope, ChangeKind, ConflictResolution, Land, LandPatch, ListFilters, OwnerId,
        RecordId, RecordMeta, SyncStatus, TenantId,
    };
    use crate::sync::DataSource;
    use crate::testing::FakeRemote;
    use pretty_assertions::assert_eq;

    fn settings() -> SyncSettings {
        SyncSettings {
            readiness_timeout: Duration::from_millis(200),
            freshness: Duration::from_secs(900),
            feed_debounce: Duration::from_millis(30),
            sync_interval: None,
        }
    }

    fn land(tenant: &str, id: &str, name: &str) -> Land {
        Land {
            meta: RecordMeta {
                id: RecordId::new(id),
                tenant_id: TenantId::new(tenant),
                owner_id: OwnerId::new("farmer-1"),
                last_modified: 1_000,
                sync_status: SyncStatus::Synced,
            },
            name: name.to_string(),
            area_hectares: 2.5,
            location: None,
            soil_type: Some("loam".to_string()),
        }
    }

    fn rename(name: &str) -> LandPatch {
        LandPatch {
            name: Some(name.to_string()),
            ..LandPatch::default()
        }
    }

    fn plot(name: &str) -> LandPatch {
        LandPatch {
            name: Some(name.to_string()),
            area_hectares: Some(1.5),
            ..LandPatch::default()
        }
    }

    struct Fixture {
        engine: SyncEngine,
        remote: Arc<FakeRemote<Land>>,
        lands: CollectionAccessor<Land>,
    }

    async fn fixture_with(engine: SyncEngine, remote: FakeRemote<Land>) -> Fixture {
        let remote = Arc::new(remote);
        let lands = engine
            .register::<Land>(Arc::clone(&remote) as Arc<dyn RemoteCollection<Land>>)
            .unwrap();
        engine
            .set_identity(Identity::new("coop-a", "farmer-1").unwrap())
            .await
            .unwrap();
        Fixture {
            engine,
            remote,
            lands,
        }
    }

    async fn fixture(remote: FakeRemote<Land>) -> Fixture {
        let engine = SyncEngine::open_in_memory(settings()).await.unwrap();
        fixture_with(engine, remote).await
    }

    fn sorted(mut records: Vec<Land>) -> Vec<Land> {
        records.sort_by(|a, b| a.meta.id.cmp(&b.meta.id));
        records
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn operations_require_identity() {
        let engine = SyncEngine::open_in_memory(settings()).await.unwrap();
        let lands = engine
            .register::<Land>(Arc::new(FakeRemote::<Land>::new()))
            .unwrap();

        let error = lands.list_all().await.unwrap_err();
        assert!(matches!(error, Error::IdentityNotReady));
        let error = lands.create(&plot("North")).await.unwrap_err();
        assert!(matches!(error, Error::IdentityNotReady));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn registering_a_collection_twice_is_rejected() {
        let engine = SyncEngine::open_in_memory(settings()).await.unwrap();
        engine
            .register::<Land>(Arc::new(FakeRemote::<Land>::new()))
            .unwrap();
        assert!(engine
            .register::<Land>(Arc::new(FakeRemote::<Land>::new()))
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_store_online_list_fetches_once_and_writes_through() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North"), land("coop-a", "l-2", "South")]);
        let fx = fixture(remote).await;

        let view = fx.lands.list_all().await.unwrap();

        assert_eq!(fx.remote.list_count(), 1);
        assert_eq!(view.len(), 2);
        assert_eq!(view.source, DataSource::Remote);
        assert!(!view.is_stale);
        assert!(view
            .data
            .iter()
            .all(|land| land.meta.sync_status == SyncStatus::Synced));
        assert_eq!(fx.engine.store().get_all::<Land>(None).await.unwrap().len(), 2);
        assert!(fx.engine.metadata().await.unwrap().last_sync_time.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn repeated_fetch_is_idempotent() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North"), land("coop-a", "l-2", "South")]);
        let fx = fixture(remote).await;

        fx.lands.list_all().await.unwrap();
        let first = sorted(fx.engine.store().get_all::<Land>(None).await.unwrap());
        let pending_first = fx.engine.metadata().await.unwrap().pending_changes;

        fx.lands.list_all().await.unwrap();
        let second = sorted(fx.engine.store().get_all::<Land>(None).await.unwrap());

        assert_eq!(first, second);
        assert_eq!(
            fx.engine.metadata().await.unwrap().pending_changes,
            pending_first
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overlapping_lists_share_one_remote_call() {
        let remote = FakeRemote::with_latency(Duration::from_millis(80));
        remote.seed([land("coop-a", "l-1", "North")]);
        let fx = fixture(remote).await;

        let (a, b) = tokio::join!(fx.lands.list_all(), fx.lands.list_all());

        assert_eq!(fx.remote.list_count(), 1);
        assert_eq!(a.unwrap().len(), 1);
        assert_eq!(b.unwrap().len(), 1);
        assert!(!fx.engine.metadata().await.unwrap().sync_in_progress);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_in_progress_is_reported_while_a_fetch_runs() {
        let remote = FakeRemote::with_latency(Duration::from_millis(150));
        remote.seed([land("coop-a", "l-1", "North")]);
        let fx = fixture(remote).await;
        assert!(!fx.engine.metadata().await.unwrap().sync_in_progress);

        let (view, during) = tokio::join!(fx.lands.list_all(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            fx.engine.metadata().await.unwrap().sync_in_progress
        });

        assert!(during);
        assert_eq!(view.unwrap().len(), 1);
        assert!(!fx.engine.metadata().await.unwrap().sync_in_progress);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_readiness_gate_falls_back_to_cache_and_stages_edits() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North")]);
        let fx = fixture(remote).await;
        fx.lands.list_all().await.unwrap();
        let lists_before = fx.remote.list_count();

        fx.engine.gate.reset();
        let view = fx.lands.list_all().await.unwrap();
        assert!(fx.engine.connectivity().is_online());
        assert_eq!(view.source, DataSource::Cache);
        assert!(view.is_stale);
        assert!(view.error.is_some());
        assert_eq!(view.len(), 1);
        assert_eq!(fx.remote.list_count(), lists_before);

        let outcome = fx
            .lands
            .mutate(&RecordId::new("l-1"), &rename("North field"))
            .await
            .unwrap();
        assert!(outcome.is_pending());
        assert!(outcome.error.is_some());
        assert_eq!(outcome.pending_changes, 1);
        assert_eq!(fx.remote.write_count(), 0);

        fx.engine.gate.signal_ready();
        fx.engine.sync_now().await.unwrap();
        assert_eq!(fx.remote.records()[0].name, "North field");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn refetch_does_not_join_the_previous_fetch() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North")]);
        let fx = fixture(remote).await;

        fx.lands.list_all().await.unwrap();
        fx.lands.refetch().await.unwrap();
        assert_eq!(fx.remote.list_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_list_serves_cache_without_remote_calls() {
        let remote = FakeRemote::new();
        remote.seed([
            land("coop-a", "l-1", "North"),
            land("coop-a", "l-2", "South"),
            land("coop-a", "l-3", "East"),
        ]);
        let fx = fixture(remote).await;
        fx.lands.list_all().await.unwrap();
        let calls = fx.remote.list_count();

        fx.engine.connectivity().set_online(false);
        let view = fx.lands.list_all().await.unwrap();

        assert_eq!(view.len(), 3);
        assert!(view.is_stale);
        assert!(!view.is_expired);
        assert_eq!(view.source, DataSource::Cache);
        assert_eq!(fx.remote.list_count(), calls);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_cache_filters_locally() {
        let remote = FakeRemote::new();
        let mut clay = land("coop-a", "l-2", "South");
        clay.soil_type = Some("clay".to_string());
        remote.seed([land("coop-a", "l-1", "North"), clay]);
        let fx = fixture(remote).await;
        fx.lands.list_all().await.unwrap();

        fx.engine.connectivity().set_online(false);
        let view = fx
            .lands
            .list(&ListFilters::new().with("soil_type", "clay"))
            .await
            .unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view.data[0].meta.id.as_str(), "l-2");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_failure_falls_back_without_touching_sync_time() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North")]);
        let fx = fixture(remote).await;
        fx.lands.list_all().await.unwrap();
        let last_sync = fx.engine.metadata().await.unwrap().last_sync_time;

        fx.remote.set_failing(true);
        let view = fx.lands.list_all().await.unwrap();

        assert!(view.is_stale);
        assert!(view.error.is_some());
        assert_eq!(view.len(), 1);
        assert_eq!(fx.engine.metadata().await.unwrap().last_sync_time, last_sync);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_mutations_count_distinct_records_and_flush_on_reconnect() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North"), land("coop-a", "l-2", "South")]);
        let fx = fixture(remote).await;
        fx.lands.list_all().await.unwrap();
        let writes_before = fx.remote.write_count();

        fx.engine.connectivity().set_online(false);
        let first = fx
            .lands
            .mutate(&RecordId::new("l-1"), &rename("North field"))
            .await
            .unwrap();
        assert!(first.is_pending());
        assert_eq!(first.pending_changes, 1);
        assert_eq!(
            first.record.as_ref().map(|land| land.name.as_str()),
            Some("North field")
        );

        let again = fx
            .lands
            .mutate(
                &RecordId::new("l-1"),
                &LandPatch {
                    area_hectares: Some(4.0),
                    ..LandPatch::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(again.pending_changes, 1);

        let second = fx
            .lands
            .mutate(&RecordId::new("l-2"), &rename("South field"))
            .await
            .unwrap();
        assert_eq!(second.pending_changes, 2);
        assert_eq!(fx.remote.write_count(), writes_before);

        let visible = fx.lands.get(&RecordId::new("l-1")).await.unwrap();
        assert_eq!(
            visible.data.map(|land| land.meta.sync_status),
            Some(SyncStatus::Pending)
        );

        fx.engine.connectivity().set_online(true);
        let report = fx.engine.sync_now().await.unwrap();

        assert!(report.is_success(), "{report:?}");
        assert_eq!(report.collections[0].flush.uploaded, 2);
        assert_eq!(fx.engine.metadata().await.unwrap().pending_changes, 0);
        let server = fx
            .remote
            .records()
            .into_iter()
            .find(|land| land.meta.id.as_str() == "l-1")
            .unwrap();
        assert_eq!(server.name, "North field");
        assert!((server.area_hectares - 4.0).abs() < f64::EPSILON);
        let synced = fx.engine.store().get::<Land>(&RecordId::new("l-1")).await.unwrap().unwrap();
        assert_eq!(synced.meta.sync_status, SyncStatus::Synced);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_prefers_remote_and_falls_back_offline() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North")]);
        let fx = fixture(remote).await;

        let online = fx.lands.get(&RecordId::new("l-1")).await.unwrap();
        assert_eq!(fx.remote.get_count(), 1);
        assert_eq!(online.source, DataSource::Remote);
        assert_eq!(online.data.map(|land| land.name), Some("North".to_string()));

        fx.engine.connectivity().set_online(false);
        let offline = fx.lands.get(&RecordId::new("l-1")).await.unwrap();
        assert_eq!(fx.remote.get_count(), 1);
        assert!(offline.is_stale);
        assert!(offline.data.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_remote_write_keeps_edit_pending() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North")]);
        let fx = fixture(remote).await;
        fx.lands.list_all().await.unwrap();

        fx.remote.set_failing(true);
        let outcome = fx
            .lands
            .mutate(&RecordId::new("l-1"), &rename("Renamed"))
            .await
            .unwrap();

        assert!(outcome.is_pending());
        assert!(outcome.error.is_some());
        assert_eq!(outcome.pending_changes, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn online_create_writes_through_as_synced() {
        let fx = fixture(FakeRemote::new()).await;
        let outcome = fx
            .lands
            .create(&LandPatch {
                name: Some("New plot".to_string()),
                area_hectares: Some(1.5),
                ..LandPatch::default()
            })
            .await
            .unwrap();

        assert_eq!(outcome.sync_status, Some(SyncStatus::Synced));
        assert_eq!(outcome.pending_changes, 0);
        assert_eq!(fx.remote.records().len(), 1);
        let created = outcome.record.unwrap();
        assert_eq!(created.meta.tenant_id.as_str(), "coop-a");
        assert_eq!(created.meta.owner_id.as_str(), "farmer-1");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_create_then_delete_uploads_nothing() {
        let fx = fixture(FakeRemote::new()).await;
        fx.engine.connectivity().set_online(false);

        let created = fx.lands.create(&plot("Temporary")).await.unwrap();
        assert_eq!(created.pending_changes, 1);
        let id = created.record.unwrap().meta.id;

        let deleted = fx.lands.delete(&id).await.unwrap();
        assert_eq!(deleted.pending_changes, 0);
        assert_eq!(deleted.sync_status, None);

        fx.engine.connectivity().set_online(true);
        fx.engine.sync_now().await.unwrap();
        assert_eq!(fx.remote.write_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn offline_delete_is_hidden_then_uploaded() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North")]);
        let fx = fixture(remote).await;
        fx.lands.list_all().await.unwrap();

        fx.engine.connectivity().set_online(false);
        let outcome = fx.lands.delete(&RecordId::new("l-1")).await.unwrap();
        assert!(outcome.is_pending());
        assert!(outcome.record.is_none());
        assert!(fx.lands.list_all().await.unwrap().is_empty());

        fx.engine.connectivity().set_online(true);
        fx.engine.sync_now().await.unwrap();
        assert!(fx.remote.records().is_empty());
        assert_eq!(fx.engine.metadata().await.unwrap().pending_changes, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn delete_confirmed_after_tenant_switch_leaves_new_tenant_alone() {
        let remote = FakeRemote::with_latency(Duration::from_millis(150));
        remote.seed([land("coop-a", "l-1", "A north")]);
        let fx = fixture(remote).await;
        fx.lands.list_all().await.unwrap();

        let id = RecordId::new("l-1");
        let (deleted, ()) = tokio::join!(fx.lands.delete(&id), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            fx.engine
                .set_identity(Identity::new("coop-b", "farmer-1").unwrap())
                .await
                .unwrap();
            let scope = fx.engine.isolation().scope().unwrap();
            fx.engine
                .store()
                .upsert_many(&scope, vec![land("coop-b", "l-1", "B north")])
                .await
                .unwrap();
        });
        deleted.unwrap();

        let remaining = fx.engine.store().get_all::<Land>(None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].meta.tenant_id.as_str(), "coop-b");
        assert_eq!(remaining[0].name, "B north");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn foreign_records_from_remote_never_reach_the_view() {
        let remote = FakeRemote::new();
        remote.set_leaky(true);
        remote.seed([land("coop-a", "l-1", "Mine"), land("coop-b", "l-9", "Theirs")]);
        let fx = fixture(remote).await;

        let view = fx.lands.list_all().await.unwrap();

        assert_eq!(view.len(), 1);
        assert!(view
            .data
            .iter()
            .all(|land| land.meta.tenant_id.as_str() == "coop-a"));
        let stored = fx.engine.store().get_all::<Land>(None).await.unwrap();
        assert!(stored
            .iter()
            .all(|land| land.meta.tenant_id.as_str() == "coop-a"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tenant_switch_drops_previous_tenant_records() {
        let remote = FakeRemote::new();
        remote.seed([
            land("coop-a", "l-1", "A north"),
            land("coop-a", "l-2", "A south"),
            land("coop-b", "l-7", "B only"),
        ]);
        let fx = fixture(remote).await;
        fx.lands.list_all().await.unwrap();
        let mut views = fx.lands.subscribe();
        assert_eq!(views.borrow_and_update().len(), 2);

        let change = fx
            .engine
            .set_identity(Identity::new("coop-b", "farmer-1").unwrap())
            .await
            .unwrap();
        assert!(change.requires_wipe());
        assert!(views.borrow_and_update().is_empty());
        assert!(fx.engine.store().get_all::<Land>(None).await.unwrap().is_empty());

        fx.engine.connectivity().set_online(false);
        assert!(fx.lands.list_all().await.unwrap().is_empty());

        fx.engine.connectivity().set_online(true);
        let view = fx.lands.list_all().await.unwrap();
        let ids: Vec<_> = view.data.iter().map(|land| land.meta.id.to_string()).collect();
        assert_eq!(ids, vec!["l-7".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn logout_wipes_replica_and_requires_identity() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North")]);
        let fx = fixture(remote).await;
        fx.lands.list_all().await.unwrap();

        fx.engine.clear_identity().await.unwrap();

        assert!(matches!(
            fx.lands.list_all().await.unwrap_err(),
            Error::IdentityNotReady
        ));
        assert_eq!(
            fx.engine.metadata().await.unwrap(),
            SyncMetadata::default()
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn newer_remote_version_over_pending_edit_is_a_resolvable_conflict() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North")]);
        let fx = fixture(remote).await;
        fx.lands.list_all().await.unwrap();

        fx.engine.connectivity().set_online(false);
        fx.lands
            .mutate(&RecordId::new("l-1"), &rename("Local name"))
            .await
            .unwrap();

        let mut newer = land("coop-a", "l-1", "Remote name");
        newer.soil_type = Some("clay".to_string());
        newer.meta.last_modified = crate::util::now_millis() + 60_000;
        fx.remote.put(newer);

        fx.engine.connectivity().set_online(true);
        let view = fx.lands.list_all().await.unwrap();
        assert_eq!(view.data[0].name, "Remote name");
        assert_eq!(view.data[0].meta.sync_status, SyncStatus::Conflict);

        let conflicts = fx.lands.conflicts(10).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].local_payload.contains("Local name"));

        let resolved = fx
            .lands
            .resolve(&RecordId::new("l-1"), ConflictResolution::KeepLocal)
            .await
            .unwrap();
        assert_eq!(resolved.sync_status, Some(SyncStatus::Synced));
        let server = fx.remote.records().pop().unwrap();
        assert_eq!(server.name, "Local name");
        // Only the edited field is replayed
        assert_eq!(server.soil_type.as_deref(), Some("clay"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_local_replays_an_offline_delete() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North")]);
        let fx = fixture(remote).await;
        fx.lands.list_all().await.unwrap();

        fx.engine.connectivity().set_online(false);
        fx.lands.delete(&RecordId::new("l-1")).await.unwrap();

        let mut newer = land("coop-a", "l-1", "North");
        newer.meta.last_modified = crate::util::now_millis() + 60_000;
        fx.remote.put(newer);

        fx.engine.connectivity().set_online(true);
        let view = fx.lands.list_all().await.unwrap();
        assert_eq!(view.data[0].meta.sync_status, SyncStatus::Conflict);

        let resolved = fx
            .lands
            .resolve(&RecordId::new("l-1"), ConflictResolution::KeepLocal)
            .await
            .unwrap();

        assert!(resolved.record.is_none());
        assert_eq!(resolved.pending_changes, 0);
        assert!(fx.remote.records().is_empty());
        assert!(fx
            .engine
            .store()
            .get::<Land>(&RecordId::new("l-1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_reload_replaces_replica_with_remote_state() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North"), land("coop-a", "l-2", "South")]);
        let fx = fixture(remote).await;
        fx.lands.list_all().await.unwrap();

        fx.remote.put(land("coop-a", "l-3", "East"));
        let theirs = RecordId::new("l-1");
        fx.remote
            .delete(&fx.engine.isolation().scope().unwrap(), &theirs)
            .await
            .unwrap();

        // An ordinary pull never treats absence as deletion
        fx.lands.list_all().await.unwrap();
        assert_eq!(fx.engine.store().get_all::<Land>(None).await.unwrap().len(), 3);

        let mut phase = fx.engine.phase();
        let report = fx.engine.force_full_reload().await.unwrap();
        assert!(report.is_success(), "{report:?}");
        assert_eq!(report.collections[0].pulled, 2);
        let ids: Vec<_> = sorted(fx.engine.store().get_all::<Land>(None).await.unwrap())
            .into_iter()
            .map(|land| land.meta.id.to_string())
            .collect();
        assert_eq!(ids, vec!["l-2".to_string(), "l-3".to_string()]);
        assert_eq!(*phase.borrow_and_update(), SyncPhase::Idle);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_reload_keeps_filtered_subscribers_filtered() {
        let remote = FakeRemote::new();
        let mut clay = land("coop-a", "l-2", "South");
        clay.soil_type = Some("clay".to_string());
        remote.seed([land("coop-a", "l-1", "North"), clay]);
        let fx = fixture(remote).await;
        let filters = ListFilters::new().with("soil_type", "clay");
        assert_eq!(fx.lands.list(&filters).await.unwrap().len(), 1);
        let mut views = fx.lands.subscribe();

        fx.engine.force_full_reload().await.unwrap();

        let view = views.borrow_and_update().clone();
        let ids: Vec<_> = view.data.iter().map(|land| land.meta.id.to_string()).collect();
        assert_eq!(ids, vec!["l-2".to_string()]);
        assert_eq!(fx.engine.store().get_all::<Land>(None).await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_reload_refuses_to_wipe_while_offline() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North")]);
        let fx = fixture(remote).await;
        fx.lands.list_all().await.unwrap();

        fx.engine.connectivity().set_online(false);
        assert!(fx.engine.force_full_reload().await.is_err());
        assert_eq!(fx.engine.store().get_all::<Land>(None).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn change_feed_burst_triggers_one_refetch() {
        let feed = LocalChangeFeed::new();
        let engine = SyncEngine::open_in_memory(settings())
            .await
            .unwrap()
            .with_change_feed(Arc::new(feed.clone()));
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North")]);
        let fx = fixture_with(engine, remote).await;
        assert_eq!(fx.remote.list_count(), 0);

        for _ in 0..5 {
            feed.publish(ChangeEnvelope {
                collection: "lands".to_string(),
                event_type: ChangeKind::Update,
                record_id: RecordId::new("l-1"),
                tenant_id: TenantId::new("coop-a"),
            });
        }
        feed.publish(ChangeEnvelope {
            collection: "lands".to_string(),
            event_type: ChangeKind::Insert,
            record_id: RecordId::new("l-9"),
            tenant_id: TenantId::new("coop-b"),
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(fx.remote.list_count(), 1);
        assert_eq!(fx.lands.subscribe().borrow().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn tenant_switch_replaces_change_feed_subscription() {
        let feed = LocalChangeFeed::new();
        let engine = SyncEngine::open_in_memory(settings())
            .await
            .unwrap()
            .with_change_feed(Arc::new(feed.clone()));
        let fx = fixture_with(engine, FakeRemote::new()).await;
        assert_eq!(feed.subscriber_count(), 1);

        fx.engine
            .set_identity(Identity::new("coop-b", "farmer-1").unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(feed.subscriber_count(), 1);

        feed.publish(ChangeEnvelope {
            collection: "lands".to_string(),
            event_type: ChangeKind::Update,
            record_id: RecordId::new("l-1"),
            tenant_id: TenantId::new("coop-a"),
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fx.remote.list_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_triggers_background_sync() {
        let remote = FakeRemote::new();
        remote.seed([land("coop-a", "l-1", "North")]);
        let fx = fixture(remote).await;
        fx.engine.connectivity().set_online(false);
        fx.lands.create(&plot("Offline plot")).await.unwrap();
        fx.engine.spawn_background();

        fx.engine.connectivity().set_online(true);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(fx.engine.metadata().await.unwrap().pending_changes, 0);
        assert_eq!(fx.remote.records().len(), 2);
        fx.engine.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_now_reports_partial_failure_when_remote_is_down() {
        let fx = fixture(FakeRemote::new()).await;
        fx.remote.set_failing(true);

        let report = fx.engine.sync_now().await.unwrap();
        assert_eq!(report.phase, SyncPhase::PartialFailure);
        assert!(report.collections[0].error.is_some());
    }
}
