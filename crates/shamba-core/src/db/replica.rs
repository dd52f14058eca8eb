//! Local replica store.
//!
//! Durable per-tenant, per-collection record tables plus the sync metadata
//! singleton. Every write path re-checks the active isolation filter while
//! holding the connection lock, so a record from another tenant or owner can
//! never land in the active view. Mutating methods are crate-private: the
//! orchestrator is the only writer.

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use std::sync::Arc;

use libsql::{params, Connection, Row, Value};
use tokio::sync::Mutex;

use super::Database;
use crate::error::{Error, Result};
use crate::isolation::{Identity, IdentityChange, IsolationContext, IsolationFilter, RequestScope};
use crate::models::{
    OwnerId, PendingOp, RecordId, SyncConflict, SyncMetadata, SyncRecord, SyncStatus, TenantId,
};
use crate::util::{merge_json_objects, now_millis};

const RECORD_COLUMNS: &str = "payload, sync_status, pending_op, pending_patch, is_deleted";

/// A replica row together with its pending-upload bookkeeping
#[derive(Debug, Clone)]
pub struct StoredRecord<R> {
    pub record: R,
    pub pending_op: Option<PendingOp>,
    pub pending_patch: Option<serde_json::Value>,
    pub is_deleted: bool,
}

/// Summary of one `upsert_many` write-through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    /// Rows overwritten with the remote version
    pub written: usize,
    /// Pending local rows newer than the remote version, left untouched
    pub kept_local: usize,
    /// Pending local rows replaced by a newer remote version
    pub conflicts: usize,
    /// Records dropped for belonging to another tenant/owner or a stale identity
    pub rejected: usize,
}

/// Durable local replica scoped by the active identity
#[derive(Clone)]
pub struct ReplicaStore {
    db: Arc<Mutex<Database>>,
    isolation: Arc<IsolationContext>,
}

impl ReplicaStore {
    pub fn new(db: Database, isolation: Arc<IsolationContext>) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            isolation,
        }
    }

    /// Open an in-memory replica (primarily for tests).
    pub async fn open_in_memory(isolation: Arc<IsolationContext>) -> Result<Self> {
        Ok(Self::new(Database::open_in_memory().await?, isolation))
    }

    pub const fn isolation(&self) -> &Arc<IsolationContext> {
        &self.isolation
    }

    /// Apply a new identity, wiping every table first when the tenant or
    /// owner changes. Runs under the connection lock so no write can
    /// interleave between the wipe and the switch.
    ///
    /// A persisted replica remembers its owner, so a first sign-in after a
    /// restart as someone else also wipes.
    pub(crate) async fn switch_identity(&self, identity: Identity) -> Result<IdentityChange> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let change = self.isolation.classify(&identity);
        match &change {
            IdentityChange::Switched { previous } => {
                tracing::info!(
                    "Identity switched from {}/{} to {}/{}; wiping local replica",
                    previous.tenant_id,
                    previous.owner_id,
                    identity.tenant_id,
                    identity.owner_id
                );
                clear_tables(conn).await?;
            }
            IdentityChange::Initial => {
                if let Some((tenant_id, owner_id)) = replica_owner(conn).await? {
                    if tenant_id != identity.tenant_id || owner_id != identity.owner_id {
                        tracing::info!(
                            "Replica belongs to {tenant_id}/{owner_id}, signing in as {}/{}; wiping local replica",
                            identity.tenant_id,
                            identity.owner_id
                        );
                        clear_tables(conn).await?;
                    }
                }
            }
            IdentityChange::Refreshed | IdentityChange::Unchanged => {}
        }
        conn.execute(
            "INSERT INTO replica_identity (id, tenant_id, owner_id) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET tenant_id = excluded.tenant_id, owner_id = excluded.owner_id",
            params![identity.tenant_id.as_str(), identity.owner_id.as_str()],
        )
        .await?;
        self.isolation.accept(identity);
        Ok(change)
    }

    /// Wipe the replica and drop the active identity (logout)
    pub(crate) async fn clear_identity(&self) -> Result<Option<Identity>> {
        let db = self.db.lock().await;
        clear_tables(db.connection()).await?;
        db.connection()
            .execute("DELETE FROM replica_identity", ())
            .await?;
        Ok(self.isolation.clear())
    }

    /// Delete every collection's data and reset sync metadata
    pub(crate) async fn clear_all(&self) -> Result<()> {
        let db = self.db.lock().await;
        clear_tables(db.connection()).await
    }

    /// Visible (non-deleted) records of the active tenant, optionally
    /// restricted to one owner. Order is unspecified.
    pub async fn get_all<R: SyncRecord>(&self, owner_filter: Option<&OwnerId>) -> Result<Vec<R>> {
        let filter = self.isolation.get_isolation_filter()?;
        let db = self.db.lock().await;
        let conn = db.connection();

        let mut rows = if let Some(owner) = owner_filter {
            conn.query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     WHERE tenant_id = ?1 AND collection = ?2 AND owner_id = ?3 AND is_deleted = 0"
                ),
                params![filter.tenant_id.as_str(), R::COLLECTION, owner.as_str()],
            )
            .await?
        } else {
            conn.query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     WHERE tenant_id = ?1 AND collection = ?2 AND is_deleted = 0"
                ),
                params![filter.tenant_id.as_str(), R::COLLECTION],
            )
            .await?
        };

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let stored = parse_stored::<R>(&row)?;
            if stored.record.meta().tenant_id == filter.tenant_id {
                records.push(stored.record);
            } else {
                tracing::error!(
                    collection = R::COLLECTION,
                    record_id = %stored.record.id(),
                    "Replica row payload carries a foreign tenant; skipping"
                );
            }
        }
        Ok(records)
    }

    /// A visible record of the active tenant by id
    pub async fn get<R: SyncRecord>(&self, id: &RecordId) -> Result<Option<R>> {
        Ok(self
            .get_stored::<R>(id)
            .await?
            .filter(|stored| !stored.is_deleted)
            .map(|stored| stored.record))
    }

    /// A record by id including tombstones and pending bookkeeping
    pub(crate) async fn get_stored<R: SyncRecord>(
        &self,
        id: &RecordId,
    ) -> Result<Option<StoredRecord<R>>> {
        let filter = self.isolation.get_isolation_filter()?;
        let db = self.db.lock().await;
        fetch_stored::<R>(db.connection(), &filter.tenant_id, id).await
    }

    /// Rows of this collection waiting for upload
    pub(crate) async fn pending<R: SyncRecord>(&self) -> Result<Vec<StoredRecord<R>>> {
        let filter = self.isolation.get_isolation_filter()?;
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM records
                     WHERE tenant_id = ?1 AND collection = ?2 AND sync_status = 'pending'
                     ORDER BY last_modified ASC"
                ),
                params![filter.tenant_id.as_str(), R::COLLECTION],
            )
            .await?;

        let mut pending = Vec::new();
        while let Some(row) = rows.next().await? {
            pending.push(parse_stored::<R>(&row)?);
        }
        Ok(pending)
    }

    /// Overwrite-by-id write-through of a successful remote fetch.
    ///
    /// Remote versions are stored as `synced`, except where a local pending
    /// edit exists: a newer local edit is kept, an older one is replaced and
    /// logged to `sync_conflicts` with the row marked `conflict`.
    pub(crate) async fn upsert_many<R: SyncRecord>(
        &self,
        scope: &RequestScope,
        records: Vec<R>,
    ) -> Result<UpsertReport> {
        let mut report = UpsertReport::default();
        let db = self.db.lock().await;
        let Some(filter) = self.write_filter(scope)? else {
            tracing::warn!(
                collection = R::COLLECTION,
                "Dropping {} fetched records issued under a previous identity",
                records.len()
            );
            report.rejected = records.len();
            return Ok(report);
        };

        let tx = db.connection().transaction().await?;
        let now = now_millis();
        for mut record in records {
            if let Err(violation) = filter.check(record.meta()) {
                tracing::error!(
                    collection = R::COLLECTION,
                    record_id = %record.id(),
                    "Dropping fetched record outside the active scope: {violation}"
                );
                report.rejected += 1;
                continue;
            }

            let existing = fetch_stored::<R>(&tx, &filter.tenant_id, record.id()).await?;
            match existing {
                Some(local) if local.record.meta().sync_status == SyncStatus::Pending => {
                    if local.record.meta().last_modified > record.meta().last_modified {
                        report.kept_local += 1;
                        continue;
                    }
                    log_conflict(&tx, &local, record.meta().last_modified, now).await?;
                    record.meta_mut().sync_status = SyncStatus::Conflict;
                    put_row(&tx, &record, None, Some(now)).await?;
                    report.conflicts += 1;
                }
                Some(local) if local.record.meta().sync_status == SyncStatus::Conflict => {
                    record.meta_mut().sync_status = SyncStatus::Conflict;
                    put_row(&tx, &record, None, Some(now)).await?;
                    report.written += 1;
                }
                _ => {
                    record.meta_mut().sync_status = SyncStatus::Synced;
                    put_row(&tx, &record, None, Some(now)).await?;
                    report.written += 1;
                }
            }
        }
        refresh_pending_count(&tx).await?;
        tx.commit().await?;

        if report.conflicts > 0 {
            tracing::warn!(
                collection = R::COLLECTION,
                "{} pending local edits lost to newer remote versions",
                report.conflicts
            );
        }
        Ok(report)
    }

    /// Store the server's response to one of our own writes as `synced`,
    /// replacing `replaced_id` when the server assigned a different id.
    ///
    /// Returns `false` when the identity changed while the write was in
    /// flight and the response was dropped.
    pub(crate) async fn write_through<R: SyncRecord>(
        &self,
        scope: &RequestScope,
        replaced_id: Option<&RecordId>,
        mut record: R,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let Some(filter) = self.write_filter(scope)? else {
            tracing::warn!(
                collection = R::COLLECTION,
                record_id = %record.id(),
                "Dropping write response issued under a previous identity"
            );
            return Ok(false);
        };
        if let Err(violation) = filter.check(record.meta()) {
            tracing::error!(
                collection = R::COLLECTION,
                record_id = %record.id(),
                "Refusing write-through outside the active scope: {violation}"
            );
            return Err(violation);
        }

        let tx = db.connection().transaction().await?;
        if let Some(old_id) = replaced_id.filter(|old_id| *old_id != record.id()) {
            delete_row::<R>(&tx, &filter.tenant_id, old_id).await?;
        }
        record.meta_mut().sync_status = SyncStatus::Synced;
        put_row(&tx, &record, None, Some(now_millis())).await?;
        refresh_pending_count(&tx).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Stage a local-only mutation.
    ///
    /// `record` is the locally visible version (patch already applied).
    /// Successive operations on one record collapse into a single pending
    /// op with a merged patch; a never-uploaded create followed by a delete
    /// removes the row. Returns the record's status after staging, or
    /// `None` when the row was removed.
    pub(crate) async fn mark_pending<R: SyncRecord>(
        &self,
        record: &R,
        op: PendingOp,
        patch: serde_json::Value,
    ) -> Result<Option<PendingOp>> {
        let filter = self.isolation.get_isolation_filter()?;
        if let Err(violation) = filter.check(record.meta()) {
            tracing::error!(
                collection = R::COLLECTION,
                record_id = %record.id(),
                "Refusing pending mutation outside the active scope: {violation}"
            );
            return Err(violation);
        }

        let db = self.db.lock().await;
        let tx = db.connection().transaction().await?;
        let existing = fetch_stored::<R>(&tx, &filter.tenant_id, record.id()).await?;
        let (combined, merged_patch) = match existing {
            Some(StoredRecord {
                pending_op: Some(previous),
                pending_patch,
                ..
            }) => {
                let base = pending_patch.unwrap_or_else(|| serde_json::json!({}));
                (previous.then(op), merge_json_objects(&base, &patch))
            }
            _ => (Some(op), patch),
        };

        match combined {
            Some(combined_op) => {
                let mut staged = record.clone();
                staged.meta_mut().sync_status = SyncStatus::Pending;
                put_row(
                    &tx,
                    &staged,
                    Some((combined_op, &merged_patch)),
                    None,
                )
                .await?;
            }
            None => {
                delete_row::<R>(&tx, &filter.tenant_id, record.id()).await?;
            }
        }
        refresh_pending_count(&tx).await?;
        tx.commit().await?;
        Ok(combined)
    }

    /// Physically remove a row after a confirmed remote delete.
    ///
    /// Ignored when `scope` belongs to a previous identity.
    pub(crate) async fn remove<R: SyncRecord>(
        &self,
        scope: &RequestScope,
        id: &RecordId,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let Some(filter) = self.write_filter(scope)? else {
            tracing::warn!(
                collection = R::COLLECTION,
                record_id = %id,
                "Dropping delete confirmation issued under a previous identity"
            );
            return Ok(false);
        };
        let tx = db.connection().transaction().await?;
        let removed = delete_row::<R>(&tx, &filter.tenant_id, id).await?;
        refresh_pending_count(&tx).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Settle a `conflict` row by accepting the stored remote version.
    ///
    /// Ignored when `scope` belongs to a previous identity.
    pub(crate) async fn accept_remote<R: SyncRecord>(
        &self,
        scope: &RequestScope,
        id: &RecordId,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let Some(filter) = self.write_filter(scope)? else {
            return Ok(false);
        };
        let changed = db
            .connection()
            .execute(
                "UPDATE records SET sync_status = 'synced'
                 WHERE tenant_id = ?1 AND collection = ?2 AND id = ?3 AND sync_status = 'conflict'",
                params![filter.tenant_id.as_str(), R::COLLECTION, id.as_str()],
            )
            .await?;
        Ok(changed > 0)
    }

    /// Singleton metadata as persisted; `sync_in_progress` is runtime state
    /// and always `false` here.
    pub async fn metadata(&self) -> Result<SyncMetadata> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT last_sync_time, pending_changes FROM sync_metadata WHERE id = 1",
                (),
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(SyncMetadata::default());
        };
        Ok(SyncMetadata {
            last_sync_time: integer_opt(&row, 0)?,
            pending_changes: u64::try_from(row.get::<i64>(1)?).unwrap_or(0),
            sync_in_progress: false,
        })
    }

    pub async fn pending_count(&self) -> Result<u64> {
        Ok(self.metadata().await?.pending_changes)
    }

    /// Record a successful pull of `collection` at `at` (Unix ms).
    ///
    /// Ignored when `scope` belongs to a previous identity.
    pub(crate) async fn record_sync_time(
        &self,
        scope: &RequestScope,
        collection: &str,
        at: i64,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        if self.write_filter(scope)?.is_none() {
            return Ok(false);
        }
        let tx = db.connection().transaction().await?;
        tx.execute(
            "INSERT INTO collection_sync (collection, last_sync_time) VALUES (?1, ?2)
             ON CONFLICT(collection) DO UPDATE SET last_sync_time = excluded.last_sync_time",
            params![collection, at],
        )
        .await?;
        tx.execute(
            "UPDATE sync_metadata SET last_sync_time = ?1 WHERE id = 1",
            params![at],
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn collection_last_sync(&self, collection: &str) -> Result<Option<i64>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT last_sync_time FROM collection_sync WHERE collection = ?1",
                params![collection],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<i64>(0)?)),
            None => Ok(None),
        }
    }

    /// Recently logged conflicts for the active tenant, newest first
    pub async fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let filter = self.isolation.get_isolation_filter()?;
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT id, collection, record_id, local_modified, incoming_modified,
                        local_payload, resolved_at, strategy, pending_op, pending_patch
                 FROM sync_conflicts
                 WHERE tenant_id = ?1
                 ORDER BY resolved_at DESC, id DESC
                 LIMIT ?2",
                params![filter.tenant_id.as_str(), limit as i64],
            )
            .await?;

        let mut conflicts = Vec::new();
        while let Some(row) = rows.next().await? {
            conflicts.push(parse_conflict(&row)?);
        }
        Ok(conflicts)
    }

    /// Most recent conflict logged for one record
    pub async fn conflict_for<R: SyncRecord>(
        &self,
        id: &RecordId,
    ) -> Result<Option<SyncConflict>> {
        let filter = self.isolation.get_isolation_filter()?;
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT id, collection, record_id, local_modified, incoming_modified,
                        local_payload, resolved_at, strategy, pending_op, pending_patch
                 FROM sync_conflicts
                 WHERE tenant_id = ?1 AND collection = ?2 AND record_id = ?3
                 ORDER BY id DESC
                 LIMIT 1",
                params![filter.tenant_id.as_str(), R::COLLECTION, id.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_conflict(&row)?)),
            None => Ok(None),
        }
    }

    /// Active filter for a write issued under `scope`, or `None` when the
    /// identity changed since `scope` was taken.
    fn write_filter(&self, scope: &RequestScope) -> Result<Option<IsolationFilter>> {
        let current = self.isolation.scope()?;
        if current.epoch != scope.epoch {
            return Ok(None);
        }
        Ok(Some(current.filter()))
    }
}

async fn clear_tables(conn: &Connection) -> Result<()> {
    let tx = conn.transaction().await?;
    tx.execute("DELETE FROM records", ()).await?;
    tx.execute("DELETE FROM collection_sync", ()).await?;
    tx.execute("DELETE FROM sync_conflicts", ()).await?;
    tx.execute(
        "UPDATE sync_metadata SET last_sync_time = NULL, pending_changes = 0 WHERE id = 1",
        (),
    )
    .await?;
    tx.commit().await?;
    tracing::debug!("Local replica cleared");
    Ok(())
}

async fn replica_owner(conn: &Connection) -> Result<Option<(TenantId, OwnerId)>> {
    let mut rows = conn
        .query(
            "SELECT tenant_id, owner_id FROM replica_identity WHERE id = 1",
            (),
        )
        .await?;
    let Some(row) = rows.next().await? else {
        return Ok(None);
    };
    Ok(Some((
        TenantId::new(row.get::<String>(0)?),
        OwnerId::new(row.get::<String>(1)?),
    )))
}

async fn fetch_stored<R: SyncRecord>(
    conn: &Connection,
    tenant_id: &TenantId,
    id: &RecordId,
) -> Result<Option<StoredRecord<R>>> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM records
                 WHERE tenant_id = ?1 AND collection = ?2 AND id = ?3"
            ),
            params![tenant_id.as_str(), R::COLLECTION, id.as_str()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(Some(parse_stored::<R>(&row)?)),
        None => Ok(None),
    }
}

async fn put_row<R: SyncRecord>(
    conn: &Connection,
    record: &R,
    pending: Option<(PendingOp, &serde_json::Value)>,
    synced_at: Option<i64>,
) -> Result<()> {
    let meta = record.meta();
    let payload = serde_json::to_string(record)?;
    let is_deleted = matches!(pending, Some((PendingOp::Delete, _)));
    let (pending_op, pending_patch) = match pending {
        Some((op, patch)) => (
            Value::Text(op.as_str().to_string()),
            Value::Text(serde_json::to_string(patch)?),
        ),
        None => (Value::Null, Value::Null),
    };
    let synced_at = synced_at.map_or(Value::Null, Value::Integer);

    conn.execute(
        "INSERT INTO records (
            tenant_id, collection, id, owner_id, payload, last_modified,
            sync_status, pending_op, pending_patch, is_deleted, synced_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(tenant_id, collection, id) DO UPDATE SET
            owner_id = excluded.owner_id,
            payload = excluded.payload,
            last_modified = excluded.last_modified,
            sync_status = excluded.sync_status,
            pending_op = excluded.pending_op,
            pending_patch = excluded.pending_patch,
            is_deleted = excluded.is_deleted,
            synced_at = COALESCE(excluded.synced_at, records.synced_at)",
        params![
            meta.tenant_id.as_str(),
            R::COLLECTION,
            meta.id.as_str(),
            meta.owner_id.as_str(),
            payload,
            meta.last_modified,
            meta.sync_status.as_str(),
            pending_op,
            pending_patch,
            i64::from(is_deleted),
            synced_at
        ],
    )
    .await?;
    Ok(())
}

async fn delete_row<R: SyncRecord>(
    conn: &Connection,
    tenant_id: &TenantId,
    id: &RecordId,
) -> Result<bool> {
    let removed = conn
        .execute(
            "DELETE FROM records WHERE tenant_id = ?1 AND collection = ?2 AND id = ?3",
            params![tenant_id.as_str(), R::COLLECTION, id.as_str()],
        )
        .await?;
    Ok(removed > 0)
}

async fn log_conflict<R: SyncRecord>(
    conn: &Connection,
    local: &StoredRecord<R>,
    incoming_modified: i64,
    resolved_at: i64,
) -> Result<()> {
    let meta = local.record.meta();
    let pending_op = local
        .pending_op
        .map_or(Value::Null, |op| Value::Text(op.as_str().to_string()));
    let pending_patch = match &local.pending_patch {
        Some(patch) => Value::Text(serde_json::to_string(patch)?),
        None => Value::Null,
    };
    conn.execute(
        "INSERT INTO sync_conflicts (
            tenant_id, collection, record_id, local_modified, incoming_modified,
            local_payload, resolved_at, strategy, pending_op, pending_patch
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'lww', ?8, ?9)",
        params![
            meta.tenant_id.as_str(),
            R::COLLECTION,
            meta.id.as_str(),
            meta.last_modified,
            incoming_modified,
            serde_json::to_string(&local.record)?,
            resolved_at,
            pending_op,
            pending_patch
        ],
    )
    .await?;
    Ok(())
}

async fn refresh_pending_count(conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE sync_metadata
         SET pending_changes = (SELECT COUNT(*) FROM records WHERE sync_status = 'pending')
         WHERE id = 1",
        (),
    )
    .await?;
    Ok(())
}

fn parse_stored<R: SyncRecord>(row: &Row) -> Result<StoredRecord<R>> {
    let payload: String = row.get(0)?;
    let status: String = row.get(1)?;
    let pending_op = text_opt(row, 2)?
        .map(|op| op.parse::<PendingOp>())
        .transpose()?;
    let pending_patch = text_opt(row, 3)?
        .map(|patch| serde_json::from_str::<serde_json::Value>(&patch))
        .transpose()?;
    let is_deleted = row.get::<i64>(4)? != 0;

    let mut record: R = serde_json::from_str(&payload)?;
    record.meta_mut().sync_status = status.parse()?;
    Ok(StoredRecord {
        record,
        pending_op,
        pending_patch,
        is_deleted,
    })
}

fn parse_conflict(row: &Row) -> Result<SyncConflict> {
    Ok(SyncConflict {
        id: row.get(0)?,
        collection: row.get(1)?,
        record_id: row.get(2)?,
        local_modified: row.get(3)?,
        incoming_modified: row.get(4)?,
        local_payload: row.get(5)?,
        resolved_at: row.get(6)?,
        strategy: row.get(7)?,
        pending_op: text_opt(row, 8)?
            .map(|op| op.parse::<PendingOp>())
            .transpose()?,
        pending_patch: text_opt(row, 9)?,
    })
}

fn text_opt(row: &Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Text(text) => Ok(Some(text)),
        other => Err(Error::Database(format!(
            "expected text in column {idx}, found {other:?}"
        ))),
    }
}

fn integer_opt(row: &Row, idx: i32) -> Result<Option<i64>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "expected integer in column {idx}, found {other:?}"
        ))),
    }
}
