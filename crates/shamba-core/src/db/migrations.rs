//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 4;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }
    if version < 3 {
        migrate_v3(conn).await?;
    }
    if version < 4 {
        migrate_v4(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Execute `statements` inside one transaction
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: replica tables and sync bookkeeping
async fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        1,
        &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            // One row per (tenant, collection, record); payload is the full record JSON
            "CREATE TABLE IF NOT EXISTS records (
                tenant_id TEXT NOT NULL,
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                last_modified INTEGER NOT NULL,
                sync_status TEXT NOT NULL DEFAULT 'synced',
                pending_op TEXT,
                pending_patch TEXT,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                synced_at INTEGER,
                PRIMARY KEY (tenant_id, collection, id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_records_owner ON records(tenant_id, collection, owner_id)",
            "CREATE INDEX IF NOT EXISTS idx_records_status ON records(sync_status)",
            // Device-wide singleton
            "CREATE TABLE IF NOT EXISTS sync_metadata (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_sync_time INTEGER,
                pending_changes INTEGER NOT NULL DEFAULT 0
            )",
            "INSERT OR IGNORE INTO sync_metadata (id, last_sync_time, pending_changes) VALUES (1, NULL, 0)",
            "CREATE TABLE IF NOT EXISTS collection_sync (
                collection TEXT PRIMARY KEY,
                last_sync_time INTEGER NOT NULL
            )",
            "INSERT INTO schema_version (version) VALUES (1)",
        ],
    )
    .await
}

/// Migration to version 2: LWW conflict logging support
async fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        2,
        &[
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id TEXT NOT NULL,
                collection TEXT NOT NULL,
                record_id TEXT NOT NULL,
                local_modified INTEGER NOT NULL,
                incoming_modified INTEGER NOT NULL,
                local_payload TEXT NOT NULL,
                resolved_at INTEGER NOT NULL,
                strategy TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record ON sync_conflicts(tenant_id, collection, record_id)",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC)",
            "INSERT INTO schema_version (version) VALUES (2)",
        ],
    )
    .await
}

/// Migration to version 3: remember which identity the replica belongs to
async fn migrate_v3(conn: &Connection) -> Result<()> {
    apply(
        conn,
        3,
        &[
            "CREATE TABLE IF NOT EXISTS replica_identity (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                tenant_id TEXT NOT NULL,
                owner_id TEXT NOT NULL
            )",
            "INSERT INTO schema_version (version) VALUES (3)",
        ],
    )
    .await
}

/// Migration to version 4: keep the losing pending op and patch with each conflict
async fn migrate_v4(conn: &Connection) -> Result<()> {
    apply(
        conn,
        4,
        &[
            "ALTER TABLE sync_conflicts ADD COLUMN pending_op TEXT",
            "ALTER TABLE sync_conflicts ADD COLUMN pending_patch TEXT",
            "INSERT INTO schema_version (version) VALUES (4)",
        ],
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsql::Builder;

    async fn setup() -> Connection {
        let db = Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, name: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
                [name],
            )
            .await
            .unwrap();
        rows.next()
            .await
            .unwrap()
            .is_some_and(|row| row.get::<i32>(0).unwrap() != 0)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_migrations_idempotent() {
        let conn = setup().await;
        run(&conn).await.unwrap();
        run(&conn).await.unwrap(); // Should not fail

        let version = get_version(&conn).await.unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn migrations_create_replica_and_conflict_tables() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        for table in [
            "records",
            "sync_metadata",
            "collection_sync",
            "sync_conflicts",
            "replica_identity",
        ] {
            assert!(table_exists(&conn, table).await, "missing table {table}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_log_keeps_pending_op_columns() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO sync_conflicts (
                tenant_id, collection, record_id, local_modified, incoming_modified,
                local_payload, resolved_at, strategy, pending_op, pending_patch
             ) VALUES ('coop-a', 'lands', 'l-1', 1, 2, '{}', 3, 'lww', 'delete', '{}')",
            (),
        )
        .await
        .unwrap();
        let mut rows = conn
            .query("SELECT pending_op FROM sync_conflicts", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<String>(0).unwrap(), "delete");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn metadata_singleton_is_seeded() {
        let conn = setup().await;
        run(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT COUNT(*), MAX(pending_changes) FROM sync_metadata", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
        assert_eq!(row.get::<i64>(1).unwrap(), 0);
    }
}
