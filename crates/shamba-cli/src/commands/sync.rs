use serde::Serialize;
use shamba_core::models::ConflictResolution;
use shamba_core::SyncReport;

use crate::cli::CollectionArg;
use crate::commands::common::{
    format_sync_conflict_lines, format_sync_timestamp, normalize_record_id, require_identity,
    sync_conflict_to_item, Session, SyncConflictItem,
};
use crate::error::CliError;

pub async fn run_sync(session: &Session) -> Result<(), CliError> {
    require_identity(session)?;
    let report = session.engine.sync_now().await?;
    print_report(&report);
    ensure_complete(&report)
}

pub async fn run_reload(session: &Session) -> Result<(), CliError> {
    require_identity(session)?;
    let report = session.engine.force_full_reload().await?;
    print_report(&report);
    ensure_complete(&report)
}

pub async fn run_sync_conflicts(
    session: &Session,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    require_identity(session)?;
    let conflicts = session.engine.list_conflicts(limit).await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(sync_conflict_to_item)
            .collect::<Vec<SyncConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_resolve(
    session: &Session,
    collection: CollectionArg,
    id: &str,
    resolution: ConflictResolution,
) -> Result<(), CliError> {
    require_identity(session)?;
    let id = normalize_record_id(id)?;
    let outcome = match collection {
        CollectionArg::Lands => session
            .lands
            .resolve(&id, resolution)
            .await?
            .pending_changes,
        CollectionArg::Schedules => session
            .schedules
            .resolve(&id, resolution)
            .await?
            .pending_changes,
    };
    println!("{id}");
    if outcome > 0 {
        eprintln!("{outcome} change(s) waiting for upload");
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct StatusItem {
    pub state: &'static str,
    pub online: bool,
    pub tenant_id: Option<String>,
    pub owner_id: Option<String>,
    pub pending_changes: u64,
    pub last_sync_time: Option<i64>,
    pub last_sync_iso: Option<String>,
}

pub async fn run_status(session: &Session, as_json: bool) -> Result<(), CliError> {
    let engine = &session.engine;
    let identity = engine.isolation().identity();
    let metadata = engine.metadata().await.unwrap_or_default();
    let state = engine.state().await.map_or("offline", |state| state.label());

    let status = StatusItem {
        state,
        online: engine.connectivity().is_online(),
        tenant_id: identity.as_ref().map(|identity| identity.tenant_id.to_string()),
        owner_id: identity.as_ref().map(|identity| identity.owner_id.to_string()),
        pending_changes: metadata.pending_changes,
        last_sync_time: metadata.last_sync_time,
        last_sync_iso: metadata.last_sync_time.map(format_sync_timestamp),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("State:    {}", status.state);
    match (&status.tenant_id, &status.owner_id) {
        (Some(tenant), Some(owner)) => println!("Identity: {owner} @ {tenant}"),
        _ => println!("Identity: not signed in"),
    }
    println!("Pending:  {}", status.pending_changes);
    println!(
        "Synced:   {}",
        status.last_sync_iso.as_deref().unwrap_or("never")
    );
    Ok(())
}

pub async fn run_logout(session: &Session) -> Result<(), CliError> {
    session.engine.clear_identity().await?;
    println!("Local replica wiped");
    Ok(())
}

fn print_report(report: &SyncReport) {
    for entry in &report.collections {
        let mut line = format!(
            "{:<10} uploaded={} pulled={}",
            entry.collection, entry.flush.uploaded, entry.pulled
        );
        if entry.flush.discarded > 0 {
            line.push_str(&format!(" discarded={}", entry.flush.discarded));
        }
        if let Some(error) = &entry.error {
            line.push_str(&format!("  ({error})"));
        }
        println!("{line}");
    }
}

fn ensure_complete(report: &SyncReport) -> Result<(), CliError> {
    if report.is_success() {
        println!("Sync completed");
        return Ok(());
    }
    let failed = report
        .collections
        .iter()
        .filter(|entry| entry.error.is_some())
        .map(|entry| entry.collection)
        .collect::<Vec<_>>()
        .join(", ");
    Err(CliError::SyncIncomplete(failed))
}
