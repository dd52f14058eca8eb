use shamba_core::models::SyncRecord;
use shamba_core::{CollectionAccessor, CollectionView, MutationOutcome};

use crate::cli::CollectionArg;
use crate::commands::common::{
    format_record_lines, normalize_record_id, parse_filters, patch_from, require_identity,
    RecordSummary, Session,
};
use crate::error::CliError;

pub async fn run_list(
    session: &Session,
    collection: CollectionArg,
    filters: &[String],
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    require_identity(session)?;
    match collection {
        CollectionArg::Lands => list(&session.lands, filters, limit, as_json).await,
        CollectionArg::Schedules => list(&session.schedules, filters, limit, as_json).await,
    }
}

pub async fn run_show(
    session: &Session,
    collection: CollectionArg,
    id: &str,
    as_json: bool,
) -> Result<(), CliError> {
    require_identity(session)?;
    match collection {
        CollectionArg::Lands => show(&session.lands, id, as_json).await,
        CollectionArg::Schedules => show(&session.schedules, id, as_json).await,
    }
}

pub async fn run_add(
    session: &Session,
    collection: CollectionArg,
    fields: &[String],
) -> Result<(), CliError> {
    require_identity(session)?;
    match collection {
        CollectionArg::Lands => add(&session.lands, fields).await,
        CollectionArg::Schedules => add(&session.schedules, fields).await,
    }
}

pub async fn run_edit(
    session: &Session,
    collection: CollectionArg,
    id: &str,
    fields: &[String],
) -> Result<(), CliError> {
    require_identity(session)?;
    match collection {
        CollectionArg::Lands => edit(&session.lands, id, fields).await,
        CollectionArg::Schedules => edit(&session.schedules, id, fields).await,
    }
}

pub async fn run_delete(
    session: &Session,
    collection: CollectionArg,
    id: &str,
) -> Result<(), CliError> {
    require_identity(session)?;
    let id = normalize_record_id(id)?;
    match collection {
        CollectionArg::Lands => {
            report_outcome(&session.lands.delete(&id).await?, id.as_str());
        }
        CollectionArg::Schedules => {
            report_outcome(&session.schedules.delete(&id).await?, id.as_str());
        }
    }
    Ok(())
}

async fn list<R: SyncRecord + RecordSummary>(
    accessor: &CollectionAccessor<R>,
    filters: &[String],
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let filters = parse_filters(filters)?;
    let mut view = accessor.list(&filters).await?;
    view.data.sort_by(|a, b| b.meta().last_modified.cmp(&a.meta().last_modified));
    view.data.truncate(limit);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&view.data)?);
        return Ok(());
    }

    for line in format_record_lines(&view.data) {
        println!("{line}");
    }
    print_view_notes(&view);
    Ok(())
}

async fn show<R: SyncRecord + RecordSummary>(
    accessor: &CollectionAccessor<R>,
    id: &str,
    as_json: bool,
) -> Result<(), CliError> {
    let id = normalize_record_id(id)?;
    let view = accessor.get(&id).await?;
    let Some(record) = view.data else {
        return Err(CliError::RecordNotFound(id.to_string()));
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        for line in format_record_lines(std::slice::from_ref(&record)) {
            println!("{line}");
        }
        if view.is_stale {
            eprintln!("(served from local replica)");
        }
    }
    Ok(())
}

async fn add<R: SyncRecord>(
    accessor: &CollectionAccessor<R>,
    fields: &[String],
) -> Result<(), CliError> {
    let patch = patch_from::<R>(fields)?;
    let outcome = accessor.create(&patch).await?;
    let id = outcome
        .record
        .as_ref()
        .map(|record| record.id().to_string())
        .unwrap_or_default();
    report_outcome(&outcome, &id);
    Ok(())
}

async fn edit<R: SyncRecord>(
    accessor: &CollectionAccessor<R>,
    id: &str,
    fields: &[String],
) -> Result<(), CliError> {
    let id = normalize_record_id(id)?;
    let patch = patch_from::<R>(fields)?;
    let outcome = accessor.mutate(&id, &patch).await?;
    report_outcome(&outcome, id.as_str());
    Ok(())
}

fn report_outcome<R: SyncRecord>(outcome: &MutationOutcome<R>, id: &str) {
    println!("{id}");
    if outcome.is_pending() {
        eprintln!(
            "Saved locally; {} change(s) waiting for upload",
            outcome.pending_changes
        );
    }
    if let Some(error) = &outcome.error {
        eprintln!("Remote write failed: {error}");
    }
}

fn print_view_notes<R>(view: &CollectionView<R>) {
    if let Some(error) = &view.error {
        eprintln!("Remote unavailable: {error}");
    }
    if view.is_stale {
        eprintln!("(served from local replica)");
    }
    if view.is_expired {
        eprintln!("Local data has not been refreshed recently; run `shamba sync`.");
    }
    if view.pending_changes > 0 {
        eprintln!("{} change(s) waiting for upload", view.pending_changes);
    }
}
