use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use shamba_core::models::{Land, ListFilters, RecordId, Schedule, SyncConflict, SyncRecord};
use shamba_core::remote::HttpRemote;
use shamba_core::{CollectionAccessor, EngineConfig, Identity, SyncEngine};

use crate::cli::Cli;
use crate::error::CliError;

/// Base URL handed to the transport when no API is configured; the engine
/// stays offline so it is never contacted.
const LOCAL_ONLY_BASE_URL: &str = "http://localhost";

/// Global flags that shape how the engine is opened
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub db_path: Option<PathBuf>,
    pub api_url: Option<String>,
    pub tenant: Option<String>,
    pub owner: Option<String>,
    pub offline: bool,
}

impl SessionOptions {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            db_path: cli.db_path.clone(),
            api_url: cli.api_url.clone(),
            tenant: cli.tenant.clone(),
            owner: cli.owner.clone(),
            offline: cli.offline,
        }
    }
}

pub struct Session {
    pub engine: SyncEngine,
    pub lands: CollectionAccessor<Land>,
    pub schedules: CollectionAccessor<Schedule>,
}

pub async fn open_session(options: &SessionOptions) -> Result<Session, CliError> {
    let config = EngineConfig::from_env()?;
    open_session_with(config, options).await
}

pub async fn open_session_with(
    mut config: EngineConfig,
    options: &SessionOptions,
) -> Result<Session, CliError> {
    apply_overrides(&mut config, options)?;

    let db_path = match config.db_path.clone() {
        Some(path) => path,
        None => default_db_path()?,
    };
    // One-shot process; periodic sync would never fire
    config.sync.sync_interval = None;
    let engine = SyncEngine::open(&db_path, config.sync).await?;

    let base_url = config.api_base_url.as_deref().unwrap_or(LOCAL_ONLY_BASE_URL);
    let remote = Arc::new(HttpRemote::new(base_url, config.remote_timeout)?);
    let lands = engine.register::<Land>(remote.clone())?;
    let schedules = engine.register::<Schedule>(remote)?;

    if options.offline || config.api_base_url.is_none() {
        engine.connectivity().set_online(false);
    }
    if let Some(identity) = config.identity {
        engine.set_identity(identity).await?;
    }

    Ok(Session {
        engine,
        lands,
        schedules,
    })
}

fn apply_overrides(config: &mut EngineConfig, options: &SessionOptions) -> Result<(), CliError> {
    if let Some(path) = &options.db_path {
        config.db_path = Some(path.clone());
    }
    if let Some(url) = options.api_url.as_deref().map(str::trim) {
        if !shamba_core::util::is_http_url(url) {
            return Err(shamba_core::Error::Config(
                "--api-url must start with http:// or https://".to_string(),
            )
            .into());
        }
        config.api_base_url = Some(url.trim_end_matches('/').to_string());
    }
    if let (Some(tenant), Some(owner)) = (&options.tenant, &options.owner) {
        let identity = Identity::new(tenant.as_str(), owner.as_str())?;
        let token = config
            .identity
            .take()
            .and_then(|current| current.access_token);
        config.identity = Some(match token {
            Some(token) => identity.with_access_token(token),
            None => identity,
        });
    }
    Ok(())
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("shamba").join("shamba.db"))
        .ok_or_else(|| CliError::Config("failed to resolve a data directory".to_string()))
}

pub fn require_identity(session: &Session) -> Result<(), CliError> {
    if session.engine.isolation().is_set() {
        Ok(())
    } else {
        Err(CliError::IdentityMissing)
    }
}

pub fn normalize_record_id(raw: &str) -> Result<RecordId, CliError> {
    let id = RecordId::new(raw);
    if id.is_empty() {
        return Err(CliError::EmptyRecordId);
    }
    Ok(id)
}

/// Split `FIELD=VALUE` assignments into a JSON object.
///
/// Values that parse as JSON scalars (`2.5`, `true`, `null`) keep their
/// type; anything else is taken as a string.
pub fn parse_assignments(raw: &[String]) -> Result<Map<String, Value>, CliError> {
    let mut fields = Map::new();
    for assignment in raw {
        let (field, value) = split_assignment(assignment)?;
        fields.insert(field.to_string(), parse_value(value));
    }
    Ok(fields)
}

pub fn parse_filters(raw: &[String]) -> Result<ListFilters, CliError> {
    raw.iter().try_fold(ListFilters::new(), |filters, assignment| {
        let (field, value) = split_assignment(assignment)?;
        Ok(filters.with(field, value))
    })
}

/// Build a typed patch from assignments, rejecting unknown or mistyped fields
pub fn patch_from<R: SyncRecord>(raw: &[String]) -> Result<R::Patch, CliError> {
    let fields = parse_assignments(raw)?;
    serde_json::from_value(Value::Object(fields)).map_err(|error| CliError::InvalidFields {
        collection: R::COLLECTION,
        message: error.to_string(),
    })
}

fn split_assignment(assignment: &str) -> Result<(&str, &str), CliError> {
    assignment
        .split_once('=')
        .map(|(field, value)| (field.trim(), value.trim()))
        .filter(|(field, _)| !field.is_empty())
        .ok_or_else(|| CliError::InvalidAssignment(assignment.to_string()))
}

fn parse_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => value,
        _ => Value::String(raw.to_string()),
    }
}

/// One-line rendering of a record for terminal listings
pub trait RecordSummary {
    fn summary(&self) -> String;
}

impl RecordSummary for Land {
    fn summary(&self) -> String {
        let soil = self.soil_type.as_deref().unwrap_or("-");
        format!("{}  {:.2} ha  soil={soil}", self.name, self.area_hectares)
    }
}

impl RecordSummary for Schedule {
    fn summary(&self) -> String {
        let done = if self.completed { "done" } else { "open" };
        format!(
            "{} {}  {}  land={}  {done}",
            self.activity,
            self.crop,
            format_date(self.scheduled_for),
            short_id(self.land_id.as_str())
        )
    }
}

#[derive(Debug, Serialize)]
pub struct SyncConflictItem {
    pub id: i64,
    pub collection: String,
    pub record_id: String,
    pub local_modified: i64,
    pub incoming_modified: i64,
    pub resolved_at: i64,
    pub resolved_at_iso: String,
    pub strategy: String,
}

pub fn sync_conflict_to_item(conflict: &SyncConflict) -> SyncConflictItem {
    SyncConflictItem {
        id: conflict.id,
        collection: conflict.collection.clone(),
        record_id: conflict.record_id.clone(),
        local_modified: conflict.local_modified,
        incoming_modified: conflict.incoming_modified,
        resolved_at: conflict.resolved_at,
        resolved_at_iso: format_sync_timestamp(conflict.resolved_at),
        strategy: conflict.strategy.clone(),
    }
}

pub fn format_record_lines<R: SyncRecord + RecordSummary>(records: &[R]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let meta = record.meta();
            format!(
                "{}  {:<8}  {:<8}  {}",
                short_id(meta.id.as_str()),
                meta.sync_status.as_str(),
                format_relative_time(meta.last_modified, now_ms),
                record.summary()
            )
        })
        .collect()
}

pub fn format_sync_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<4}  {}/{}  local={} incoming={}",
                format_sync_timestamp(conflict.resolved_at),
                conflict.strategy,
                conflict.collection,
                conflict.record_id,
                conflict.local_modified,
                conflict.incoming_modified
            )
        })
        .collect()
}

pub fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

fn format_date(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
