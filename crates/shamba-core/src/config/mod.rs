//! Engine configuration.
//!
//! Values come from `SHAMBA_*` environment variables, validated and
//! range-checked. Consumers may override individual fields after loading.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::isolation::Identity;
use crate::util::is_http_url;

pub const API_BASE_URL_VAR: &str = "SHAMBA_API_BASE_URL";
pub const DB_PATH_VAR: &str = "SHAMBA_DB_PATH";
pub const TENANT_ID_VAR: &str = "SHAMBA_TENANT_ID";
pub const OWNER_ID_VAR: &str = "SHAMBA_OWNER_ID";
pub const ACCESS_TOKEN_VAR: &str = "SHAMBA_ACCESS_TOKEN";

/// Runtime tuning for the orchestrator and change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// Bound on waiting for transport readiness before falling back to cache
    pub readiness_timeout: Duration,
    /// Age after which cached data is reported as expired
    pub freshness: Duration,
    /// Window within which change events for one collection coalesce
    pub feed_debounce: Duration,
    /// Background sync period; `None` disables periodic sync
    pub sync_interval: Option<Duration>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_millis(5_000),
            freshness: Duration::from_secs(900),
            feed_debounce: Duration::from_millis(50),
            sync_interval: Some(Duration::from_secs(60)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Remote API root; `None` runs the engine local-only
    pub api_base_url: Option<String>,
    pub db_path: Option<PathBuf>,
    pub remote_timeout: Duration,
    pub sync: SyncSettings,
    /// Identity to sign in with at start-up (`Debug` redacts the token)
    pub identity: Option<Identity>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: None,
            db_path: None,
            remote_timeout: Duration::from_secs(10),
            sync: SyncSettings::default(),
            identity: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let api_base_url = optional_trimmed(&lookup, API_BASE_URL_VAR)
            .map(|value| value.trim_end_matches('/').to_string());
        if let Some(url) = api_base_url.as_deref() {
            if !is_http_url(url) {
                return Err(Error::Config(format!(
                    "{API_BASE_URL_VAR} must start with http:// or https://"
                )));
            }
        }

        let db_path = optional_trimmed(&lookup, DB_PATH_VAR).map(PathBuf::from);

        let readiness_ms = bounded_u64(
            &lookup,
            "SHAMBA_READINESS_TIMEOUT_MS",
            5_000,
            100..=60_000,
        )?;
        let remote_timeout_secs = bounded_u64(&lookup, "SHAMBA_REMOTE_TIMEOUT_SECS", 10, 1..=120)?;
        let freshness_secs = bounded_u64(&lookup, "SHAMBA_FRESHNESS_SECS", 900, 0..=604_800)?;
        let debounce_ms = bounded_u64(&lookup, "SHAMBA_FEED_DEBOUNCE_MS", 50, 10..=1_000)?;
        let interval_secs = bounded_u64(&lookup, "SHAMBA_SYNC_INTERVAL_SECS", 60, 0..=86_400)?;

        let identity = match (
            optional_trimmed(&lookup, TENANT_ID_VAR),
            optional_trimmed(&lookup, OWNER_ID_VAR),
        ) {
            (Some(tenant), Some(owner)) => {
                let identity = Identity::new(tenant, owner)?;
                Some(match optional_trimmed(&lookup, ACCESS_TOKEN_VAR) {
                    Some(token) => identity.with_access_token(token),
                    None => identity,
                })
            }
            (None, None) => None,
            _ => {
                return Err(Error::Config(format!(
                    "{TENANT_ID_VAR} and {OWNER_ID_VAR} must be set together"
                )))
            }
        };

        Ok(Self {
            api_base_url,
            db_path,
            remote_timeout: Duration::from_secs(remote_timeout_secs),
            sync: SyncSettings {
                readiness_timeout: Duration::from_millis(readiness_ms),
                freshness: Duration::from_secs(freshness_secs),
                feed_debounce: Duration::from_millis(debounce_ms),
                sync_interval: (interval_secs > 0).then_some(Duration::from_secs(interval_secs)),
            },
            identity,
        })
    }
}

fn bounded_u64(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: std::ops::RangeInclusive<u64>,
) -> Result<u64> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let invalid = || {
        Error::Config(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let value = raw.parse::<u64>().map_err(|_| invalid())?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(invalid())
    }
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
