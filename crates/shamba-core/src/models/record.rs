//! The shared syncable record abstraction

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier, trimming surrounding whitespace
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into().trim().to_string())
            }

            /// Borrow the raw identifier
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the identifier is blank
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Tenant (organization) boundary identifier
    TenantId
);
string_id!(
    /// Owning user/farmer identifier
    OwnerId
);
string_id!(
    /// Opaque record identifier, unique within a tenant
    RecordId
);

impl RecordId {
    /// Generate a fresh time-sortable identifier for locally created records
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

/// Per-record synchronization status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Matches the last authoritative remote version
    #[default]
    Synced,
    /// Local edit not yet confirmed by the remote
    Pending,
    /// A remote version replaced a pending local edit
    Conflict,
}

impl SyncStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Conflict => "conflict",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "synced" => Ok(Self::Synced),
            "pending" => Ok(Self::Pending),
            "conflict" => Ok(Self::Conflict),
            other => Err(Error::Database(format!("unknown sync status '{other}'"))),
        }
    }
}

/// Kind of local mutation waiting for upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingOp {
    Create,
    Update,
    Delete,
}

impl PendingOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Combine an already staged operation with a newer one.
    ///
    /// Returns `None` when the pair cancels out (a create that never reached
    /// the remote followed by a delete).
    pub const fn then(self, next: Self) -> Option<Self> {
        match (self, next) {
            (Self::Create, Self::Delete) => None,
            (Self::Create, _) => Some(Self::Create),
            (_, Self::Delete) => Some(Self::Delete),
            (Self::Delete, _) => Some(Self::Delete),
            (Self::Update, _) => Some(Self::Update),
        }
    }
}

impl FromStr for PendingOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::Database(format!("unknown pending op '{other}'"))),
        }
    }
}

/// Fields every syncable record carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    pub id: RecordId,
    pub tenant_id: TenantId,
    pub owner_id: OwnerId,
    /// Last modification timestamp (Unix ms)
    pub last_modified: i64,
    #[serde(default)]
    pub sync_status: SyncStatus,
}

impl RecordMeta {
    /// Metadata for a record created on this device
    pub fn new_local(tenant_id: TenantId, owner_id: OwnerId) -> Self {
        Self {
            id: RecordId::generate(),
            tenant_id,
            owner_id,
            last_modified: crate::util::now_millis(),
            sync_status: SyncStatus::Pending,
        }
    }
}

/// Field-equality filters for `list` requests.
///
/// Sent to the remote as query parameters and evaluated locally against the
/// replica when serving from cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListFilters {
    fields: BTreeMap<String, String>,
}

impl ListFilters {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Stable key used to coalesce identical in-flight requests
    pub fn cache_key(&self) -> String {
        self.iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Evaluate the filters against a serialized record
    pub fn matches_value(&self, value: &serde_json::Value) -> bool {
        self.fields.iter().all(|(field, expected)| {
            match value.get(field) {
                Some(serde_json::Value::String(actual)) => actual == expected,
                Some(serde_json::Value::Null) | None => false,
                Some(other) => other.to_string() == *expected,
            }
        })
    }
}

/// A record type that can live in a synchronized collection.
///
/// The orchestrator and replica store are generic over this trait, so each
/// collection's schema is statically known.
pub trait SyncRecord:
    Clone + fmt::Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Collection (table) name, also used in remote routes and feed events
    const COLLECTION: &'static str;

    /// Partial update shape; unset fields are left untouched
    type Patch: Clone + fmt::Debug + Default + Send + Sync + Serialize + DeserializeOwned + 'static;

    fn meta(&self) -> &RecordMeta;

    fn meta_mut(&mut self) -> &mut RecordMeta;

    /// Apply the set fields of `patch` in place
    fn apply_patch(&mut self, patch: &Self::Patch);

    /// Build a new record from a patch, validating required fields
    fn from_patch(meta: RecordMeta, patch: &Self::Patch) -> Result<Self>;

    fn id(&self) -> &RecordId {
        &self.meta().id
    }

    fn matches(&self, filters: &ListFilters) -> bool {
        if filters.is_empty() {
            return true;
        }
        serde_json::to_value(self).is_ok_and(|value| filters.matches_value(&value))
    }
}
