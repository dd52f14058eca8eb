//! shamba-core - Core library for Shamba
//!
//! An offline-first, multi-tenant sync engine for farm records. Collections
//! are served from a local libSQL replica, pulled from the remote API when
//! online, and mutations are staged offline and flushed on reconnect.

pub mod collections;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod feed;
pub mod isolation;
pub mod models;
pub mod readiness;
pub mod remote;
pub mod state;
pub mod sync;
pub mod util;

#[cfg(test)]
mod testing;

pub use collections::CollectionAccessor;
pub use config::{EngineConfig, SyncSettings};
pub use connectivity::Connectivity;
pub use engine::SyncEngine;
pub use error::{Error, Result};
pub use isolation::{Identity, IdentityChange, IsolationContext, RequestScope};
pub use models::{
    Land, LandPatch, ListFilters, RecordId, Schedule, SchedulePatch, SyncMetadata, SyncRecord,
    SyncStatus,
};
pub use state::{SyncPhase, SyncState};
pub use sync::{CollectionView, MutationOutcome, RecordView, SyncReport};
