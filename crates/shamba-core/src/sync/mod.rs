//! Sync orchestration: single-flight pulls, write-through, pending uploads,
//! and the device-wide full reload.

mod collection;
mod flight;
mod orchestrator;
mod view;

pub(crate) use collection::CollectionSync;
pub use orchestrator::{CollectionReport, FlushReport, Orchestrator, SyncReport};
pub use view::{CollectionView, DataSource, MutationOutcome, RecordView};
