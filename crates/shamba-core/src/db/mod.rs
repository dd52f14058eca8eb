//! Local persistence for Shamba

mod connection;
mod migrations;
mod replica;

pub use connection::Database;
pub use replica::{ReplicaStore, StoredRecord, UpsertReport};
