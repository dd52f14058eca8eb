use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] shamba_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Expected FIELD=VALUE, got '{0}'")]
    InvalidAssignment(String),
    #[error("Invalid fields for {collection}: {message}")]
    InvalidFields {
        collection: &'static str,
        message: String,
    },
    #[error("Record ID cannot be empty")]
    EmptyRecordId,
    #[error("Record not found: {0}")]
    RecordNotFound(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "No identity configured. Set SHAMBA_TENANT_ID and SHAMBA_OWNER_ID, or pass --tenant and --owner."
    )]
    IdentityMissing,
    #[error("Sync finished with errors: {0}")]
    SyncIncomplete(String),
}
