//! Error types for shamba-core

use thiserror::Error;

/// Result type alias using shamba-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shamba-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// No active tenant/owner identity
    #[error("Identity is not set; sign in before accessing collections")]
    IdentityNotReady,

    /// Transport headers were not attached in time
    #[error("Timed out after {0:?} waiting for the transport to become ready")]
    ReadinessTimeout(std::time::Duration),

    /// Remote list/get failed
    #[error("Remote fetch failed: {0}")]
    RemoteFetchFailed(String),

    /// Remote create/update/delete failed
    #[error("Remote write failed: {0}")]
    RemoteWriteFailed(String),

    /// A record or event scoped to a non-active tenant reached the engine
    #[error("Tenant mismatch: expected {expected}, found {found}")]
    TenantMismatch { expected: String, found: String },

    /// A record owned by someone else reached the engine
    #[error("Owner mismatch: expected {expected}, found {found}")]
    OwnerMismatch { expected: String, found: String },

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A spawned sync task panicked or was cancelled
    #[error("Sync task failed: {0}")]
    Task(String),
}

impl Error {
    /// Errors the engine absorbs by falling back to the local replica.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ReadinessTimeout(_) | Self::RemoteFetchFailed(_) | Self::RemoteWriteFailed(_)
        )
    }

    /// Identity and isolation failures. These always refuse the operation.
    pub const fn is_isolation_violation(&self) -> bool {
        matches!(
            self,
            Self::IdentityNotReady | Self::TenantMismatch { .. } | Self::OwnerMismatch { .. }
        )
    }

    /// An owned copy of an isolation violation, for errors shared between
    /// coalesced callers
    pub(crate) fn isolation_copy(&self) -> Option<Self> {
        match self {
            Self::IdentityNotReady => Some(Self::IdentityNotReady),
            Self::TenantMismatch { expected, found } => Some(Self::TenantMismatch {
                expected: expected.clone(),
                found: found.clone(),
            }),
            Self::OwnerMismatch { expected, found } => Some(Self::OwnerMismatch {
                expected: expected.clone(),
                found: found.clone(),
            }),
            _ => None,
        }
    }
}
