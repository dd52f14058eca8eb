//! Remote data API seam.
//!
//! Every call takes an explicit [`RequestScope`]; transports never read
//! ambient identity state.

mod http;

use async_trait::async_trait;
use thiserror::Error;

use crate::isolation::RequestScope;
use crate::models::{ListFilters, RecordId, SyncRecord};

pub use http::HttpRemote;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Remote API error: {message}")]
    Status { status: u16, message: String },
    #[error("Remote record not found: {0}")]
    NotFound(String),
    #[error("Invalid remote payload: {0}")]
    InvalidPayload(String),
}

impl RemoteError {
    /// Whether retrying later may succeed
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::NotFound(_) | Self::InvalidPayload(_) => false,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else if error.is_decode() {
            Self::InvalidPayload(error.to_string())
        } else {
            Self::Network(error.to_string())
        }
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Tenant/owner-scoped request-response API for one collection.
///
/// Responses are authoritative. A record missing from a `list` response is
/// not a delete.
#[async_trait]
pub trait RemoteCollection<R: SyncRecord>: Send + Sync {
    async fn list(&self, scope: &RequestScope, filters: &ListFilters) -> RemoteResult<Vec<R>>;

    /// `Ok(None)` when the record does not exist remotely
    async fn get(&self, scope: &RequestScope, id: &RecordId) -> RemoteResult<Option<R>>;

    /// Create `record`, returning the server's version (which may carry a
    /// server-assigned id and timestamp)
    async fn create(&self, scope: &RequestScope, record: &R) -> RemoteResult<R>;

    async fn update(&self, scope: &RequestScope, id: &RecordId, patch: &R::Patch)
        -> RemoteResult<R>;

    async fn delete(&self, scope: &RequestScope, id: &RecordId) -> RemoteResult<()>;
}
