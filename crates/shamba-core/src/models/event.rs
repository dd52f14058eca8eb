//! Change feed event envelopes

use serde::{Deserialize, Serialize};

use super::record::{RecordId, TenantId};

/// Kind of remote mutation announced by the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A push notification about a remote mutation.
///
/// Carries no payload; subscribers re-fetch the collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEnvelope {
    pub collection: String,
    pub event_type: ChangeKind,
    pub record_id: RecordId,
    /// Tenant the channel was keyed by
    pub tenant_id: TenantId,
}
