//! Active tenant/owner identity and the scoping derived from it.
//!
//! Every remote call receives an explicit [`RequestScope`] and every local
//! read or write applies an [`IsolationFilter`]; nothing reads identity from
//! ambient transport state.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use crate::error::{Error, Result};
use crate::models::{OwnerId, RecordMeta, TenantId};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const OWNER_HEADER: &str = "x-owner-id";

/// The signed-in farmer and the tenant they act within
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub tenant_id: TenantId,
    pub owner_id: OwnerId,
    pub access_token: Option<String>,
}

impl Identity {
    pub fn new(tenant_id: impl Into<TenantId>, owner_id: impl Into<OwnerId>) -> Result<Self> {
        let tenant_id = tenant_id.into();
        let owner_id = owner_id.into();
        if tenant_id.is_empty() {
            return Err(Error::InvalidInput("tenant id must not be empty".into()));
        }
        if owner_id.is_empty() {
            return Err(Error::InvalidInput("owner id must not be empty".into()));
        }
        Ok(Self {
            tenant_id,
            owner_id,
            access_token: None,
        })
    }

    #[must_use]
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = crate::util::normalize_text_option(Some(token.into()));
        self
    }

    fn same_principal(&self, other: &Self) -> bool {
        self.tenant_id == other.tenant_id && self.owner_id == other.owner_id
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Identity")
            .field("tenant_id", &self.tenant_id)
            .field("owner_id", &self.owner_id)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Predicate every local read and write applies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationFilter {
    pub tenant_id: TenantId,
    pub owner_id: OwnerId,
}

impl IsolationFilter {
    /// Reject metadata that belongs to another tenant or owner
    pub fn check(&self, meta: &RecordMeta) -> Result<()> {
        if meta.tenant_id != self.tenant_id {
            return Err(Error::TenantMismatch {
                expected: self.tenant_id.to_string(),
                found: meta.tenant_id.to_string(),
            });
        }
        if meta.owner_id != self.owner_id {
            return Err(Error::OwnerMismatch {
                expected: self.owner_id.to_string(),
                found: meta.owner_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn admits(&self, meta: &RecordMeta) -> bool {
        self.check(meta).is_ok()
    }
}

/// Credentials and scoping passed explicitly to every remote call
#[derive(Clone, PartialEq, Eq)]
pub struct RequestScope {
    pub tenant_id: TenantId,
    pub owner_id: OwnerId,
    pub access_token: Option<String>,
    /// Identity generation this scope was issued under
    pub epoch: u64,
}

impl RequestScope {
    /// Transport headers representing this scope
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (TENANT_HEADER, self.tenant_id.to_string()),
            (OWNER_HEADER, self.owner_id.to_string()),
        ];
        if let Some(token) = &self.access_token {
            headers.push(("authorization", format!("Bearer {token}")));
        }
        headers
    }

    pub fn filter(&self) -> IsolationFilter {
        IsolationFilter {
            tenant_id: self.tenant_id.clone(),
            owner_id: self.owner_id.clone(),
        }
    }
}

impl fmt::Debug for RequestScope {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RequestScope")
            .field("tenant_id", &self.tenant_id)
            .field("owner_id", &self.owner_id)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("epoch", &self.epoch)
            .finish()
    }
}

/// Outcome of applying a new identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityChange {
    /// Same tenant, owner and credentials
    Unchanged,
    /// Same tenant and owner with new credentials
    Refreshed,
    /// First identity after start-up or logout
    Initial,
    /// A different tenant or owner replaced a previous identity
    Switched { previous: Identity },
}

impl IdentityChange {
    /// Whether the local replica must be wiped before accepting
    pub const fn requires_wipe(&self) -> bool {
        matches!(self, Self::Switched { .. })
    }
}

#[derive(Default)]
struct IsolationState {
    identity: Option<Identity>,
    headers: Vec<(&'static str, String)>,
    epoch: u64,
}

/// Holder of the active identity
#[derive(Default)]
pub struct IsolationContext {
    state: RwLock<IsolationState>,
}

impl IsolationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `identity` against the current one without applying it
    pub fn classify(&self, identity: &Identity) -> IdentityChange {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        match &state.identity {
            None => IdentityChange::Initial,
            Some(current) if current == identity => IdentityChange::Unchanged,
            Some(current) if current.same_principal(identity) => IdentityChange::Refreshed,
            Some(current) => IdentityChange::Switched {
                previous: current.clone(),
            },
        }
    }

    /// Apply `identity`, updating transport headers before returning.
    ///
    /// Callers that need the replica wiped on a switch must do so before
    /// calling this; see `ReplicaStore::switch_identity`.
    pub fn accept(&self, identity: Identity) -> IdentityChange {
        let change = self.classify(&identity);
        if change == IdentityChange::Unchanged {
            return change;
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let scope = RequestScope {
            tenant_id: identity.tenant_id.clone(),
            owner_id: identity.owner_id.clone(),
            access_token: identity.access_token.clone(),
            epoch: state.epoch,
        };
        state.headers = scope.headers();
        if change != IdentityChange::Refreshed {
            state.epoch += 1;
        }
        state.identity = Some(identity);
        change
    }

    /// Drop the active identity and its headers, returning the old one
    pub fn clear(&self) -> Option<Identity> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let previous = state.identity.take();
        state.headers.clear();
        if previous.is_some() {
            state.epoch += 1;
        }
        previous
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .identity
            .clone()
    }

    pub fn is_set(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .identity
            .is_some()
    }

    /// Headers currently attached for outbound calls
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .headers
            .clone()
    }

    /// Generation counter bumped on every tenant/owner change
    pub fn epoch(&self) -> u64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).epoch
    }

    pub fn scope(&self) -> Result<RequestScope> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let identity = state.identity.as_ref().ok_or(Error::IdentityNotReady)?;
        Ok(RequestScope {
            tenant_id: identity.tenant_id.clone(),
            owner_id: identity.owner_id.clone(),
            access_token: identity.access_token.clone(),
            epoch: state.epoch,
        })
    }

    pub fn get_isolation_filter(&self) -> Result<IsolationFilter> {
        self.scope().map(|scope| scope.filter())
    }
}
