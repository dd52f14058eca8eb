//! Shared sync state types.

use serde::Serialize;

use crate::models::SyncMetadata;

/// Orchestration run state machine:
/// `Idle -> Running -> {Success, PartialFailure, Fatal} -> Idle`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Running,
    Success,
    PartialFailure,
    Fatal,
}

impl SyncPhase {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::PartialFailure | Self::Fatal)
    }
}

/// Coarse status shown to users.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    /// Local changes are waiting for upload
    Pending,
    Error,
}

impl SyncState {
    pub const fn derive(online: bool, phase: SyncPhase, metadata: &SyncMetadata) -> Self {
        if metadata.sync_in_progress || matches!(phase, SyncPhase::Running) {
            return Self::Syncing;
        }
        if !online {
            return Self::Offline;
        }
        if matches!(phase, SyncPhase::PartialFailure | SyncPhase::Fatal) {
            return Self::Error;
        }
        if metadata.pending_changes > 0 {
            Self::Pending
        } else {
            Self::Synced
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Error => "error",
        }
    }
}
