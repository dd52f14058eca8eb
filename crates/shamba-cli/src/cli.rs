use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use shamba_core::models::ConflictResolution;

#[derive(Parser)]
#[command(name = "shamba")]
#[command(about = "Offline-first farm records from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local replica file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Remote API base URL (overrides SHAMBA_API_BASE_URL)
    #[arg(long, global = true, value_name = "URL")]
    pub api_url: Option<String>,

    /// Tenant to act for (overrides SHAMBA_TENANT_ID)
    #[arg(long, global = true, value_name = "ID", requires = "owner")]
    pub tenant: Option<String>,

    /// Owner to act as (overrides SHAMBA_OWNER_ID)
    #[arg(long, global = true, value_name = "ID", requires = "tenant")]
    pub owner: Option<String>,

    /// Never contact the remote API; serve and stage everything locally
    #[arg(long, global = true)]
    pub offline: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List records in a collection
    #[command(alias = "ls")]
    List {
        #[arg(value_enum)]
        collection: CollectionArg,
        /// Field filter, repeatable (e.g. --where crop=maize)
        #[arg(long = "where", value_name = "FIELD=VALUE")]
        filters: Vec<String>,
        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a single record
    Show {
        #[arg(value_enum)]
        collection: CollectionArg,
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create a record
    #[command(alias = "new")]
    Add {
        #[arg(value_enum)]
        collection: CollectionArg,
        /// Field value, repeatable (e.g. --set name="North field")
        #[arg(long = "set", value_name = "FIELD=VALUE", required = true)]
        fields: Vec<String>,
    },
    /// Update fields of an existing record
    Edit {
        #[arg(value_enum)]
        collection: CollectionArg,
        id: String,
        /// Field value, repeatable
        #[arg(long = "set", value_name = "FIELD=VALUE", required = true)]
        fields: Vec<String>,
    },
    /// Delete a record
    Delete {
        #[arg(value_enum)]
        collection: CollectionArg,
        id: String,
    },
    /// Upload pending changes and pull every collection
    Sync,
    /// Wipe the local replica and pull everything again
    Reload,
    /// Show sync state and pending changes
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recently recorded sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Settle a record left in conflict
    Resolve {
        #[arg(value_enum)]
        collection: CollectionArg,
        id: String,
        /// Which version to keep
        #[arg(long, value_enum)]
        keep: KeepArg,
    },
    /// Wipe the local replica and sign out
    Logout,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CollectionArg {
    Lands,
    Schedules,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum KeepArg {
    Local,
    Remote,
}

impl From<KeepArg> for ConflictResolution {
    fn from(keep: KeepArg) -> Self {
        match keep {
            KeepArg::Local => Self::KeepLocal,
            KeepArg::Remote => Self::KeepRemote,
        }
    }
}
