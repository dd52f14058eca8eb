//! Shamba CLI - Command-line interface for offline-first farm records
//!
//! Reads and writes go through the local replica; `shamba sync` reconciles
//! with the remote API.

mod cli;
mod commands;
mod error;


use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::common::{open_session, SessionOptions};
use crate::commands::records::{run_add, run_delete, run_edit, run_list, run_show};
use crate::commands::sync::{
    run_logout, run_reload, run_resolve, run_status, run_sync, run_sync_conflicts,
};
use crate::error::CliError;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shamba=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let session = open_session(&SessionOptions::from_cli(&cli)).await?;

    let result = match cli.command {
        Commands::List {
            collection,
            filters,
            limit,
            json,
        } => run_list(&session, collection, &filters, limit, json).await,
        Commands::Show {
            collection,
            id,
            json,
        } => run_show(&session, collection, &id, json).await,
        Commands::Add { collection, fields } => run_add(&session, collection, &fields).await,
        Commands::Edit {
            collection,
            id,
            fields,
        } => run_edit(&session, collection, &id, &fields).await,
        Commands::Delete { collection, id } => run_delete(&session, collection, &id).await,
        Commands::Sync => run_sync(&session).await,
        Commands::Reload => run_reload(&session).await,
        Commands::Conflicts { limit, json } => run_sync_conflicts(&session, limit, json).await,
        Commands::Resolve {
            collection,
            id,
            keep,
        } => run_resolve(&session, collection, &id, keep.into()).await,
        Commands::Status { json } => run_status(&session, json).await,
        Commands::Logout => run_logout(&session).await,
    };

    session.engine.shutdown();
    result
}
