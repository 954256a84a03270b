//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific
//! modules. Exit codes: 0 success, 2 bad usage, 3 config error, 4
//! transient infra error (caller may retry), 5 fatal.

mod history;
mod ingest;
mod init;
mod ops_cmd;
mod process;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{load_settings_with_options, LoadOptions};
use crate::repository::RepositoryError;

#[derive(Parser, Debug)]
#[command(name = "docmill")]
#[command(about = "Document processing orchestrator")]
#[command(version)]
pub struct Cli {
    /// Data directory (overrides config file)
    #[arg(long, short = 't', global = true)]
    data: Option<PathBuf>,

    /// Config file path (overrides adjacency discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the data directory and database
    Init,

    /// Ingest local files as pending documents
    Ingest {
        /// Files to ingest
        paths: Vec<PathBuf>,
        /// Owning principal (required; writes without an owner are refused)
        #[arg(long)]
        owner: String,
        /// Workspace partition
        #[arg(long, default_value = "default")]
        workspace: String,
        /// Document type for prompt routing (inferred from MIME if omitted)
        #[arg(long)]
        doc_type: Option<String>,
        /// Opaque reference into the originating source system
        #[arg(long)]
        source_ref: Option<String>,
    },

    /// Run one bounded processing batch
    Process {
        /// Maximum documents to process
        #[arg(short, long, default_value = "8")]
        limit: usize,
        /// Restrict to one workspace
        #[arg(long)]
        workspace: Option<String>,
        /// Process exactly one document
        #[arg(long)]
        doc_id: Option<String>,
        /// Suppress the live progress display
        #[arg(short, long)]
        quiet: bool,
    },

    /// Enqueue operator requests and inspect the request queue
    Ops {
        #[command(subcommand)]
        command: OpsCommands,
    },

    /// Show system status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show execution history for a document
    History {
        /// Document id
        #[arg(long)]
        doc_id: String,
        /// Maximum rows shown, newest first
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

/// Common scope flags for operator requests.
#[derive(Debug, clap::Args)]
pub struct OpsScope {
    /// Scope to one workspace
    #[arg(long, conflicts_with = "doc_id")]
    pub workspace: Option<String>,
    /// Scope to one document
    #[arg(long)]
    pub doc_id: Option<String>,
    /// Also run one applier pass in-process after enqueueing
    #[arg(long)]
    pub apply: bool,
}

#[derive(Subcommand, Debug)]
enum OpsCommands {
    /// Request a processing stop
    Stop(OpsScope),
    /// Request a pause (planned maintenance; workers treat it like stop)
    Pause(OpsScope),
    /// Clear a previous stop or pause
    Resume(OpsScope),
    /// Force-release a processing lease
    ReleaseLease(OpsScope),
    /// Reset processing status back to pending
    ResetStatus(OpsScope),
    /// Clear the opaque per-stage output columns
    ResetStages(OpsScope),
    /// List queued requests
    Requests {
        /// Also run one applier pass
        #[arg(long)]
        apply: bool,
    },
}

/// Parse arguments, dispatch, and return the process exit code.
pub async fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return e.exit_code();
        }
    };

    let options = LoadOptions {
        config_path: cli.config,
        data: cli.data,
    };
    let (settings, config) = match load_settings_with_options(options) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return 3;
        }
    };

    let result = match cli.command {
        Commands::Init => init::cmd_init(&settings).await,
        Commands::Ingest {
            paths,
            owner,
            workspace,
            doc_type,
            source_ref,
        } => {
            ingest::cmd_ingest(
                &settings,
                &paths,
                &owner,
                &workspace,
                doc_type.as_deref(),
                source_ref.as_deref(),
            )
            .await
        }
        Commands::Process {
            limit,
            workspace,
            doc_id,
            quiet,
        } => process::cmd_process(&settings, &config, limit, workspace, doc_id, quiet).await,
        Commands::Ops { command } => match command {
            OpsCommands::Stop(scope) => {
                ops_cmd::cmd_enqueue(&settings, crate::models::RequestType::Stop, &scope).await
            }
            OpsCommands::Pause(scope) => {
                ops_cmd::cmd_enqueue(&settings, crate::models::RequestType::Pause, &scope).await
            }
            OpsCommands::Resume(scope) => {
                ops_cmd::cmd_enqueue(&settings, crate::models::RequestType::Resume, &scope).await
            }
            OpsCommands::ReleaseLease(scope) => {
                ops_cmd::cmd_enqueue(&settings, crate::models::RequestType::ReleaseLease, &scope)
                    .await
            }
            OpsCommands::ResetStatus(scope) => ops_cmd::cmd_reset_status(&settings, &scope).await,
            OpsCommands::ResetStages(scope) => {
                ops_cmd::cmd_enqueue(&settings, crate::models::RequestType::ClearStages, &scope)
                    .await
            }
            OpsCommands::Requests { apply } => ops_cmd::cmd_requests(&settings, apply).await,
        },
        Commands::Status { json } => status::cmd_status(&settings, json).await,
        Commands::History { doc_id, limit } => {
            history::cmd_history(&settings, &doc_id, limit).await
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            exit_code_for_error(&e)
        }
    }
}

/// Map an error to the exit-code taxonomy: database/lock trouble is
/// transient (4), everything else is fatal (5).
fn exit_code_for_error(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<RepositoryError>() {
        Some(RepositoryError::Database(_)) => 4,
        _ => 5,
    }
}
