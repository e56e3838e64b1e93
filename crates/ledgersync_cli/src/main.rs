//! Ledgersync CLI
//!
//! Operator tools for a client's sync queue journal.
//!
//! # Commands
//!
//! - `status` - Show queue counts and the last cycle outcome
//! - `failed` - List entries that failed to push
//! - `retry` - Re-arm a parked entry for another round of attempts
//! - `prune` - Remove synced entries past retention
//! - `compact` - Rewrite the journal as a snapshot
//! - `dump` - Dump journal records for debugging
//!
//! Run these against a journal no application currently has open.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Ledgersync queue journal tools.
#[derive(Parser)]
#[command(name = "ledgersync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the queue journal file
    #[arg(global = true, short, long)]
    journal: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show queue counts and the last cycle outcome
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List entries that failed to push
    Failed {
        /// Only list entries past the retry cap
        #[arg(short, long)]
        parked: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Re-arm a parked entry, clearing its retry count
    Retry {
        /// Entry id
        id: u64,
    },

    /// Remove synced entries older than the retention window
    Prune {
        /// Retention in days (defaults to SYNC_RETENTION_DAYS or 7)
        #[arg(short, long)]
        days: Option<u64>,
    },

    /// Rewrite the journal as a compact snapshot
    Compact {
        /// Dry run - show the current size only
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Dump journal records for debugging
    Dump {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Status { format } => {
            let path = cli.journal.ok_or("Journal path required for status")?;
            commands::status::run(&path, &format)?;
        }
        Commands::Failed { parked, format } => {
            let path = cli.journal.ok_or("Journal path required for failed")?;
            commands::entries::list_failed(&path, parked, &format)?;
        }
        Commands::Retry { id } => {
            let path = cli.journal.ok_or("Journal path required for retry")?;
            commands::entries::retry(&path, id)?;
        }
        Commands::Prune { days } => {
            let path = cli.journal.ok_or("Journal path required for prune")?;
            commands::prune::run(&path, days)?;
        }
        Commands::Compact { dry_run } => {
            let path = cli.journal.ok_or("Journal path required for compact")?;
            commands::compact::run(&path, dry_run)?;
        }
        Commands::Dump { limit, format } => {
            let path = cli.journal.ok_or("Journal path required for dump")?;
            commands::dump::run(&path, limit, &format)?;
        }
        Commands::Version => {
            println!("Ledgersync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Journal format v{}", ledgersync_queue::JOURNAL_VERSION);
        }
    }

    Ok(())
}
