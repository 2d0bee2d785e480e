//! Causeway CLI
//!
//! Command-line tools for inspecting a replica's sync journal.
//!
//! # Commands
//!
//! - `inspect` - Summarize queue status counts, cursor and parked conflicts
//! - `dump-queue` - List queue items for debugging
//! - `decode-vector` - Decode a compact version vector
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Causeway sync journal tools.
#[derive(Parser)]
#[command(name = "causeway")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the sync journal file
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
    /// Summarize the queue rebuilt from the journal
    Inspect {
        /// List parked conflicts
        #[arg(short, long)]
        parked: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List queue items
    DumpQueue {
        /// Only items with this status (pending, in_progress, completed, failed, parked)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of items to list
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Decode a hex-encoded compact version vector
    DecodeVector {
        /// Encoded vector
        hex: String,

        /// Hex-encoded baseline for delta encodings
        #[arg(short, long)]
        baseline: Option<String>,
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
        Commands::Inspect { parked, format } => {
            let path = cli.journal.ok_or("Journal path required for inspect")?;
            commands::inspect::run(&path, parked, &format)?;
        }
        Commands::DumpQueue {
            status,
            limit,
            format,
        } => {
            let path = cli.journal.ok_or("Journal path required for dump-queue")?;
            commands::dump_queue::run(&path, status.as_deref(), limit, &format)?;
        }
        Commands::DecodeVector { hex, baseline } => {
            commands::decode_vector::run(&hex, baseline.as_deref())?;
        }
        Commands::Version => {
            println!("Causeway CLI v{}", env!("CARGO_PKG_VERSION"));
            println!(
                "Journal format v{}",
                causeway_sync_engine::journal::JOURNAL_VERSION
            );
        }
    }

    Ok(())
}
