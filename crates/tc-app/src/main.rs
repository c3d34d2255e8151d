//! `tabcache`: build, inspect and watch paged table caches from the command line

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Paged spreadsheet cache tool
#[derive(Parser, Debug)]
#[command(name = "tabcache", version, about = "Paged spreadsheet cache")]
pub struct Cli {
    /// Directory holding one cache directory per dataset
    #[arg(long, global = true)]
    pub cache_root: Option<PathBuf>,

    /// JSON cache configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory searched first for origin documents
    #[arg(long, global = true, default_value = ".")]
    pub data_dir: PathBuf,

    /// Fallback directory with bundled origin documents
    #[arg(long, global = true)]
    pub bundled_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build (or refresh) the cache for a table
    Build {
        #[command(flatten)]
        table: TableArgs,

        /// Rows per page; defaults to the configured page size
        #[arg(long)]
        page_size: Option<usize>,

        /// Rebuild even when the cache matches its origin
        #[arg(long)]
        force: bool,
    },
    /// Print a range of rows as JSON lines
    Read {
        #[command(flatten)]
        table: TableArgs,

        #[arg(long, default_value_t = 0)]
        start: usize,

        #[arg(long, default_value_t = 20)]
        count: usize,

        /// Parse the origin directly instead of using the cache
        #[arg(long)]
        live: bool,
    },
    /// Print rows containing a substring (case-insensitive)
    Search {
        #[command(flatten)]
        table: TableArgs,

        query: String,

        /// Restrict the match to this column
        #[arg(long)]
        column: Option<String>,
    },
    /// Show cache health and staleness
    Status {
        #[command(flatten)]
        table: TableArgs,
    },
    /// Rebuild the cache whenever the origin changes, until interrupted
    Watch {
        #[command(flatten)]
        table: TableArgs,

        /// Seconds between origin checks
        #[arg(long, default_value_t = 5)]
        interval: u64,
    },
    /// Trim the cache root to its size budget
    Evict,
}

/// Origin document and table name
#[derive(clap::Args, Debug, Clone)]
pub struct TableArgs {
    /// Origin path relative to the data directory
    pub path: String,

    /// Sheet name inside the origin
    pub table: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::run(cli)
}
