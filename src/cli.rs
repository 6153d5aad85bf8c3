//! Command-line interface definitions for dupesweep.
//!
//! # Example
//!
//! ```bash
//! # Index ~/Pictures into index.db, remove duplicates, list them in duplicates.txt
//! dupesweep scan ~/Pictures
//!
//! # Only report, starting from a fresh index
//! dupesweep scan ~/Pictures --reset --report-only
//!
//! # Resume an interrupted scan with a custom index
//! dupesweep scan ~/Pictures --index /var/tmp/pictures.db
//!
//! # Inspect an existing index
//! dupesweep status --index /var/tmp/pictures.db
//! ```

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Resumable staged duplicate file remover.
///
/// dupesweep indexes a directory tree into a persistent SQLite index, narrows
/// candidates by size and a short digest, and removes only files verified to
/// be byte-for-byte identical to a kept copy.
#[derive(Debug, Parser)]
#[command(name = "dupesweep")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity level (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Print fatal errors as JSON on stderr
    #[arg(long, global = true)]
    pub json_errors: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Index a directory, then report and remove its duplicate files
    Scan(ScanArgs),
    /// Show what an existing index contains
    Status(StatusArgs),
}

/// Arguments for the scan subcommand.
#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Directory path to scan for duplicates
    #[arg(value_name = "PATH")]
    pub path: PathBuf,

    /// Path to the index database [default: index.db]
    #[arg(long, value_name = "FILE")]
    pub index: Option<PathBuf>,

    /// File receiving one duplicate path per line [default: duplicates.txt]
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Discard the existing index and walk the tree again
    #[arg(long)]
    pub reset: bool,

    /// Report duplicates without deleting anything
    #[arg(long)]
    pub report_only: bool,

    /// Move duplicates to the system trash instead of deleting them
    #[arg(long)]
    pub trash: bool,

    /// Skip hidden files and directories (starting with .)
    #[arg(long)]
    pub skip_hidden: bool,

    /// Skip zero-length files
    #[arg(long)]
    pub skip_empty: bool,

    /// Follow symbolic links during scan
    ///
    /// A file reachable through several paths is indexed once, under the
    /// first path in walk order.
    #[arg(long)]
    pub follow_symlinks: bool,

    /// Minimum file size to consider (e.g., 1KB, 1MB, 1GB)
    ///
    /// Supports suffixes: B, KB, KiB, MB, MiB, GB, GiB, TB, TiB
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    pub min_size: Option<u64>,

    /// Maximum file size to consider (e.g., 1KB, 1MB, 1GB)
    ///
    /// Supports suffixes: B, KB, KiB, MB, MiB, GB, GiB, TB, TiB
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    pub max_size: Option<u64>,

    /// Glob patterns to ignore (can be specified multiple times)
    ///
    /// These patterns are added to any configured ones.
    #[arg(short, long = "ignore", value_name = "PATTERN")]
    pub ignore_patterns: Vec<String>,

    /// Rows read from the index per page [default: 1000]
    #[arg(long, value_name = "N", value_parser = parse_page_size)]
    pub page_size: Option<usize>,

    /// Do not draw progress bars
    #[arg(long)]
    pub no_progress: bool,
}

/// Arguments for the status subcommand.
#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Path to the index database [default: index.db]
    #[arg(long, value_name = "FILE")]
    pub index: Option<PathBuf>,
}

/// Parse a human-readable size string into bytes.
///
/// Supports suffixes: B, KB, KiB, MB, MiB, GB, GiB, TB, TiB
/// Case-insensitive. Numbers without suffix are treated as bytes.
///
/// # Examples
///
/// ```
/// use dupesweep::cli::parse_size;
///
/// assert_eq!(parse_size("1024").unwrap(), 1024);
/// assert_eq!(parse_size("1KB").unwrap(), 1000);
/// assert_eq!(parse_size("1KiB").unwrap(), 1024);
/// assert_eq!(parse_size("1MiB").unwrap(), 1_048_576);
/// ```
///
/// # Errors
///
/// Returns an error if the string is empty, contains an invalid number,
/// a negative number, or an unknown size suffix.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Size cannot be empty".to_string());
    }
    if s.starts_with('-') {
        return Err("Size cannot be negative".to_string());
    }

    let (num_str, suffix) = match s.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => (&s[..idx], s[idx..].trim().to_uppercase()),
        None => (s, String::new()),
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number: '{num_str}'"))?;

    let multiplier: u64 = match suffix.as_str() {
        "" | "B" => 1,
        "KB" | "K" => 1_000,
        "KIB" => 1_024,
        "MB" | "M" => 1_000_000,
        "MIB" => 1_048_576,
        "GB" | "G" => 1_000_000_000,
        "GIB" => 1_073_741_824,
        "TB" | "T" => 1_000_000_000_000,
        "TIB" => 1_099_511_627_776,
        _ => return Err(format!("Unknown size suffix: '{suffix}'")),
    };

    Ok((num * multiplier as f64) as u64)
}

fn parse_page_size(s: &str) -> Result<usize, String> {
    match s.trim().parse::<usize>() {
        Ok(0) => Err("Page size must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(_) => Err(format!("Invalid page size: '{s}'")),
    }
}
