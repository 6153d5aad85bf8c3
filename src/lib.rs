//! dupesweep - resumable staged duplicate file remover
//!
//! Files under a root are indexed into a persistent SQLite table, narrowed
//! by size and by a short digest of their first 1024 bytes, and finally
//! verified with a full digest and a byte-exact comparison before the later
//! copy is removed. The index survives interruption, so a large scan can be
//! stopped and resumed.

pub mod cli;
pub mod config;
pub mod duplicates;
pub mod error;
pub mod index;
pub mod logging;
pub mod progress;
pub mod scanner;
pub mod signal;
pub mod store;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use bytesize::ByteSize;

use cli::{Cli, Commands, ScanArgs, StatusArgs};
use config::Config;
use duplicates::{validate_root, Pipeline, PipelineConfig, PipelineSummary};
use error::ExitCode;
use index::{FileIndex, SqliteIndex};
use progress::Progress;
use scanner::Hasher;
use store::OsFileStore;

/// Files SQLite keeps next to the database.
const SQLITE_SIDECARS: [&str; 3] = ["-wal", "-shm", "-journal"];

/// Run the command described by `cli`.
///
/// # Errors
///
/// Fatal errors only; use [`ExitCode::for_error`] to map them.
pub fn run_app(cli: Cli) -> anyhow::Result<ExitCode> {
    logging::init_logging(cli.verbose, cli.quiet);
    let mut config = Config::load(cli.config.as_deref());

    match &cli.command {
        Commands::Scan(args) => {
            config.merge_scan_args(args);
            run_scan(args, &config, cli.quiet)
        }
        Commands::Status(args) => run_status(args, &mut config),
    }
}

fn run_scan(args: &ScanArgs, config: &Config, quiet: bool) -> anyhow::Result<ExitCode> {
    let root = validate_root(&args.path)?;
    let handler = signal::install_handler()?;

    let index = SqliteIndex::open(&config.index_path)
        .with_context(|| format!("Failed to open index {}", config.index_path.display()))?
        .with_write_batch(config.write_batch);
    let output = File::create(&config.output_path)
        .with_context(|| format!("Failed to create {}", config.output_path.display()))?;
    let mut sink = BufWriter::new(output);

    let mut walker_config = config.walker_config();
    for path in own_files(&config.index_path, &config.output_path) {
        walker_config = walker_config.with_excluded(path);
    }

    let mut pipeline_config = PipelineConfig::default()
        .with_reset(args.reset)
        .with_report_only(args.report_only)
        .with_walker_config(walker_config)
        .with_page_size(config.page_size)
        .with_shutdown_flag(handler.get_flag());
    if !quiet && !args.no_progress {
        pipeline_config = pipeline_config.with_progress_callback(Arc::new(Progress::new(false)));
    }

    let store = OsFileStore::new(config.delete_mode());
    let summary = Pipeline::new(pipeline_config).run(
        &root,
        &index,
        &store,
        &Hasher::new(),
        &mut sink,
    )?;
    sink.flush()
        .with_context(|| format!("Failed to write {}", config.output_path.display()))?;

    log_summary(&summary, args.report_only, &config.output_path);
    Ok(ExitCode::for_summary(&summary))
}

fn run_status(args: &StatusArgs, config: &mut Config) -> anyhow::Result<ExitCode> {
    if let Some(index) = &args.index {
        config.index_path = index.clone();
    }
    if !config.index_path.exists() {
        bail!("No index at {}", config.index_path.display());
    }

    let index = SqliteIndex::open(&config.index_path)
        .with_context(|| format!("Failed to open index {}", config.index_path.display()))?;
    let mut out = std::io::stdout().lock();
    writeln!(out, "Index:    {}", config.index_path.display())?;
    match index.generation()? {
        Some(generation) => {
            writeln!(out, "Root:     {}", generation.root.display())?;
            writeln!(out, "Indexed:  {}", generation.indexed_at.to_rfc3339())?;
        }
        None => writeln!(out, "Indexed:  incomplete (next scan re-indexes)")?,
    }
    writeln!(out, "Files:    {}", index.count()?)?;
    writeln!(out, "Digested: {}", index.count_digested()?)?;
    Ok(ExitCode::Success)
}

/// The index database, its sidecars and the report, as the walker sees them.
fn own_files(index_path: &Path, output_path: &Path) -> Vec<PathBuf> {
    let index_path = absolute(index_path);
    let mut paths: Vec<PathBuf> = SQLITE_SIDECARS
        .iter()
        .map(|suffix| {
            let mut name = index_path.as_os_str().to_os_string();
            name.push(suffix);
            PathBuf::from(name)
        })
        .collect();
    paths.push(index_path);
    paths.push(absolute(output_path));
    paths
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn log_summary(summary: &PipelineSummary, report_only: bool, output_path: &Path) {
    let resolve = &summary.resolve;
    if report_only {
        log::info!(
            "{} duplicates listed in {} ({} reclaimable)",
            resolve.duplicates,
            output_path.display(),
            ByteSize::b(resolve.bytes_reclaimed)
        );
    } else {
        log::info!(
            "{} duplicates removed, {} reclaimed, list in {}",
            resolve.removed,
            ByteSize::b(resolve.bytes_reclaimed),
            output_path.display()
        );
    }
    if resolve.failed_removals > 0 {
        log::warn!("{} duplicates could not be removed", resolve.failed_removals);
    }
    if resolve.collisions > 0 {
        log::warn!(
            "{} digest collisions kept (contents differ)",
            resolve.collisions
        );
    }
    let skipped = summary.outcome.errors();
    if skipped > 0 {
        log::warn!("{} entries could not be indexed and were skipped", skipped);
    }
}
