// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Tidyfold Undo Utility
//!
//! Moves the files of a recorded batch back where they came from. Works
//! straight off the undo log, without the cache or any classifier.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tidyfold::config::AppConfig;
use tidyfold::history::UndoLog;
use tidyfold::reorganize::Reorganizer;
use tidyfold::{Result, TidyfoldError};

#[derive(Parser, Debug)]
#[command(name = "tidyfold-undo")]
#[command(version)]
#[command(about = "Undo Tidyfold batches")]
struct Args {
    /// Path to configuration file (for the default log location)
    #[arg(short, long, default_value = "tidyfold.json")]
    config: PathBuf,

    /// Path to the undo log (overrides config)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Batch to undo (default: newest with moves left to undo)
    #[arg(short, long)]
    batch: Option<String>,

    /// Dry run - show what would be undone without doing it
    #[arg(long)]
    dry_run: bool,

    /// List batches in the log
    #[arg(long)]
    list: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_target(false)
        .init();

    let log_path = match args.log_file {
        Some(path) => path,
        None => AppConfig::load(&args.config)?.history.path,
    };

    if !log_path.exists() {
        eprintln!("Undo log not found: {:?}", log_path);
        eprintln!("Nothing to undo.");
        return Ok(());
    }

    let log = Arc::new(UndoLog::open(&log_path)?);

    if args.list {
        let batches = log.batches()?;
        println!("Batches ({}):", batches.len());
        for batch in batches {
            println!(
                "  {} {} {} moves, {} outstanding, root {}",
                batch.started_at.format("%Y-%m-%d %H:%M:%S"),
                batch.batch_id,
                batch.moves - batch.aborted,
                batch.outstanding(),
                batch.root.display()
            );
        }
        return Ok(());
    }

    let batch = match args.batch {
        Some(batch) => batch,
        None => log
            .latest_undoable()?
            .ok_or_else(|| TidyfoldError::BatchNotFound("no batch left to undo".into()))?,
    };

    println!("Undoing batch {}{}", batch, if args.dry_run { " (dry run)" } else { "" });
    let report = Reorganizer::new(log).undo(&batch, args.dry_run)?;

    for record in &report.restored {
        let verb = if args.dry_run { "Would undo" } else { "Undone" };
        println!("  {}: {} -> {}", verb, record.destination.display(), record.source.display());
    }
    for conflict in &report.conflicts {
        eprintln!("  Skip: {} ({})", conflict.destination.display(), conflict.reason);
    }
    println!(
        "\n{} restored, {} already back, {} conflicts",
        report.restored.len(),
        report.already_reverted.len(),
        report.conflicts.len()
    );

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}
