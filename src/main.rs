// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Tidyfold: sort a directory's files into category folders

use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use tidyfold::config::{AppConfig, ClassifierPreference};
use tidyfold::credentials::{self, CredentialStore};
use tidyfold::reorganize::{MoveOutcome, UndoReport};
use tidyfold::run::{cancel_on_signal, Engine, RunRequest, RunSummary};
use tidyfold::{Result, TidyfoldError};

/// Tidyfold CLI - classify files and sort them into folders
#[derive(Parser, Debug)]
#[command(name = "tidyfold")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version)]
#[command(about = "Classify files and sort them into category folders, with undo", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (JSON format)
    #[arg(short, long, default_value = "tidyfold.json", global = true)]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Output format for results
    #[arg(long, global = true, default_value = "text", value_parser = ["text", "json"])]
    format: String,

    /// Suppress non-essential output (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify the files in a directory and move them into category folders
    Organize {
        /// Directory to organize (top level only)
        root: PathBuf,

        /// Comma-separated categories (overrides config)
        #[arg(short, long, value_delimiter = ',')]
        labels: Option<Vec<String>>,

        /// Which classifiers to use: local, remote or both
        #[arg(long)]
        prefer: Option<ClassifierPreference>,

        /// Confidence below which the remote classifier is consulted
        #[arg(long)]
        threshold: Option<f32>,

        /// Show the plan without moving anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Manually set a file's category; later runs reuse it
    Assign {
        file: PathBuf,
        label: String,
    },

    /// Browse and undo past batches
    History {
        #[command(subcommand)]
        action: HistoryCommands,
    },

    /// Classification cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },

    /// Manage the configured categories
    Categories {
        #[command(subcommand)]
        action: CategoryCommands,
    },

    /// Manage the remote classifier API key
    Credentials {
        #[command(subcommand)]
        action: CredentialCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Show classifier availability and cache state
    Status,
}

#[derive(Subcommand, Debug)]
enum HistoryCommands {
    /// List batches, newest first
    List {
        /// Number of batches to show
        #[arg(short = 'n', long, default_value = "10")]
        count: usize,
    },

    /// Show every move in a batch
    Show { batch: String },

    /// Undo a batch (defaults to the newest with moves left to undo)
    Undo {
        batch: Option<String>,

        /// Show what would be undone
        #[arg(long)]
        dry_run: bool,
    },

    /// Clear all history
    Clear {
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// Entry counts
    Stats,
    /// Drop every entry
    Clear,
    /// Drop entries from other category sets or models
    Prune,
}

#[derive(Subcommand, Debug)]
enum CategoryCommands {
    List,
    Add { name: String },
    Remove { name: String },
    Rename { from: String, to: String },
}

#[derive(Subcommand, Debug)]
enum CredentialCommands {
    /// Store an API key (read from stdin when --secret is omitted)
    Set {
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        secret: Option<String>,
    },
    /// Remove a stored API key
    Delete {
        #[arg(long)]
        service: Option<String>,
    },
    /// Report whether a key is available
    Status {
        #[arg(long)]
        service: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Generate default configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "tidyfold.json")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = AppConfig::load(&cli.config)?;
    let json = cli.format == "json";

    match cli.command {
        Commands::Organize { root, labels, prefer, threshold, dry_run } => {
            let request = RunRequest {
                root,
                labels,
                preference: prefer,
                confidence_threshold: threshold,
                dry_run,
            };
            run_organize(config, request, json).await
        }
        Commands::Assign { file, label } => {
            let engine = Engine::open(config, credentials::default_store())?;
            let result = engine.assign(&file, &label)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{} -> {} (manual)", file.display(), result.label);
            }
            Ok(())
        }
        Commands::History { action } => run_history_command(config, action, json),
        Commands::Cache { action } => run_cache_command(config, action, json),
        Commands::Categories { action } => run_category_command(config, action, &cli.config),
        Commands::Credentials { action } => run_credential_command(config, action),
        Commands::Config { action } => run_config_command(config, action, &cli.config),
        Commands::Status => run_status(config, json),
    }
}

async fn run_organize(config: AppConfig, request: RunRequest, json: bool) -> Result<()> {
    let engine = Engine::open(config, credentials::default_store())?;
    let cancel = cancel_on_signal();

    info!("Organizing {:?}", request.root);
    let summary = engine.run(request, cancel, None).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    for file in &summary.files {
        let name = file.path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let action = match &file.outcome {
            MoveOutcome::Moved { destination } => format!("-> {}", destination.display()),
            MoveOutcome::Planned { destination } => format!("would move to {}", destination.display()),
            MoveOutcome::InPlace => "already in place".to_string(),
            MoveOutcome::Failed { reason } => format!("not moved: {}", reason),
            MoveOutcome::Skipped => "skipped (cancelled)".to_string(),
        };
        println!(
            "  {} [{} {:.2} {}] {}",
            name, file.result.label, file.result.confidence, file.result.source, action
        );
    }

    println!();
    if summary.dry_run {
        println!("Dry run: {} files, nothing moved", summary.total_files);
    } else {
        println!("Moved {} of {} files", summary.moved, summary.total_files);
    }
    for (label, count) in &summary.counts {
        println!("  {:<20} {}", label, count);
    }
    if let Some(batch) = &summary.batch_id {
        println!("Batch: {} (undo with `tidyfold history undo {}`)", batch, batch);
    }
    if summary.cancelled {
        println!("Run was cancelled before every file was processed");
    }
    if !summary.issues.is_empty() {
        println!("\n{} issues:", summary.issues.len());
        for issue in &summary.issues {
            println!("  {} [{}] {}", issue.path.display(), issue.kind, issue.message);
        }
    }
}

fn print_undo(report: &UndoReport) {
    let verb = if report.dry_run { "Would restore" } else { "Restored" };
    for record in &report.restored {
        println!("  {}: {} -> {}", verb, record.destination.display(), record.source.display());
    }
    for record in &report.already_reverted {
        println!("  Already back: {}", record.source.display());
    }
    for conflict in &report.conflicts {
        println!("  Conflict: {} ({})", conflict.destination.display(), conflict.reason);
    }
    for folder in &report.removed_folders {
        println!("  Removed empty folder {}", folder.display());
    }
    println!(
        "{} restored, {} conflicts",
        report.restored.len(),
        report.conflicts.len()
    );
}

/// Run history commands
fn run_history_command(config: AppConfig, action: HistoryCommands, json: bool) -> Result<()> {
    let engine = Engine::open(config, credentials::default_store())?;

    match action {
        HistoryCommands::List { count } => {
            let mut batches = engine.history().batches()?;
            batches.truncate(count);
            if json {
                println!("{}", serde_json::to_string_pretty(&batches)?);
                return Ok(());
            }
            println!("Recent batches ({}):", batches.len());
            for batch in batches {
                let state = if batch.fully_undone() {
                    "[UNDONE]".to_string()
                } else if batch.reverted > 0 {
                    format!("[{} reverted]", batch.reverted)
                } else {
                    String::new()
                };
                println!(
                    "  {} {} {} moves in {} {}",
                    batch.started_at.format("%Y-%m-%d %H:%M"),
                    batch.batch_id,
                    batch.moves - batch.aborted,
                    batch.root.display(),
                    state
                );
            }
        }
        HistoryCommands::Show { batch } => {
            let log = engine.history().batch(&batch)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&log.moves)?);
                return Ok(());
            }
            println!("Batch {} in {}", batch, log.info.root.display());
            for record in &log.moves {
                let mark = if log.reverted.contains(&record.seq) { " [reverted]" } else { "" };
                println!(
                    "  #{} {} -> {}{}",
                    record.seq,
                    record.source.display(),
                    record.destination.display(),
                    mark
                );
            }
        }
        HistoryCommands::Undo { batch, dry_run } => {
            let report = engine.undo(batch.as_deref(), dry_run)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_undo(&report);
            }
            if !report.is_clean() {
                std::process::exit(1);
            }
        }
        HistoryCommands::Clear { force } => {
            if !force {
                eprintln!("Use --force to confirm clearing history");
                return Ok(());
            }
            engine.history().clear()?;
            println!("History cleared");
        }
    }

    Ok(())
}

fn run_cache_command(config: AppConfig, action: CacheCommands, json: bool) -> Result<()> {
    let engine = Engine::open(config, credentials::default_store())?;
    let cache = engine.cache();

    match action {
        CacheCommands::Stats => {
            let stats = cache.stats();
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Cache: {} entries across {} configurations", stats.entries, stats.configurations);
                for (source, count) in &stats.by_source {
                    println!("  {:<8} {}", source, count);
                }
            }
        }
        CacheCommands::Clear => {
            let removed = cache.clear()?;
            println!("Removed {} cache entries", removed);
        }
        CacheCommands::Prune => {
            let request = RunRequest::new(".");
            let (orchestrator, _) = engine.orchestrator(&request)?;
            let removed = cache.prune_except(orchestrator.labels().id(), orchestrator.model_version())?;
            println!(
                "Removed {} entries not matching the current categories and model ({})",
                removed,
                orchestrator.model_version()
            );
        }
    }
    Ok(())
}

fn run_category_command(mut config: AppConfig, action: CategoryCommands, config_path: &Path) -> Result<()> {
    match action {
        CategoryCommands::List => {
            for category in &config.categories {
                println!("{}", category);
            }
            return Ok(());
        }
        CategoryCommands::Add { name } => config.add_category(&name)?,
        CategoryCommands::Remove { name } => config.remove_category(&name)?,
        CategoryCommands::Rename { from, to } => config.rename_category(&from, &to)?,
    }
    config.save(config_path)?;
    println!("Categories: {}", config.categories.join(", "));
    Ok(())
}

fn run_credential_command(config: AppConfig, action: CredentialCommands) -> Result<()> {
    let store = credentials::default_store();
    let default_service = config.classifier.remote.service_name.clone();

    match action {
        CredentialCommands::Set { service, secret } => {
            let service = service.unwrap_or(default_service);
            let secret = match secret {
                Some(secret) => secret,
                None => {
                    eprintln!("Enter API key for {}:", service);
                    let mut line = String::new();
                    std::io::stdin().lock().read_line(&mut line)?;
                    line.trim().to_string()
                }
            };
            store.set(&service, &secret)?;
            println!("Stored API key for {}", service);
        }
        CredentialCommands::Delete { service } => {
            let service = service.unwrap_or(default_service);
            store.delete(&service)?;
            println!("Removed API key for {}", service);
        }
        CredentialCommands::Status { service } => {
            let service = service.unwrap_or(default_service);
            let state = if store.has(&service) { "available" } else { "missing" };
            println!("{}: {}", service, state);
        }
    }
    Ok(())
}

/// Run config commands
fn run_config_command(config: AppConfig, action: ConfigCommands, config_path: &Path) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        ConfigCommands::Generate { output, force } => {
            if output.exists() && !force {
                return Err(TidyfoldError::Config(format!(
                    "{:?} already exists. Use --force to overwrite",
                    output
                )));
            }
            AppConfig::default().save(&output)?;
            println!("Generated config at {:?}", output);
        }
        ConfigCommands::Validate => {
            config.validate()?;
            println!("Configuration at {:?} is valid", config_path);
            println!("  Categories: {}", config.categories.join(", "));
            println!("  Preference: {}", config.classifier.preference);
            println!("  Cache: {:?}", config.cache.path);
            println!("  History: {:?}", config.history.path);
        }
    }
    Ok(())
}

fn run_status(config: AppConfig, json: bool) -> Result<()> {
    let store: Arc<dyn CredentialStore> = credentials::default_store();
    let remote = &config.classifier.remote;
    let credential = store.has(&remote.service_name);
    let engine = Engine::open(config.clone(), store)?;
    let stats = engine.cache().stats();
    let batches = engine.history().batches()?;

    if json {
        let status = serde_json::json!({
            "categories": config.categories,
            "preference": config.classifier.preference,
            "local_model": config.classifier.local.model,
            "remote_enabled": remote.enabled,
            "remote_credential": credential,
            "cache": stats,
            "batches": batches.len(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Tidyfold v{}", env!("CARGO_PKG_VERSION"));
    println!("  Categories:   {}", config.categories.join(", "));
    println!("  Preference:   {}", config.classifier.preference);
    println!("  Local model:  {}", config.classifier.local.model);
    if remote.enabled {
        println!("  Remote model: {} at {}", remote.model, remote.base_url);
        if !credential {
            warn!("No API key for {}; remote classification is off", remote.service_name);
        }
        println!("  API key:      {}", if credential { "available" } else { "missing" });
    } else {
        println!("  Remote model: disabled");
    }
    if let Some(reason) = engine.cache().rebuilt_reason() {
        println!("  Cache was rebuilt: {}", reason);
    }
    println!("  Cache:        {} entries", stats.entries);
    println!("  History:      {} batches", batches.len());
    Ok(())
}
