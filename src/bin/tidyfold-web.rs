// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Tidyfold control API
//!
//! Standalone server exposing runs, progress, history and undo over HTTP.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use tidyfold::config::AppConfig;
use tidyfold::credentials;
use tidyfold::run::{cancel_on_signal, Engine};
use tidyfold::Result;

#[derive(Parser, Debug)]
#[command(name = "tidyfold-web")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version)]
#[command(about = "Tidyfold control API server")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "tidyfold.json")]
    config: PathBuf,

    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Open the status endpoint in a browser
    #[arg(long)]
    open: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Tidyfold control API v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(&args.config)?;

    // Apply CLI overrides
    if let Some(host) = args.host {
        config.web.host = host;
    }
    if let Some(port) = args.port {
        config.web.port = port;
    }

    info!("Cache: {:?}", config.cache.path);
    info!("History: {:?}", config.history.path);

    if args.open {
        let url = format!("http://{}:{}/api/status", config.web.host, config.web.port);
        if let Err(e) = open_browser(&url) {
            error!("Failed to open browser: {}", e);
        }
    }

    let engine = Engine::open(config, credentials::default_store())?;
    tidyfold::web::start_server(engine, cancel_on_signal()).await
}

fn open_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd").args(["/c", "start", url]).spawn()?;
    }
    Ok(())
}
