//! `hgc` - compile one translation unit by the fastest legal path.
//!
//! Usage: `hgc [flags] -- <compiler> <args...>`. The exit code mirrors
//! whichever compile actually ran (cache, remote worker, or local).

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use hybrid_grid::client::{self, PipelineOptions};
use hybrid_grid::config::GridConfig;
use hybrid_grid::log;
use hybrid_grid::logger;

#[derive(Parser)]
#[command(name = "hgc", about = "Hybrid-Grid compile client", version)]
struct Cli {
    /// Config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Coordinator endpoint (falls back to $HG_COORDINATOR, then config)
    #[arg(long)]
    coordinator: Option<String>,

    /// Cache directory override
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Never compile locally on remote failure
    #[arg(long)]
    no_fallback: bool,

    /// Verbose diagnostics ([remote]/[cache]/[local] traces)
    #[arg(short, long)]
    verbose: bool,

    /// The compiler command line
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::set_verbose(cli.verbose);

    let config = GridConfig::load_or_default(cli.config.as_deref())?;
    let coordinator = cli
        .coordinator
        .or_else(|| std::env::var("HG_COORDINATOR").ok())
        .unwrap_or_else(|| config.worker.coordinator.clone());

    let options = PipelineOptions {
        coordinator: Some(coordinator),
        fallback_enabled: !cli.no_fallback,
        cache_dir: cli.cache_dir,
    };

    match client::run(&cli.command, &config, &options).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log!("error"; "{e:#}");
            std::process::exit(1);
        }
    }
}
