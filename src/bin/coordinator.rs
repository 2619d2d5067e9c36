//! `hg-coordinator` - scheduler/registry daemon.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tonic::transport::Server;

use hybrid_grid::config::GridConfig;
use hybrid_grid::coordinator::{Coordinator, CoordinatorService};
use hybrid_grid::log;
use hybrid_grid::logger;
use hybrid_grid::proto::grid_server::GridServer;
use hybrid_grid::registry::spawn_staleness_sweep;

#[derive(Parser)]
#[command(name = "hg-coordinator", about = "Hybrid-Grid coordinator", version)]
struct Cli {
    /// Config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(long)]
    listen: Option<String>,

    /// Shared bearer token workers must present
    #[arg(long)]
    auth_token: Option<String>,

    /// Verbose diagnostics
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logger::set_verbose(cli.verbose);

    let mut config = GridConfig::load_or_default(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        config.coordinator.listen = listen;
    }
    if let Some(token) = cli.auth_token {
        config.coordinator.auth_token = Some(token);
    }

    let addr: SocketAddr = config
        .coordinator
        .listen
        .parse()
        .with_context(|| format!("bad listen address `{}`", config.coordinator.listen))?;

    let coordinator = Coordinator::new(&config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = spawn_staleness_sweep(coordinator.registry().clone(), shutdown_rx);

    log!("coordinator"; "listening on {addr} (heartbeat ttl {}s)",
        config.coordinator.heartbeat_ttl_secs);

    Server::builder()
        .add_service(GridServer::new(CoordinatorService(coordinator)))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            log!("coordinator"; "shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = sweep.await;
    Ok(())
}
