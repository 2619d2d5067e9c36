//! `hg-worker` - executor daemon.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tonic::transport::Server;

use hybrid_grid::config::GridConfig;
use hybrid_grid::log;
use hybrid_grid::logger;
use hybrid_grid::proto::worker_exec_server::WorkerExecServer;
use hybrid_grid::worker::{detect_capabilities, run_enrollment, WorkerDaemon, WorkerExecService};

#[derive(Parser)]
#[command(name = "hg-worker", about = "Hybrid-Grid compile worker", version)]
struct Cli {
    /// Config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(long)]
    listen: Option<String>,

    /// Address advertised to the coordinator
    #[arg(long)]
    advertise: Option<String>,

    /// Coordinator endpoint (overrides config)
    #[arg(long)]
    coordinator: Option<String>,

    /// Bearer token to present at handshake
    #[arg(long)]
    auth_token: Option<String>,

    /// Max simultaneous compiles (0 = CPU cores)
    #[arg(long)]
    max_parallel: Option<usize>,

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
        config.worker.listen = listen;
    }
    if let Some(advertise) = cli.advertise {
        config.worker.advertise = Some(advertise);
    }
    if let Some(coordinator) = cli.coordinator {
        config.worker.coordinator = coordinator;
    }
    if let Some(token) = cli.auth_token {
        config.worker.auth_token = Some(token);
    }
    if let Some(max) = cli.max_parallel {
        config.worker.max_parallel_tasks = max;
    }

    let addr: SocketAddr = config
        .worker
        .listen
        .parse()
        .with_context(|| format!("bad listen address `{}`", config.worker.listen))?;

    let daemon = WorkerDaemon::new(&config.worker);
    let capabilities = detect_capabilities(&config.worker, daemon.manager().has_container());
    log!("worker"; "host {} ({}, {} cores), {} parallel compiles",
        capabilities.hostname,
        capabilities.native_arch,
        capabilities.cpu_cores,
        capabilities.max_parallel_tasks);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let serve = Server::builder()
        .add_service(WorkerExecServer::new(WorkerExecService(daemon.clone())))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            log!("worker"; "shutting down");
        });
    let enrollment = run_enrollment(config.worker.clone(), capabilities, daemon, shutdown_rx);

    log!("worker"; "listening on {addr}");
    tokio::select! {
        served = serve => served?,
        enrolled = enrollment => enrolled?,
    }
    let _ = shutdown_tx.send(true);
    Ok(())
}
