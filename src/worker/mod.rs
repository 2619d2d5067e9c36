//! Worker daemon plane.
//!
//! Hosts the executor backends behind the `WorkerExec` RPC surface,
//! enforces the declared concurrency cap, and keeps itself registered
//! against the coordinator (handshake once, then heartbeats at the
//! recommended cadence; a forgotten registration re-handshakes).

mod capability;

pub use capability::detect_capabilities;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tonic::{Request, Response, Status};

use crate::config::WorkerConfig;
use crate::core::Arch;
use crate::executor::{ExecutorManager, SourcePayload, TaskSpec};
use crate::proto;
use crate::proto::grid_client::GridClient;
use crate::proto::worker_exec_server::WorkerExec;
use crate::registry::WorkerCapabilities;
use crate::{debug, log};

/// Applied when a task carries no deadline of its own.
const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Ceiling for the handshake retry backoff.
const ENROLL_BACKOFF_CAP: Duration = Duration::from_secs(60);

// =============================================================================
// Daemon state
// =============================================================================

pub struct WorkerDaemon {
    manager: ExecutorManager,
    semaphore: Arc<Semaphore>,
    max_parallel: u32,
    active: AtomicU32,
    worker_id: Mutex<String>,
}

impl WorkerDaemon {
    pub fn new(config: &WorkerConfig) -> Arc<Self> {
        Self::with_max_parallel(config, config.effective_max_parallel())
    }

    pub(crate) fn with_max_parallel(config: &WorkerConfig, max_parallel: usize) -> Arc<Self> {
        Arc::new(Self {
            manager: ExecutorManager::new(config),
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            max_parallel: max_parallel as u32,
            active: AtomicU32::new(0),
            worker_id: Mutex::new(String::new()),
        })
    }

    pub fn manager(&self) -> &ExecutorManager {
        &self.manager
    }

    pub fn current_id(&self) -> String {
        self.worker_id.lock().clone()
    }

    fn set_id(&self, id: String) {
        *self.worker_id.lock() = id;
    }
}

// =============================================================================
// RPC surface
// =============================================================================

pub struct WorkerExecService(pub Arc<WorkerDaemon>);

#[tonic::async_trait]
impl WorkerExec for WorkerExecService {
    async fn compile(
        &self,
        request: Request<proto::CompileRequest>,
    ) -> Result<Response<proto::CompileResponse>, Status> {
        let req = request.into_inner();
        if req.task_id.is_empty() {
            return Err(Status::invalid_argument("task_id is required"));
        }
        let target_arch: Arch = req.target_arch().into();
        let timeout = if req.timeout_seconds > 0 {
            Duration::from_secs(u64::from(req.timeout_seconds))
        } else {
            DEFAULT_TASK_TIMEOUT
        };

        let source = if !req.preprocessed_source.is_empty() {
            SourcePayload::Preprocessed(req.preprocessed_source)
        } else if !req.raw_source.is_empty() {
            SourcePayload::Raw {
                source: req.raw_source,
                filename: req.source_filename,
                includes: req.include_files,
            }
        } else {
            return Err(Status::invalid_argument("no source payload"));
        };

        // Hard concurrency cap; excess load is refused, not queued.
        let Ok(permit) = self.0.semaphore.clone().try_acquire_owned() else {
            return Err(Status::resource_exhausted(format!(
                "worker at max parallel tasks ({})",
                self.0.max_parallel
            )));
        };
        self.0.active.fetch_add(1, Ordering::Relaxed);

        let task = TaskSpec {
            task_id: req.task_id.clone(),
            compiler: req.compiler.clone(),
            args: req.compiler_args,
            target_arch,
            timeout,
            source,
        };

        let executor = self.0.manager.select_for_compiler(&task.compiler, target_arch);
        debug!("worker"; "task {} via {} executor", task.task_id, executor.name());

        let outcome = executor.compile(&task).await;
        self.0.active.fetch_sub(1, Ordering::Relaxed);
        drop(permit);

        let response = match outcome {
            Ok(result) => proto::CompileResponse {
                status: if result.success() {
                    proto::TaskStatus::Completed as i32
                } else {
                    proto::TaskStatus::Failed as i32
                },
                object_file: result.object,
                stdout: result.stdout,
                stderr: result.stderr,
                exit_code: result.exit_code,
                compilation_time_ms: result.duration.as_millis() as u64,
                queue_time_ms: 0,
                worker_id: self.0.current_id(),
            },
            // Infrastructure failures (unspawnable compiler, unwritable
            // work dir) still come back as structured results.
            Err(e) => {
                log!("worker"; "task {} failed: {e:#}", req.task_id);
                proto::CompileResponse {
                    status: proto::TaskStatus::Failed as i32,
                    object_file: Vec::new(),
                    stdout: String::new(),
                    stderr: format!("{e:#}"),
                    exit_code: 1,
                    compilation_time_ms: 0,
                    queue_time_ms: 0,
                    worker_id: self.0.current_id(),
                }
            }
        };
        Ok(Response::new(response))
    }

    async fn status(
        &self,
        _request: Request<proto::WorkerStatusProbeRequest>,
    ) -> Result<Response<proto::WorkerStatusProbeResponse>, Status> {
        Ok(Response::new(proto::WorkerStatusProbeResponse {
            ready: true,
            active_tasks: self.0.active.load(Ordering::Relaxed),
            max_parallel_tasks: self.0.max_parallel,
        }))
    }
}

// =============================================================================
// Enrollment
// =============================================================================

/// Keep this worker registered until shutdown.
///
/// Handshake with capped exponential backoff; once accepted, heartbeat
/// at the coordinator's cadence. A heartbeat answered with
/// `known=false` (or a transport error) falls back to a fresh
/// handshake. A rejected registration is fatal: the token will not get
/// better by retrying.
pub async fn run_enrollment(
    config: WorkerConfig,
    capabilities: WorkerCapabilities,
    daemon: Arc<WorkerDaemon>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut backoff = Duration::from_secs(1);
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        match try_handshake(&config, &capabilities, &daemon.current_id()).await {
            Ok(resp) if resp.accepted => {
                daemon.set_id(resp.assigned_worker_id.clone());
                let interval = Duration::from_secs(u64::from(resp.heartbeat_interval_seconds.max(1)));
                log!("worker"; "registered as {} (heartbeat every {}s)",
                    resp.assigned_worker_id, interval.as_secs());
                backoff = Duration::from_secs(1);

                if !heartbeat_loop(&config, &resp.assigned_worker_id, interval, &mut shutdown).await
                {
                    return Ok(());
                }
                // fell out of the heartbeat loop: re-handshake
            }
            Ok(resp) => bail!("registration rejected: {}", resp.message),
            Err(e) => {
                log!("worker"; "handshake failed: {e:#}; retrying in {}s", backoff.as_secs());
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.changed() => return Ok(()),
                }
                backoff = (backoff * 2).min(ENROLL_BACKOFF_CAP);
            }
        }
    }
}

async fn try_handshake(
    config: &WorkerConfig,
    capabilities: &WorkerCapabilities,
    current_id: &str,
) -> Result<proto::HandshakeResponse> {
    let mut client = GridClient::connect(config.coordinator.clone())
        .await
        .with_context(|| format!("connect {}", config.coordinator))?;
    let response = client
        .handshake(proto::HandshakeRequest {
            capabilities: Some(capabilities.into()),
            worker_address: config.advertised_address().to_string(),
            auth_token: config.auth_token.clone().unwrap_or_default(),
            worker_id: current_id.to_string(),
        })
        .await
        .context("handshake rpc")?;
    Ok(response.into_inner())
}

/// Returns `false` on shutdown, `true` when a re-handshake is needed.
async fn heartbeat_loop(
    config: &WorkerConfig,
    worker_id: &str,
    interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut client = match GridClient::connect(config.coordinator.clone()).await {
        Ok(client) => client,
        Err(e) => {
            log!("worker"; "heartbeat connect failed: {e}");
            return true;
        }
    };
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                match client
                    .heartbeat(proto::HeartbeatRequest { worker_id: worker_id.to_string() })
                    .await
                {
                    Ok(resp) if resp.get_ref().known => {}
                    Ok(_) => {
                        log!("worker"; "coordinator lost our registration, re-handshaking");
                        return true;
                    }
                    Err(e) => {
                        log!("worker"; "heartbeat failed: {e}");
                        return true;
                    }
                }
            }
            _ = shutdown.changed() => return false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
