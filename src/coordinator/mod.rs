//! Coordinator dispatch plane.
//!
//! Accepts client compile requests, picks a worker, forwards the task
//! over a transient connection, and relays the result faithfully.
//! Scheduling failures and worker transport failures come back as
//! structured `Failed` responses, never as RPC errors; only malformed
//! requests are surfaced as `InvalidArgument`.

mod events;
mod stats;

pub use events::{EventBus, TaskEvent};
pub use stats::{Stats, StatsSnapshot};

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tonic::transport::Endpoint;
use tonic::{Request, Response, Status};

use crate::balance::{BreakerManager, Scheduler};
use crate::config::{CoordinatorConfig, GridConfig};
use crate::core::{Arch, BuildType, DiscoverySource, WorkerState};
use crate::proto;
use crate::proto::grid_server::Grid;
use crate::registry::{WorkerInfo, WorkerRegistry};
use crate::{debug, log};

/// Connect-phase budget inside the overall request deadline.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// State
// =============================================================================

/// Shared coordinator state behind the RPC surface.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: Arc<WorkerRegistry>,
    breakers: Arc<BreakerManager>,
    scheduler: Scheduler,
    stats: Stats,
    events: EventBus,
}

impl Coordinator {
    pub fn new(config: &GridConfig) -> Arc<Self> {
        let registry = Arc::new(WorkerRegistry::new(config.coordinator.heartbeat_ttl()));
        let breakers = Arc::new(BreakerManager::new(&config.circuit).with_listener(
            |id, from, to| {
                log!("circuit"; "worker {id}: {} -> {}", from.as_str(), to.as_str());
            },
        ));
        let scheduler = Scheduler::new(registry.clone(), breakers.clone(), &config.scheduler);
        Arc::new(Self {
            config: config.coordinator.clone(),
            registry,
            breakers,
            scheduler,
            stats: Stats::default(),
            events: EventBus::default(),
        })
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Recommended heartbeat cadence for workers: half the TTL.
    fn heartbeat_interval_secs(&self) -> u32 {
        (self.config.heartbeat_ttl_secs / 2).max(1) as u32
    }

    /// Forward a compile to the chosen worker over a transient channel
    /// whose deadline never exceeds the request timeout.
    async fn forward(
        &self,
        worker: &WorkerInfo,
        request: proto::CompileRequest,
    ) -> Result<proto::CompileResponse, String> {
        let endpoint = Endpoint::from_shared(format!("http://{}", worker.address))
            .map_err(|e| format!("bad worker address `{}`: {e}", worker.address))?
            .connect_timeout(DIAL_TIMEOUT.min(self.config.request_timeout()))
            .timeout(self.config.request_timeout());

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| format!("dial {}: {e}", worker.address))?;

        let mut client = proto::worker_exec_client::WorkerExecClient::new(channel);
        client
            .compile(Request::new(request))
            .await
            .map(Response::into_inner)
            .map_err(|status| format!("worker {}: {status}", worker.id))
    }
}

/// Synthetic Failed response used for scheduling and transport errors.
fn failed_response(stderr: String) -> proto::CompileResponse {
    proto::CompileResponse {
        status: proto::TaskStatus::Failed as i32,
        object_file: Vec::new(),
        stdout: String::new(),
        stderr,
        exit_code: 1,
        compilation_time_ms: 0,
        queue_time_ms: 0,
        worker_id: String::new(),
    }
}

/// Classify a worker address: loopback and RFC1918 hosts count as LAN.
fn classify_address(address: &str) -> DiscoverySource {
    let host = address.rsplit_once(':').map_or(address, |(h, _)| h);
    if host == "localhost" {
        return DiscoverySource::Lan;
    }
    match host.parse::<Ipv4Addr>() {
        Ok(ip) if ip.is_loopback() || ip.is_private() => DiscoverySource::Lan,
        Ok(_) => DiscoverySource::Wan,
        Err(_) => DiscoverySource::Manual,
    }
}

fn nano_now() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

// =============================================================================
// RPC surface
// =============================================================================

/// Tonic service wrapper.
pub struct CoordinatorService(pub Arc<Coordinator>);

#[tonic::async_trait]
impl Grid for CoordinatorService {
    async fn handshake(
        &self,
        request: Request<proto::HandshakeRequest>,
    ) -> Result<Response<proto::HandshakeResponse>, Status> {
        let req = request.into_inner();
        let Some(capabilities) = req.capabilities else {
            return Err(Status::invalid_argument("capabilities are required"));
        };

        // Auth rejection is a response, not an RPC error, so that
        // registration stays idempotent from the worker's view.
        if let Some(expected) = &self.0.config.auth_token {
            if req.auth_token != *expected {
                log!("registry"; "rejected handshake from {} (bad token)", req.worker_address);
                return Ok(Response::new(proto::HandshakeResponse {
                    accepted: false,
                    message: "authentication token mismatch".into(),
                    assigned_worker_id: String::new(),
                    heartbeat_interval_seconds: 0,
                }));
            }
        }

        let capabilities: crate::registry::WorkerCapabilities = capabilities.into();
        let worker_id = if req.worker_id.is_empty() {
            format!("worker-{}-{}", capabilities.hostname, nano_now())
        } else {
            req.worker_id
        };

        let source = classify_address(&req.worker_address);
        self.0.registry.add(WorkerInfo::new(
            worker_id.clone(),
            req.worker_address,
            capabilities,
            source,
        ));

        Ok(Response::new(proto::HandshakeResponse {
            accepted: true,
            message: "registered".into(),
            assigned_worker_id: worker_id,
            heartbeat_interval_seconds: self.0.heartbeat_interval_secs(),
        }))
    }

    async fn heartbeat(
        &self,
        request: Request<proto::HeartbeatRequest>,
    ) -> Result<Response<proto::HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let known = self.0.registry.update_heartbeat(&req.worker_id).is_ok();
        Ok(Response::new(proto::HeartbeatResponse { acknowledged: true, known }))
    }

    async fn unregister(
        &self,
        request: Request<proto::UnregisterRequest>,
    ) -> Result<Response<proto::UnregisterResponse>, Status> {
        let req = request.into_inner();
        let removed = self.0.registry.remove(&req.worker_id).is_ok();
        if removed {
            self.0.scheduler.forget(&req.worker_id);
        }
        Ok(Response::new(proto::UnregisterResponse { removed }))
    }

    async fn compile(
        &self,
        request: Request<proto::CompileRequest>,
    ) -> Result<Response<proto::CompileResponse>, Status> {
        let receipt = Instant::now();
        let req = request.into_inner();
        if req.task_id.is_empty() {
            return Err(Status::invalid_argument("task_id is required"));
        }

        // Clients only reach the coordinator on a local cache miss.
        self.0.stats.cache_miss();

        // Preprocessed bytes embed the client host's header layout, so
        // that mode pins placement to an OS-equal worker. Raw-source
        // mode carries its headers and may cross operating systems.
        let preprocessed_mode = req.raw_source.is_empty() && !req.preprocessed_source.is_empty();
        let os_filter = preprocessed_mode.then_some(req.client_os.as_str());

        let target_arch: Arch = req.target_arch().into();
        let worker = match self.0.scheduler.select(BuildType::Cpp, target_arch, os_filter) {
            Ok(worker) => worker,
            Err(e) => {
                debug!("dispatch"; "task {}: {e}", req.task_id);
                return Ok(Response::new(failed_response(format!(
                    "no worker available: {e}"
                ))));
            }
        };

        let task_id = req.task_id.clone();
        if let Err(e) = self.0.registry.increment_tasks(&worker.id) {
            return Ok(Response::new(failed_response(format!("worker vanished: {e}"))));
        }
        self.0.stats.task_started();
        self.0.events.emit(TaskEvent::Started {
            task_id: task_id.clone(),
            worker_id: worker.id.clone(),
        });

        // Breaker accounting covers the transport only; a delivered
        // compile failure is transport success.
        let admitted = self.0.breakers.try_acquire(&worker.id).is_ok();
        let queue_time_ms = receipt.elapsed().as_millis() as u64;
        let dispatch_start = Instant::now();

        let outcome = self.0.forward(&worker, req).await;
        let wall_time = dispatch_start.elapsed();

        let response = match outcome {
            Ok(mut response) => {
                if admitted {
                    self.0.breakers.record(&worker.id, true);
                }
                let success = response.status() == proto::TaskStatus::Completed
                    && response.exit_code == 0;
                if success {
                    self.0
                        .scheduler
                        .report_success(&worker.id, wall_time.as_secs_f64() * 1000.0);
                }
                let _ = self.0.registry.decrement_tasks(
                    &worker.id,
                    success,
                    Duration::from_millis(response.compilation_time_ms),
                );
                self.0.stats.task_finished(success);
                self.0.events.emit(TaskEvent::Completed {
                    task_id,
                    worker_id: worker.id.clone(),
                    success,
                    wall_time,
                });
                response.queue_time_ms = queue_time_ms;
                response.worker_id = worker.id.clone();
                response
            }
            Err(message) => {
                if admitted {
                    self.0.breakers.record(&worker.id, false);
                }
                self.0.scheduler.report_failure(&worker.id);
                let _ = self.0.registry.decrement_tasks(&worker.id, false, Duration::ZERO);
                self.0.stats.task_finished(false);
                self.0.events.emit(TaskEvent::Completed {
                    task_id,
                    worker_id: worker.id.clone(),
                    success: false,
                    wall_time,
                });
                log!("dispatch"; "forward to {} failed: {message}", worker.id);
                // worker_id stays empty: nothing served this task, and
                // the client keys its retry decision on that.
                let mut response = failed_response(message);
                response.queue_time_ms = queue_time_ms;
                response
            }
        };

        Ok(Response::new(response))
    }

    async fn health_check(
        &self,
        _request: Request<proto::HealthCheckRequest>,
    ) -> Result<Response<proto::HealthCheckResponse>, Status> {
        let workers = self.0.registry.list();
        let healthy_count = workers
            .iter()
            .filter(|w| w.state != WorkerState::Unhealthy)
            .count();
        let snapshot = self.0.stats.snapshot();
        Ok(Response::new(proto::HealthCheckResponse {
            healthy: healthy_count > 0 || workers.is_empty(),
            active_tasks: snapshot.active as u32,
            queued_tasks: 0,
        }))
    }

    async fn get_worker_status(
        &self,
        _request: Request<proto::GetWorkerStatusRequest>,
    ) -> Result<Response<proto::GetWorkerStatusResponse>, Status> {
        let workers = self
            .0
            .registry
            .list()
            .into_iter()
            .map(|w| proto::WorkerStatus {
                worker_id: w.id.clone(),
                hostname: w.capabilities.hostname.clone(),
                native_arch: proto::Arch::from(w.capabilities.native_arch) as i32,
                cpu_cores: w.capabilities.cpu_cores,
                memory_bytes: w.capabilities.memory_bytes,
                active_tasks: w.active_tasks,
                total_tasks_completed: w.total_tasks,
                circuit_state: self.0.breakers.state(&w.id).as_str().to_string(),
                last_heartbeat_unix: w.last_heartbeat_unix,
            })
            .collect();
        Ok(Response::new(proto::GetWorkerStatusResponse { workers }))
    }

    async fn get_workers_for_build(
        &self,
        request: Request<proto::GetWorkersForBuildRequest>,
    ) -> Result<Response<proto::GetWorkersForBuildResponse>, Status> {
        let req = request.into_inner();
        let build_type: BuildType = req.build_type().into();
        let workers = self
            .0
            .registry
            .list_by_capability(build_type, Arch::Unspecified, None);
        let worker_ids: Vec<String> = workers.into_iter().map(|w| w.id).collect();
        let available_count = worker_ids.len() as u32;
        Ok(Response::new(proto::GetWorkersForBuildResponse {
            worker_ids,
            available_count,
        }))
    }

    async fn report_cache_hit(
        &self,
        request: Request<proto::ReportCacheHitRequest>,
    ) -> Result<Response<proto::ReportCacheHitResponse>, Status> {
        let req = request.into_inner();
        self.0.stats.add_cache_hits(req.hits);
        Ok(Response::new(proto::ReportCacheHitResponse { acknowledged: true }))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(auth: Option<&str>) -> CoordinatorService {
        let mut config = GridConfig::default();
        config.coordinator.auth_token = auth.map(str::to_string);
        CoordinatorService(Coordinator::new(&config))
    }

    fn handshake_request(id: &str, token: &str) -> proto::HandshakeRequest {
        proto::HandshakeRequest {
            capabilities: Some(proto::WorkerCapabilities {
                hostname: "build-host".into(),
                native_arch: proto::Arch::X8664 as i32,
                os: "linux".into(),
                cpu_cores: 8,
                memory_bytes: 16 << 30,
                cpp: Some(proto::CppCapability {
                    compilers: vec!["gcc".into()],
                    cross_compile: false,
                }),
                max_parallel_tasks: 8,
                ..Default::default()
            }),
            worker_address: "192.168.1.20:7071".into(),
            auth_token: token.into(),
            worker_id: id.into(),
        }
    }

    #[tokio::test]
    async fn test_handshake_assigns_id_and_interval() {
        let svc = coordinator(None);
        let resp = svc
            .handshake(Request::new(handshake_request("", "")))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.accepted);
        assert!(resp.assigned_worker_id.starts_with("worker-build-host-"));
        assert_eq!(resp.heartbeat_interval_seconds, 15);
        assert!(svc.0.registry.contains(&resp.assigned_worker_id));
    }

    #[tokio::test]
    async fn test_handshake_keeps_proposed_id() {
        let svc = coordinator(None);
        let resp = svc
            .handshake(Request::new(handshake_request("w-keep", "")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.assigned_worker_id, "w-keep");
    }

    #[tokio::test]
    async fn test_handshake_token_mismatch_is_soft_reject() {
        let svc = coordinator(Some("secret"));
        let resp = svc
            .handshake(Request::new(handshake_request("w1", "wrong")))
            .await
            .unwrap()
            .into_inner();
        assert!(!resp.accepted);
        assert!(resp.message.contains("token"));
        assert!(!svc.0.registry.contains("w1"));
    }

    #[tokio::test]
    async fn test_handshake_missing_capabilities_is_invalid() {
        let svc = coordinator(None);
        let status = svc
            .handshake(Request::new(proto::HandshakeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_compile_requires_task_id() {
        let svc = coordinator(None);
        let status = svc
            .compile(Request::new(proto::CompileRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_compile_with_no_workers_is_failed_response() {
        let svc = coordinator(None);
        let resp = svc
            .compile(Request::new(proto::CompileRequest {
                task_id: "t1".into(),
                compiler: "gcc".into(),
                raw_source: b"int x;".to_vec(),
                source_filename: "x.c".into(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.status(), proto::TaskStatus::Failed);
        assert_eq!(resp.exit_code, 1);
        assert!(resp.stderr.contains("no worker"));
    }

    #[tokio::test]
    async fn test_heartbeat_reports_unknown_worker() {
        let svc = coordinator(None);
        let resp = svc
            .heartbeat(Request::new(proto::HeartbeatRequest { worker_id: "ghost".into() }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.acknowledged);
        assert!(!resp.known);
    }

    #[tokio::test]
    async fn test_unregister() {
        let svc = coordinator(None);
        svc.handshake(Request::new(handshake_request("w1", "")))
            .await
            .unwrap();
        let resp = svc
            .unregister(Request::new(proto::UnregisterRequest { worker_id: "w1".into() }))
            .await
            .unwrap()
            .into_inner();
        assert!(resp.removed);
        assert!(!svc.0.registry.contains("w1"));
    }

    #[tokio::test]
    async fn test_health_and_cache_hits() {
        let svc = coordinator(None);
        // empty fleet still reports healthy
        let health = svc
            .health_check(Request::new(proto::HealthCheckRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(health.healthy);

        svc.report_cache_hit(Request::new(proto::ReportCacheHitRequest { hits: 4 }))
            .await
            .unwrap();
        assert_eq!(svc.0.stats().cache_hits, 4);
    }

    #[tokio::test]
    async fn test_workers_for_build_filters_capability() {
        let svc = coordinator(None);
        svc.handshake(Request::new(handshake_request("w1", "")))
            .await
            .unwrap();

        let cpp = svc
            .get_workers_for_build(Request::new(proto::GetWorkersForBuildRequest {
                build_type: proto::BuildType::Cpp as i32,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(cpp.available_count, 1);

        let go = svc
            .get_workers_for_build(Request::new(proto::GetWorkersForBuildRequest {
                build_type: proto::BuildType::Go as i32,
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(go.available_count, 0);
    }

    #[test]
    fn test_classify_address() {
        assert_eq!(classify_address("127.0.0.1:7071"), DiscoverySource::Lan);
        assert_eq!(classify_address("10.1.2.3:7071"), DiscoverySource::Lan);
        assert_eq!(classify_address("192.168.0.9:7071"), DiscoverySource::Lan);
        assert_eq!(classify_address("8.8.8.8:7071"), DiscoverySource::Wan);
        assert_eq!(classify_address("build42.example.com:7071"), DiscoverySource::Manual);
        assert_eq!(classify_address("localhost:7071"), DiscoverySource::Lan);
    }
}
