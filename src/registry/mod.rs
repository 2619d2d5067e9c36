//! Authoritative in-memory worker table with bounded staleness.
//!
//! One reader/writer lock serializes every state transition per worker
//! id. All read paths return deep copies so no shared mutable state
//! escapes; the periodic staleness sweep is the only path that demotes
//! a worker without an explicit call.

mod worker;

pub use worker::{CppCapability, ToolchainCapability, WorkerCapabilities, WorkerInfo};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::{Arch, BuildType, RegistryError, WorkerState};
use crate::{debug, log};

/// Worker table keyed by worker id.
pub struct WorkerRegistry {
    workers: RwLock<FxHashMap<String, WorkerInfo>>,
    heartbeat_ttl: Duration,
}

impl WorkerRegistry {
    pub fn new(heartbeat_ttl: Duration) -> Self {
        Self {
            workers: RwLock::new(FxHashMap::default()),
            heartbeat_ttl,
        }
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_ttl
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Insert or refresh a registration.
    ///
    /// A known id keeps its counters: only address, capabilities and
    /// the heartbeat are refreshed, and an Unhealthy worker comes back
    /// to service. Task counters deliberately survive re-registration
    /// (in-flight `decrement_tasks` calls still land).
    pub fn add(&self, info: WorkerInfo) {
        let mut workers = self.workers.write();
        match workers.get_mut(&info.id) {
            Some(existing) => {
                existing.address = info.address;
                existing.capabilities = info.capabilities;
                existing.source = info.source;
                existing.touch_heartbeat();
                if existing.state == WorkerState::Unhealthy {
                    existing.state = existing.revived_state();
                }
                debug!("registry"; "refreshed worker {}", existing.id);
            }
            None => {
                debug!("registry"; "registered worker {} at {}", info.id, info.address);
                workers.insert(info.id.clone(), info);
            }
        }
    }

    /// Explicit removal.
    pub fn remove(&self, id: &str) -> Result<(), RegistryError> {
        match self.workers.write().remove(id) {
            Some(_) => {
                log!("registry"; "unregistered worker {id}");
                Ok(())
            }
            None => Err(RegistryError::UnknownWorker(id.into())),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.workers.read().contains_key(id)
    }

    // ------------------------------------------------------------------
    // Reads (deep copies)
    // ------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Option<WorkerInfo> {
        self.workers.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<WorkerInfo> {
        self.workers.read().values().cloned().collect()
    }

    /// Healthy workers that can serve `build_type` targeting `arch`.
    ///
    /// `client_os` narrows to OS-equal workers; preprocessed sources
    /// embed host-specific header expansions, so cross-OS placement is
    /// only legal in raw-source mode (no filter).
    pub fn list_by_capability(
        &self,
        build_type: BuildType,
        arch: Arch,
        client_os: Option<&str>,
    ) -> Vec<WorkerInfo> {
        self.workers
            .read()
            .values()
            .filter(|w| w.state != WorkerState::Unhealthy)
            .filter(|w| w.capabilities.supports_build(build_type))
            .filter(|w| w.capabilities.supports_arch(arch))
            .filter(|w| {
                client_os.is_none_or(|os| w.capabilities.os.eq_ignore_ascii_case(os))
            })
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub fn update_state(&self, id: &str, state: WorkerState) -> Result<(), RegistryError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.into()))?;
        worker.state = state;
        Ok(())
    }

    /// Refresh the heartbeat; revives an Unhealthy worker.
    pub fn update_heartbeat(&self, id: &str) -> Result<(), RegistryError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.into()))?;
        worker.touch_heartbeat();
        if worker.state == WorkerState::Unhealthy {
            worker.state = worker.revived_state();
            debug!("registry"; "worker {id} revived by heartbeat");
        }
        Ok(())
    }

    /// Record one dispatched task.
    pub fn increment_tasks(&self, id: &str) -> Result<(), RegistryError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.into()))?;
        worker.active_tasks += 1;
        if worker.state != WorkerState::Unhealthy {
            worker.state = WorkerState::Busy;
        }
        Ok(())
    }

    /// Record one completed task and fold `elapsed` into the rolling
    /// average on success. `active_tasks` never goes below zero.
    pub fn decrement_tasks(
        &self,
        id: &str,
        success: bool,
        elapsed: Duration,
    ) -> Result<(), RegistryError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.into()))?;

        worker.active_tasks = worker.active_tasks.saturating_sub(1);
        worker.total_tasks += 1;
        if success {
            worker.successful_tasks += 1;
            let succ = worker.successful_tasks as f64;
            let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
            worker.avg_compile_time_ms =
                (worker.avg_compile_time_ms * (succ - 1.0) + elapsed_ms) / succ;
        } else {
            worker.failed_tasks += 1;
        }

        if worker.state != WorkerState::Unhealthy {
            worker.state = if worker.active_tasks > 0 {
                WorkerState::Busy
            } else {
                WorkerState::Idle
            };
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Staleness
    // ------------------------------------------------------------------

    /// Demote every worker whose heartbeat is older than the TTL.
    /// Returns how many were demoted in this pass.
    pub fn sweep_stale(&self) -> usize {
        let mut workers = self.workers.write();
        let mut demoted = 0;
        for worker in workers.values_mut() {
            if worker.state != WorkerState::Unhealthy
                && worker.last_heartbeat.elapsed() > self.heartbeat_ttl
            {
                worker.state = WorkerState::Unhealthy;
                demoted += 1;
                log!("registry"; "worker {} unhealthy (no heartbeat for {:?})",
                    worker.id, worker.last_heartbeat.elapsed());
            }
        }
        demoted
    }
}

/// Run the staleness sweep every `ttl/2` until shutdown.
pub fn spawn_staleness_sweep(
    registry: Arc<WorkerRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = registry.heartbeat_ttl() / 2;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    registry.sweep_stale();
                }
                _ = shutdown.changed() => {
                    debug!("registry"; "staleness sweep stopped");
                    break;
                }
            }
        }
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DiscoverySource;

    fn caps(arch: Arch, os: &str, cross: bool) -> WorkerCapabilities {
        WorkerCapabilities {
            hostname: "host".into(),
            native_arch: arch,
            os: os.into(),
            cpu_cores: 4,
            memory_bytes: 8 << 30,
            cpp: Some(CppCapability {
                compilers: vec!["gcc".into()],
                cross_compile: cross,
            }),
            max_parallel_tasks: 4,
            ..Default::default()
        }
    }

    fn worker(id: &str, arch: Arch, os: &str) -> WorkerInfo {
        WorkerInfo::new(id, "127.0.0.1:7071", caps(arch, os, false), DiscoverySource::Manual)
    }

    #[test]
    fn test_add_and_get_returns_copy() {
        let registry = WorkerRegistry::new(Duration::from_secs(30));
        registry.add(worker("w1", Arch::X86_64, "linux"));

        let mut copy = registry.get("w1").unwrap();
        copy.active_tasks = 99;
        // the canonical entry is untouched
        assert_eq!(registry.get("w1").unwrap().active_tasks, 0);
    }

    #[test]
    fn test_readd_preserves_counters_and_revives() {
        let registry = WorkerRegistry::new(Duration::from_secs(30));
        registry.add(worker("w1", Arch::X86_64, "linux"));
        registry.increment_tasks("w1").unwrap();
        registry.update_state("w1", WorkerState::Unhealthy).unwrap();

        registry.add(worker("w1", Arch::X86_64, "linux"));
        let info = registry.get("w1").unwrap();
        assert_eq!(info.active_tasks, 1);
        assert_eq!(info.state, WorkerState::Busy);
    }

    #[test]
    fn test_remove_unknown_fails() {
        let registry = WorkerRegistry::new(Duration::from_secs(30));
        assert!(registry.remove("nope").is_err());
    }

    #[test]
    fn test_active_tasks_never_negative() {
        let registry = WorkerRegistry::new(Duration::from_secs(30));
        registry.add(worker("w1", Arch::X86_64, "linux"));

        registry.increment_tasks("w1").unwrap();
        registry.decrement_tasks("w1", true, Duration::from_millis(10)).unwrap();
        registry.decrement_tasks("w1", false, Duration::ZERO).unwrap();

        let info = registry.get("w1").unwrap();
        assert_eq!(info.active_tasks, 0);
        assert_eq!(info.state, WorkerState::Idle);
        assert_eq!(info.total_tasks, 2);
    }

    #[test]
    fn test_rolling_average() {
        let registry = WorkerRegistry::new(Duration::from_secs(30));
        registry.add(worker("w1", Arch::X86_64, "linux"));

        for ms in [100u64, 200, 300] {
            registry.increment_tasks("w1").unwrap();
            registry.decrement_tasks("w1", true, Duration::from_millis(ms)).unwrap();
        }
        let info = registry.get("w1").unwrap();
        assert!((info.avg_compile_time_ms - 200.0).abs() < 1e-6);
        assert_eq!(info.successful_tasks, 3);
    }

    #[test]
    fn test_busy_state_tracks_occupancy() {
        let registry = WorkerRegistry::new(Duration::from_secs(30));
        registry.add(worker("w1", Arch::X86_64, "linux"));

        registry.increment_tasks("w1").unwrap();
        registry.increment_tasks("w1").unwrap();
        assert_eq!(registry.get("w1").unwrap().state, WorkerState::Busy);

        registry.decrement_tasks("w1", true, Duration::ZERO).unwrap();
        assert_eq!(registry.get("w1").unwrap().state, WorkerState::Busy);

        registry.decrement_tasks("w1", true, Duration::ZERO).unwrap();
        assert_eq!(registry.get("w1").unwrap().state, WorkerState::Idle);
    }

    #[test]
    fn test_list_by_capability_filters() {
        let registry = WorkerRegistry::new(Duration::from_secs(30));
        registry.add(worker("linux-x86", Arch::X86_64, "linux"));
        registry.add(worker("mac-arm", Arch::Arm64, "darwin"));

        let mut cross = worker("cross", Arch::Arm64, "linux");
        cross.capabilities.cpp.as_mut().unwrap().cross_compile = true;
        registry.add(cross);

        // arch filter: native or cross
        let x86 = registry.list_by_capability(BuildType::Cpp, Arch::X86_64, None);
        let ids: Vec<_> = x86.iter().map(|w| w.id.as_str()).collect();
        assert!(ids.contains(&"linux-x86"));
        assert!(ids.contains(&"cross"));
        assert!(!ids.contains(&"mac-arm"));

        // os filter narrows further
        let linux_only = registry.list_by_capability(BuildType::Cpp, Arch::X86_64, Some("linux"));
        assert_eq!(linux_only.len(), 2);

        // unhealthy workers are omitted
        registry.update_state("linux-x86", WorkerState::Unhealthy).unwrap();
        let after = registry.list_by_capability(BuildType::Cpp, Arch::X86_64, Some("linux"));
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, "cross");
    }

    #[test]
    fn test_build_type_capability() {
        let registry = WorkerRegistry::new(Duration::from_secs(30));
        registry.add(worker("w1", Arch::X86_64, "linux"));
        assert!(registry.list_by_capability(BuildType::Go, Arch::Unspecified, None).is_empty());
        assert_eq!(registry.list_by_capability(BuildType::Cpp, Arch::Unspecified, None).len(), 1);
    }

    #[test]
    fn test_sweep_demotes_stale_and_heartbeat_revives() {
        let registry = WorkerRegistry::new(Duration::from_millis(5));
        registry.add(worker("w1", Arch::X86_64, "linux"));

        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(registry.sweep_stale(), 1);
        assert_eq!(registry.get("w1").unwrap().state, WorkerState::Unhealthy);
        assert!(registry.list_by_capability(BuildType::Cpp, Arch::Unspecified, None).is_empty());

        registry.update_heartbeat("w1").unwrap();
        assert_eq!(registry.get("w1").unwrap().state, WorkerState::Idle);
        // a second sweep right after the heartbeat demotes nothing
        assert_eq!(registry.sweep_stale(), 0);
    }
}
