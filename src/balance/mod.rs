//! Worker selection: Power-of-Two-Choices over a scored candidate set.
//!
//! Candidate filtering and scoring run against a registry snapshot
//! taken once per selection; scores are never re-sampled between the
//! two picks.

mod breaker;
mod ewma;

pub use breaker::{BreakerManager, CircuitState};
pub use ewma::LatencyTracker;

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::Rng;

use crate::config::SchedulerConfig;
use crate::core::{Arch, BuildType, DiscoverySource, ScheduleError};
use crate::debug;
use crate::registry::{WorkerInfo, WorkerRegistry};

// =============================================================================
// Score weights
// =============================================================================

/// Native arch match (or unspecified target)
const SCORE_NATIVE_ARCH: f64 = 50.0;
/// Cross-compile available but non-native
const SCORE_CROSS_ARCH: f64 = 25.0;
/// Per CPU core, capped
const SCORE_PER_CORE: f64 = 10.0;
const CORE_CAP: u32 = 16;
/// Per GB of RAM, capped
const SCORE_PER_GB: f64 = 5.0;
const GB_CAP: u64 = 64;
/// Per active task
const SCORE_PER_ACTIVE: f64 = -15.0;
/// Per millisecond of smoothed latency
const SCORE_PER_LATENCY_MS: f64 = -0.5;
/// LAN-discovered workers
const SCORE_LAN: f64 = 20.0;

// =============================================================================
// Scheduler
// =============================================================================

/// Chooses one worker per compile task.
pub struct Scheduler {
    registry: Arc<WorkerRegistry>,
    breakers: Arc<BreakerManager>,
    latency: LatencyTracker,
    max_active_tasks: u32,
}

impl Scheduler {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        breakers: Arc<BreakerManager>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            breakers,
            latency: LatencyTracker::new(config.ewma_alpha, config.default_latency_ms),
            max_active_tasks: config.max_active_tasks,
        }
    }

    /// Pick a worker for `(build_type, target_arch, client_os)`.
    pub fn select(
        &self,
        build_type: BuildType,
        target_arch: Arch,
        client_os: Option<&str>,
    ) -> Result<WorkerInfo, ScheduleError> {
        let candidates = self.registry.list_by_capability(build_type, target_arch, client_os);
        if candidates.is_empty() {
            // Distinguish an empty fleet from an unsatisfiable filter.
            return if self.registry.list().is_empty() {
                Err(ScheduleError::NoWorkers)
            } else {
                Err(ScheduleError::NoMatchingWorkers)
            };
        }

        // Primary filter: circuit closed and below the load threshold.
        let filtered: Vec<&WorkerInfo> = candidates
            .iter()
            .filter(|w| !self.breakers.is_open(&w.id))
            .filter(|w| w.active_tasks < self.max_active_tasks)
            .collect();

        // Relaxed pass keeps every healthy candidate: a tripped breaker
        // or a loaded worker beats failing the compile outright.
        let pool: Vec<&WorkerInfo> = if filtered.is_empty() {
            debug!("sched"; "relaxing filters: {} candidates all tripped or loaded", candidates.len());
            candidates.iter().collect()
        } else {
            filtered
        };

        if pool.is_empty() {
            return Err(ScheduleError::NoMatchingWorkers);
        }
        if pool.len() == 1 {
            return Ok(pool[0].clone());
        }

        // Two distinct indices, crypto-seeded (replicas must not draw
        // identical sequences).
        let mut rng = OsRng;
        let first = rng.gen_range(0..pool.len());
        let second = (first + 1 + rng.gen_range(0..pool.len() - 1)) % pool.len();

        let a = pool[first];
        let b = pool[second];
        let score_a = self.score(a, target_arch);
        let score_b = self.score(b, target_arch);
        debug!("sched"; "p2c {}:{:.1} vs {}:{:.1}", a.id, score_a, b.id, score_b);

        // Ties break to the first pick.
        if score_b > score_a {
            Ok(b.clone())
        } else {
            Ok(a.clone())
        }
    }

    /// Additive placement score; higher is better.
    fn score(&self, worker: &WorkerInfo, target_arch: Arch) -> f64 {
        let caps = &worker.capabilities;
        let mut score = 0.0;

        if target_arch == Arch::Unspecified || caps.native_arch == target_arch {
            score += SCORE_NATIVE_ARCH;
        } else if caps.supports_arch(target_arch) {
            score += SCORE_CROSS_ARCH;
        }

        score += SCORE_PER_CORE * f64::from(caps.cpu_cores.min(CORE_CAP));
        let gb = (caps.memory_bytes >> 30).min(GB_CAP);
        score += SCORE_PER_GB * gb as f64;
        score += SCORE_PER_ACTIVE * f64::from(worker.active_tasks);
        score += SCORE_PER_LATENCY_MS * self.latency.get(&worker.id);
        if worker.source == DiscoverySource::Lan {
            score += SCORE_LAN;
        }
        score
    }

    /// Feed the latency EWMA after a successful remote completion.
    pub fn report_success(&self, id: &str, latency_ms: f64) {
        self.latency.update(id, latency_ms);
    }

    /// Failure accounting lives in the circuit breaker; nothing to do
    /// at this layer.
    pub fn report_failure(&self, _id: &str) {}

    /// Drop the latency history for a permanently removed worker.
    pub fn forget(&self, id: &str) {
        self.latency.remove(id);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitConfig;
    use crate::registry::{CppCapability, WorkerCapabilities};
    use rustc_hash::FxHashMap;
    use std::time::Duration;

    fn caps(arch: Arch, cores: u32, gb: u64, cross: bool) -> WorkerCapabilities {
        WorkerCapabilities {
            hostname: "host".into(),
            native_arch: arch,
            os: "linux".into(),
            cpu_cores: cores,
            memory_bytes: gb << 30,
            cpp: Some(CppCapability {
                compilers: vec!["gcc".into()],
                cross_compile: cross,
            }),
            max_parallel_tasks: 8,
            ..Default::default()
        }
    }

    fn scheduler(registry: Arc<WorkerRegistry>) -> Scheduler {
        let breakers = Arc::new(BreakerManager::new(&CircuitConfig::default()));
        Scheduler::new(registry, breakers, &SchedulerConfig::default())
    }

    fn add_worker(
        registry: &WorkerRegistry,
        id: &str,
        arch: Arch,
        cores: u32,
        gb: u64,
        cross: bool,
        source: DiscoverySource,
    ) {
        registry.add(WorkerInfo::new(id, "addr", caps(arch, cores, gb, cross), source));
    }

    #[test]
    fn test_empty_registry_is_no_workers() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        let sched = scheduler(registry);
        assert!(matches!(
            sched.select(BuildType::Cpp, Arch::Unspecified, None),
            Err(ScheduleError::NoWorkers)
        ));
    }

    #[test]
    fn test_unsatisfiable_filter_is_no_matching() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        add_worker(&registry, "w1", Arch::X86_64, 4, 8, false, DiscoverySource::Manual);
        let sched = scheduler(registry);
        assert!(matches!(
            sched.select(BuildType::Cpp, Arch::Unspecified, Some("windows")),
            Err(ScheduleError::NoMatchingWorkers)
        ));
    }

    #[test]
    fn test_single_candidate_returned() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        add_worker(&registry, "only", Arch::X86_64, 4, 8, false, DiscoverySource::Manual);
        let sched = scheduler(registry);
        let picked = sched.select(BuildType::Cpp, Arch::Unspecified, None).unwrap();
        assert_eq!(picked.id, "only");
    }

    #[test]
    fn test_loaded_workers_filtered_then_relaxed() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        add_worker(&registry, "busy", Arch::X86_64, 4, 8, false, DiscoverySource::Manual);
        add_worker(&registry, "idle", Arch::X86_64, 4, 8, false, DiscoverySource::Manual);
        for _ in 0..8 {
            registry.increment_tasks("busy").unwrap();
        }
        let sched = scheduler(registry.clone());

        // load filter removes the saturated worker
        let picked = sched.select(BuildType::Cpp, Arch::Unspecified, None).unwrap();
        assert_eq!(picked.id, "idle");

        // with every candidate saturated, the relaxed pass still serves
        for _ in 0..8 {
            registry.increment_tasks("idle").unwrap();
        }
        assert!(sched.select(BuildType::Cpp, Arch::Unspecified, None).is_ok());
    }

    #[test]
    fn test_p2c_prefers_higher_score() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        // W1: native, idle, 16 cores, 64 GB, LAN
        add_worker(&registry, "w1", Arch::X86_64, 16, 64, false, DiscoverySource::Lan);
        // W2: cross-only, loaded, 2 cores, 4 GB, WAN
        add_worker(&registry, "w2", Arch::Arm64, 2, 4, true, DiscoverySource::Wan);
        for _ in 0..5 {
            registry.increment_tasks("w2").unwrap();
        }
        let sched = scheduler(registry);

        let mut w1_wins = 0;
        for _ in 0..200 {
            let picked = sched.select(BuildType::Cpp, Arch::X86_64, None).unwrap();
            if picked.id == "w1" {
                w1_wins += 1;
            }
        }
        assert!(w1_wins >= 170, "w1 chosen only {w1_wins}/200 times");
    }

    #[test]
    fn test_fairness_with_equal_scores() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        for i in 0..4 {
            add_worker(
                &registry,
                &format!("w{i}"),
                Arch::X86_64,
                8,
                16,
                false,
                DiscoverySource::Manual,
            );
        }
        let sched = scheduler(registry);

        let rounds = 8000usize;
        let mut wins: FxHashMap<String, usize> = FxHashMap::default();
        for _ in 0..rounds {
            let picked = sched.select(BuildType::Cpp, Arch::Unspecified, None).unwrap();
            *wins.entry(picked.id).or_default() += 1;
        }

        let expected = rounds / 4;
        for (id, count) in wins {
            let deviation = (count as f64 - expected as f64).abs() / expected as f64;
            assert!(deviation < 0.1, "worker {id} picked {count} times (±{:.0}%)", deviation * 100.0);
        }
    }

    #[test]
    fn test_score_components() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        let sched = scheduler(registry);

        let native = WorkerInfo::new(
            "native",
            "addr",
            caps(Arch::X86_64, 4, 8, false),
            DiscoverySource::Lan,
        );
        // 50 (arch) + 40 (cores) + 40 (ram) + 20 (lan) - 50 (default 100ms latency)
        assert_eq!(sched.score(&native, Arch::X86_64), 100.0);

        let cross = WorkerInfo::new(
            "cross",
            "addr",
            caps(Arch::Arm64, 4, 8, true),
            DiscoverySource::Manual,
        );
        // 25 (cross) + 40 + 40 - 50
        assert_eq!(sched.score(&cross, Arch::X86_64), 55.0);
    }

    #[test]
    fn test_caps_bound_scores() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        let sched = scheduler(registry);
        let monster = WorkerInfo::new(
            "big",
            "addr",
            caps(Arch::X86_64, 128, 512, false),
            DiscoverySource::Manual,
        );
        // cores capped at 16, ram capped at 64 GB
        assert_eq!(sched.score(&monster, Arch::X86_64), 50.0 + 160.0 + 320.0 - 50.0);
    }

    #[test]
    fn test_ewma_feedback_shifts_score() {
        let registry = Arc::new(WorkerRegistry::new(Duration::from_secs(30)));
        let sched = scheduler(registry);
        let w = WorkerInfo::new("w", "addr", caps(Arch::X86_64, 4, 8, false), DiscoverySource::Manual);

        let before = sched.score(&w, Arch::Unspecified);
        sched.report_success("w", 500.0);
        let after = sched.score(&w, Arch::Unspecified);
        assert!(after < before);
    }
}
