//! Worker registry entries.

use std::time::Instant;

use crate::core::{Arch, BuildType, DiscoverySource, WorkerState};

// =============================================================================
// Capabilities
// =============================================================================

/// C/C++ toolchain description.
#[derive(Debug, Clone, Default)]
pub struct CppCapability {
    /// Compiler binaries present on the host (gcc, clang, cl, ...)
    pub compilers: Vec<String>,
    /// Whether non-native targets can be served (container images)
    pub cross_compile: bool,
}

/// Opaque descriptor for a non-C/C++ toolchain. Only presence matters
/// to the scheduler; the fields are informational.
#[derive(Debug, Clone, Default)]
pub struct ToolchainCapability {
    pub name: String,
    pub version: String,
}

/// Immutable per-registration description of a worker host.
#[derive(Debug, Clone, Default)]
pub struct WorkerCapabilities {
    pub hostname: String,
    pub native_arch: Arch,
    /// Operating system tag ("linux", "darwin", "windows")
    pub os: String,
    pub cpu_cores: u32,
    pub memory_bytes: u64,
    pub container_runtime: bool,
    pub cpp: Option<CppCapability>,
    pub go: Option<ToolchainCapability>,
    pub rust: Option<ToolchainCapability>,
    pub nodejs: Option<ToolchainCapability>,
    pub flutter: Option<ToolchainCapability>,
    /// Declared hard concurrency cap
    pub max_parallel_tasks: u32,
}

impl WorkerCapabilities {
    /// Whether this worker can serve `build_type` at all.
    pub fn supports_build(&self, build_type: BuildType) -> bool {
        match build_type {
            BuildType::Unspecified => true,
            BuildType::Cpp => self.cpp.as_ref().is_some_and(|c| !c.compilers.is_empty()),
            BuildType::Go => self.go.is_some(),
            BuildType::Rust => self.rust.is_some(),
            BuildType::NodeJs => self.nodejs.is_some(),
            BuildType::Flutter => self.flutter.is_some(),
        }
    }

    /// Whether this worker can produce objects for `target`: natively,
    /// or through a cross-compile backend.
    pub fn supports_arch(&self, target: Arch) -> bool {
        target == Arch::Unspecified
            || target == self.native_arch
            || self.cpp.as_ref().is_some_and(|c| c.cross_compile)
    }
}

// =============================================================================
// Registry entry
// =============================================================================

/// Mutable registry entry, keyed by worker id.
///
/// All registry reads hand out clones of this struct; the canonical
/// copy never escapes the registry lock.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub id: String,
    /// host:port of the worker's RPC endpoint
    pub address: String,
    pub capabilities: WorkerCapabilities,
    pub state: WorkerState,
    pub source: DiscoverySource,
    pub last_heartbeat: Instant,
    /// Wall-clock heartbeat mirror for status reporting
    pub last_heartbeat_unix: i64,
    pub registered_at: Instant,
    pub active_tasks: u32,
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    /// Rolling average over successful compiles, milliseconds
    pub avg_compile_time_ms: f64,
}

impl WorkerInfo {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        capabilities: WorkerCapabilities,
        source: DiscoverySource,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            capabilities,
            state: WorkerState::Idle,
            source,
            last_heartbeat: Instant::now(),
            last_heartbeat_unix: unix_now(),
            registered_at: Instant::now(),
            active_tasks: 0,
            total_tasks: 0,
            successful_tasks: 0,
            failed_tasks: 0,
            avg_compile_time_ms: 0.0,
        }
    }

    /// Refresh both heartbeat clocks.
    pub(crate) fn touch_heartbeat(&mut self) {
        self.last_heartbeat = Instant::now();
        self.last_heartbeat_unix = unix_now();
    }

    /// Occupancy-consistent state after leaving Unhealthy.
    pub(crate) fn revived_state(&self) -> WorkerState {
        if self.active_tasks > 0 {
            WorkerState::Busy
        } else {
            WorkerState::Idle
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
