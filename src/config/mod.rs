//! Fleet configuration.
//!
//! Typed sections with serde defaults; every default matches the
//! documented tuning value. `GridConfig::from_toml_str` is the surface
//! the config-file loader (out of tree) consumes; tests and binaries
//! use it directly.
//!
//! # Example
//!
//! ```toml
//! [coordinator]
//! listen = "0.0.0.0:7070"
//! heartbeat_ttl_secs = 30
//!
//! [cache]
//! dir = "~/.hybrid-grid/cache"
//! max_size_bytes = 2147483648
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parsing error")]
    Toml(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration for every process in the fleet.
///
/// Each binary reads the sections it cares about and ignores the rest,
/// so one file can describe a whole deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub coordinator: CoordinatorConfig,
    pub worker: WorkerConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub circuit: CircuitConfig,
}

impl GridConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                let input = std::fs::read_to_string(path).map_err(|e| {
                    ConfigError::Validation(format!("cannot read `{}`: {e}", path.display()))
                })?;
                Self::from_toml_str(&input)
            }
            None => Ok(Self::default()),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator.heartbeat_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "coordinator.heartbeat_ttl_secs must be nonzero".into(),
            ));
        }
        if self.coordinator.request_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "coordinator.request_timeout_secs must be nonzero".into(),
            ));
        }
        if self.retry.max == 0 {
            return Err(ConfigError::Validation("retry.max must be at least 1".into()));
        }
        if self.retry.initial_ms > self.retry.cap_ms {
            return Err(ConfigError::Validation(
                "retry.initial_ms must not exceed retry.cap_ms".into(),
            ));
        }
        if !(self.circuit.failure_ratio > 0.0 && self.circuit.failure_ratio <= 1.0) {
            return Err(ConfigError::Validation(
                "circuit.failure_ratio must be in (0, 1]".into(),
            ));
        }
        if !(self.scheduler.ewma_alpha > 0.0 && self.scheduler.ewma_alpha <= 1.0) {
            return Err(ConfigError::Validation(
                "scheduler.ewma_alpha must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Sections
// ============================================================================

/// `[coordinator]` - scheduler/registry daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Listen address for the coordinator RPC endpoint.
    pub listen: String,

    /// Staleness threshold for worker heartbeats, seconds.
    /// The sweep period is half of this value.
    pub heartbeat_ttl_secs: u64,

    /// Per-task deadline applied at the coordinator and the worker, seconds.
    pub request_timeout_secs: u64,

    /// Optional shared bearer token workers must present at Handshake.
    pub auth_token: Option<String>,
}

impl CoordinatorConfig {
    pub fn heartbeat_ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7070".into(),
            heartbeat_ttl_secs: 30,
            request_timeout_secs: 120,
            auth_token: None,
        }
    }
}

/// `[worker]` - executor daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Listen address for the worker RPC endpoint.
    pub listen: String,

    /// Address advertised to the coordinator; defaults to `listen`.
    pub advertise: Option<String>,

    /// Coordinator endpoint to handshake against.
    pub coordinator: String,

    /// Bearer token presented at Handshake, when the coordinator
    /// requires one.
    pub auth_token: Option<String>,

    /// Hard concurrency cap. `0` means "number of CPU cores".
    pub max_parallel_tasks: usize,

    /// Image name prefix for the sandboxed cross-compile containers;
    /// the per-architecture image is `<prefix>-<arch>:latest`.
    pub container_image_prefix: String,
}

impl WorkerConfig {
    /// Concurrency cap with the `0 = cores` default resolved.
    pub fn effective_max_parallel(&self) -> usize {
        if self.max_parallel_tasks > 0 {
            self.max_parallel_tasks
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        }
    }

    /// Address workers announce at Handshake.
    pub fn advertised_address(&self) -> &str {
        self.advertise.as_deref().unwrap_or(&self.listen)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7071".into(),
            advertise: None,
            coordinator: "http://127.0.0.1:7070".into(),
            auth_token: None,
            max_parallel_tasks: 0,
            container_image_prefix: "hybridgrid/cross".into(),
        }
    }
}

/// `[cache]` - client-side content-addressed object cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root directory. `~` is expanded.
    pub dir: String,

    /// Size bound; eviction drains to 80% of this.
    pub max_size_bytes: u64,

    /// Entry time-to-live, hours.
    pub ttl_hours: u64,
}

impl CacheConfig {
    /// Cache root with `~` expanded.
    pub fn root(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.dir).as_ref())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours * 3600)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: "~/.hybrid-grid/cache".into(),
            max_size_bytes: 2 * 1024 * 1024 * 1024,
            ttl_hours: 168,
        }
    }
}

/// `[retry]` - client-side remote dispatch retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts (first try included).
    pub max: u32,

    /// First backoff, milliseconds. Doubles per attempt.
    pub initial_ms: u64,

    /// Backoff ceiling, milliseconds.
    pub cap_ms: u64,
}

impl RetryConfig {
    /// Backoff after the `n`th failed attempt (1-based): initial,
    /// doubled per attempt, capped.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(32);
        let ms = self.initial_ms.saturating_mul(1u64 << exp).min(self.cap_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max: 3, initial_ms: 100, cap_ms: 5000 }
    }
}

/// `[scheduler]` - placement tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Workers at or above this many active tasks are filtered out of
    /// the candidate set (soft backpressure ahead of the worker's own
    /// hard cap).
    pub max_active_tasks: u32,

    /// Latency assumed for workers with no samples yet, milliseconds.
    pub default_latency_ms: f64,

    /// EWMA smoothing factor for observed latency.
    pub ewma_alpha: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active_tasks: 8,
            default_latency_ms: 100.0,
            ewma_alpha: 0.5,
        }
    }
}

/// `[circuit]` - per-worker circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// In-flight probes allowed while half-open.
    pub max_probe: u32,

    /// Sliding-window length for failure accounting, seconds.
    pub interval_secs: u64,

    /// How long an open breaker refuses calls before probing, seconds.
    pub open_timeout_secs: u64,

    /// Failure ratio that trips a closed breaker.
    pub failure_ratio: f64,

    /// Minimum requests in a window before the ratio is meaningful.
    pub min_requests: u64,
}

impl CircuitConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            max_probe: 3,
            interval_secs: 10,
            open_timeout_secs: 60,
            failure_ratio: 0.6,
            min_requests: 3,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
