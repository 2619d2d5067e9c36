//! Error types shared across the scheduling and cache planes.

use std::path::PathBuf;
use thiserror::Error;

/// Registry mutation failures.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("worker `{0}` is not registered")]
    UnknownWorker(String),
}

/// Worker selection failures.
///
/// The two variants are deliberately distinct: `NoWorkers` means the
/// registry has nothing for this build type at all, `NoMatchingWorkers`
/// means candidates exist but none pass the capability/health filters.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("no workers registered")]
    NoWorkers,
    #[error("no matching workers for the requested capability set")]
    NoMatchingWorkers,
}

/// Circuit breaker refusals.
#[derive(Debug, Error)]
pub enum CircuitError {
    #[error("circuit open for worker `{0}`")]
    Open(String),
    #[error("circuit half-open, probe budget exhausted for worker `{0}`")]
    ProbeBudget(String),
}

/// Content-addressed cache failures.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("invalid cache key: {0}")]
    InvalidKey(String),
    #[error("cache IO error at `{0}`")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("cache index serialization error")]
    Index(#[from] serde_json::Error),
}
