//! Per-worker latency smoothing.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

struct Ewma {
    value: f64,
    initialized: bool,
}

/// Exponentially weighted moving average of observed end-to-end compile
/// latency, per worker. Updated only on successful remote completions.
pub struct LatencyTracker {
    alpha: f64,
    default_ms: f64,
    samples: Mutex<FxHashMap<String, Ewma>>,
}

impl LatencyTracker {
    /// `alpha` is the smoothing factor in (0, 1]; `default_ms` is
    /// reported for workers with no samples yet.
    pub fn new(alpha: f64, default_ms: f64) -> Self {
        Self {
            alpha,
            default_ms,
            samples: Mutex::new(FxHashMap::default()),
        }
    }

    /// Fold one observation in. The first sample replaces the value
    /// outright; later samples move it by `alpha`.
    pub fn update(&self, id: &str, latency_ms: f64) {
        let mut samples = self.samples.lock();
        let entry = samples.entry(id.to_string()).or_insert(Ewma {
            value: 0.0,
            initialized: false,
        });
        if entry.initialized {
            entry.value = self.alpha * latency_ms + (1.0 - self.alpha) * entry.value;
        } else {
            entry.value = latency_ms;
            entry.initialized = true;
        }
    }

    /// Smoothed latency for `id`, or the default for unknown workers.
    pub fn get(&self, id: &str) -> f64 {
        self.samples
            .lock()
            .get(id)
            .filter(|e| e.initialized)
            .map(|e| e.value)
            .unwrap_or(self.default_ms)
    }

    /// Forget a worker (used on permanent unregistration).
    pub fn remove(&self, id: &str) {
        self.samples.lock().remove(id);
    }
}
