//! Per-worker circuit breakers.
//!
//! A breaker trips on sustained transport failure, refuses calls for a
//! cool-off window, then lets a bounded number of probes through before
//! closing again. Compile-level failures never reach this layer; only
//! transport outcomes are recorded.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::CircuitConfig;
use crate::core::CircuitError;

/// Observer invoked on every state transition: `(worker_id, from, to)`.
pub type StateChangeFn = dyn Fn(&str, CircuitState, CircuitState) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

struct Breaker {
    state: CircuitState,
    window_started: Instant,
    requests: u64,
    failures: u64,
    opened_at: Instant,
    probes_in_flight: u32,
    probe_successes: u32,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window_started: Instant::now(),
            requests: 0,
            failures: 0,
            opened_at: Instant::now(),
            probes_in_flight: 0,
            probe_successes: 0,
        }
    }
}

/// Lazily created breakers, one per worker id.
pub struct BreakerManager {
    max_probe: u32,
    interval: Duration,
    open_timeout: Duration,
    failure_ratio: f64,
    min_requests: u64,
    breakers: DashMap<String, Mutex<Breaker>>,
    listener: Option<Box<StateChangeFn>>,
}

impl BreakerManager {
    pub fn new(config: &CircuitConfig) -> Self {
        Self::with_params(
            config.max_probe,
            config.interval(),
            config.open_timeout(),
            config.failure_ratio,
            config.min_requests,
        )
    }

    pub fn with_params(
        max_probe: u32,
        interval: Duration,
        open_timeout: Duration,
        failure_ratio: f64,
        min_requests: u64,
    ) -> Self {
        Self {
            max_probe,
            interval,
            open_timeout,
            failure_ratio,
            min_requests,
            breakers: DashMap::new(),
            listener: None,
        }
    }

    /// Install a state-change observer.
    pub fn with_listener(
        mut self,
        listener: impl Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    ) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    /// Current state. Unknown ids are Closed; an Open breaker whose
    /// cool-off has elapsed reads as HalfOpen.
    pub fn state(&self, id: &str) -> CircuitState {
        let Some(entry) = self.breakers.get(id) else {
            return CircuitState::Closed;
        };
        let mut breaker = entry.lock();
        self.advance_open(id, &mut breaker);
        breaker.state
    }

    /// Projection of `state` used by the scheduler's candidate filter.
    pub fn is_open(&self, id: &str) -> bool {
        self.state(id) == CircuitState::Open
    }

    /// Admission check before a call to `id`. A successful acquire MUST
    /// be paired with exactly one `record`.
    pub fn try_acquire(&self, id: &str) -> Result<(), CircuitError> {
        let entry = self
            .breakers
            .entry(id.to_string())
            .or_insert_with(|| Mutex::new(Breaker::new()));
        let mut breaker = entry.lock();
        self.advance_open(id, &mut breaker);

        match breaker.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(CircuitError::Open(id.into())),
            CircuitState::HalfOpen => {
                if breaker.probes_in_flight < self.max_probe {
                    breaker.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(CircuitError::ProbeBudget(id.into()))
                }
            }
        }
    }

    /// Record the outcome of an admitted call.
    pub fn record(&self, id: &str, success: bool) {
        let Some(entry) = self.breakers.get(id) else {
            return;
        };
        let mut breaker = entry.lock();
        match breaker.state {
            CircuitState::Closed => {
                // Rolling interval: stale windows restart the counters.
                if breaker.window_started.elapsed() > self.interval {
                    breaker.window_started = Instant::now();
                    breaker.requests = 0;
                    breaker.failures = 0;
                }
                breaker.requests += 1;
                if !success {
                    breaker.failures += 1;
                }
                let ratio = breaker.failures as f64 / breaker.requests as f64;
                if breaker.requests >= self.min_requests && ratio >= self.failure_ratio {
                    self.transition(id, &mut breaker, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                breaker.probes_in_flight = breaker.probes_in_flight.saturating_sub(1);
                if success {
                    breaker.probe_successes += 1;
                    if breaker.probe_successes >= self.max_probe {
                        self.transition(id, &mut breaker, CircuitState::Closed);
                    }
                } else {
                    // Any probe failure restarts the cool-off.
                    self.transition(id, &mut breaker, CircuitState::Open);
                }
            }
            // Late results for calls admitted before the trip.
            CircuitState::Open => {}
        }
    }

    /// Lazy Open → HalfOpen transition once the cool-off elapses.
    fn advance_open(&self, id: &str, breaker: &mut Breaker) {
        if breaker.state == CircuitState::Open && breaker.opened_at.elapsed() >= self.open_timeout {
            self.transition(id, breaker, CircuitState::HalfOpen);
        }
    }

    fn transition(&self, id: &str, breaker: &mut Breaker, to: CircuitState) {
        let from = breaker.state;
        if from == to {
            return;
        }
        breaker.state = to;
        match to {
            CircuitState::Open => {
                breaker.opened_at = Instant::now();
            }
            CircuitState::HalfOpen => {
                breaker.probes_in_flight = 0;
                breaker.probe_successes = 0;
            }
            CircuitState::Closed => {
                breaker.window_started = Instant::now();
                breaker.requests = 0;
                breaker.failures = 0;
            }
        }
        if let Some(listener) = &self.listener {
            listener(id, from, to);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn manager(open_timeout: Duration) -> BreakerManager {
        BreakerManager::with_params(3, Duration::from_secs(10), open_timeout, 0.6, 3)
    }

    fn run(m: &BreakerManager, id: &str, success: bool) {
        m.try_acquire(id).unwrap();
        m.record(id, success);
    }

    #[test]
    fn test_unknown_is_closed() {
        let m = manager(Duration::from_secs(60));
        assert_eq!(m.state("w"), CircuitState::Closed);
        assert!(!m.is_open("w"));
    }

    #[test]
    fn test_trips_at_failure_ratio() {
        let m = manager(Duration::from_secs(60));
        run(&m, "w", false);
        run(&m, "w", true);
        assert_eq!(m.state("w"), CircuitState::Closed);
        // third request: 2/3 failures >= 0.6
        run(&m, "w", false);
        assert_eq!(m.state("w"), CircuitState::Open);
        assert!(m.try_acquire("w").is_err());
    }

    #[test]
    fn test_below_min_requests_never_trips() {
        let m = manager(Duration::from_secs(60));
        run(&m, "w", false);
        run(&m, "w", false);
        assert_eq!(m.state("w"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_timeout_then_closes() {
        let m = manager(Duration::from_millis(20));
        for _ in 0..3 {
            run(&m, "w", false);
        }
        assert!(m.is_open("w"));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(m.state("w"), CircuitState::HalfOpen);

        // max_probe consecutive successes close the breaker
        for _ in 0..3 {
            run(&m, "w", true);
        }
        assert_eq!(m.state("w"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let m = manager(Duration::from_millis(20));
        for _ in 0..3 {
            run(&m, "w", false);
        }
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(m.state("w"), CircuitState::HalfOpen);

        run(&m, "w", false);
        assert!(m.is_open("w"));
        // the cool-off restarted: still open immediately after
        assert!(m.try_acquire("w").is_err());
    }

    #[test]
    fn test_half_open_probe_budget() {
        let m = manager(Duration::from_millis(10));
        for _ in 0..3 {
            run(&m, "w", false);
        }
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(m.state("w"), CircuitState::HalfOpen);

        // three probes may be in flight, the fourth is refused
        m.try_acquire("w").unwrap();
        m.try_acquire("w").unwrap();
        m.try_acquire("w").unwrap();
        assert!(matches!(m.try_acquire("w"), Err(CircuitError::ProbeBudget(_))));
    }

    #[test]
    fn test_listener_sees_transitions() {
        let transitions = Arc::new(AtomicUsize::new(0));
        let seen = transitions.clone();
        let m = manager(Duration::from_secs(60)).with_listener(move |_, _, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..3 {
            run(&m, "w", false);
        }
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
    }
}
