use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation, requests flow through
    Closed,
    /// Circuit is tripped, requests fail fast without reaching the network
    Open,
    /// Probing whether the remote side has recovered
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures in the closed state before the circuit trips
    pub failure_threshold: u32,
    /// Fraction of half-open requests that must succeed to close again
    pub half_open_success_ratio: f64,
    /// Half-open requests observed before the ratio is evaluated
    pub min_request_threshold: u32,
    /// How long an open circuit rejects before letting a probe through
    pub open_duration_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
            half_open_success_ratio: 0.5,
            min_request_threshold: 10,
            open_duration_ms: 10_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub request_count: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    request_count: u32,
    last_failure: Option<Instant>,
}

impl BreakerInner {
    fn reset_counters(&mut self) {
        self.failure_count = 0;
        self.success_count = 0;
        self.request_count = 0;
    }
}

/// Health gate for one remote service.
///
/// `allow_request`, `record_success` and `record_failure` each run as one
/// critical section. The lock is never held across network I/O.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                request_count: 0,
                last_failure: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allow_request(&self) -> bool {
        self.allow_request_at(Instant::now())
    }

    /// Asks for permission to send a call as of `now`.
    ///
    /// An open circuit whose open window has elapsed admits this call as the
    /// first half-open probe.
    pub fn allow_request_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed > self.config.open_duration() {
                    inner.state = CircuitState::HalfOpen;
                    inner.reset_counters();
                    inner.request_count = 1;
                    tracing::info!("Circuit breaker for {} is now half-open", self.name);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                inner.request_count += 1;
                true
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                let required =
                    f64::from(inner.request_count) * self.config.half_open_success_ratio;
                if inner.request_count >= self.config.min_request_threshold
                    && f64::from(inner.success_count) >= required
                {
                    inner.state = CircuitState::Closed;
                    inner.reset_counters();
                    tracing::info!("Circuit breaker for {} closed after recovery", self.name);
                }
            }
            CircuitState::Closed => inner.reset_counters(),
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                tracing::warn!("Circuit breaker for {} reopened by a failed probe", self.name);
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    "Circuit breaker for {} opened after {} failures",
                    self.name,
                    inner.failure_count
                );
            }
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            request_count: inner.request_count,
        }
    }
}

/// Owns the breakers of one client, keyed by service name (or endpoint
/// label, depending on the dispatcher's breaker scope).
///
/// Breakers are created on first lookup and never removed. Racing first
/// lookups of one key still produce a single breaker.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Returns the breaker for `key`, creating it if needed.
    ///
    /// # Panics
    ///
    /// Panics if `key` is empty.
    pub fn get(&self, key: &str) -> Arc<CircuitBreaker> {
        assert!(!key.is_empty(), "circuit breaker requested for an empty key");

        if let Some(breaker) = self.breakers.get(key) {
            return Arc::clone(breaker.value());
        }
        let entry = self
            .breakers
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone())));
        Arc::clone(entry.value())
    }

    /// Snapshots of every breaker, sorted by key.
    pub fn states(&self) -> Vec<(String, BreakerSnapshot)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("UserService", CircuitBreakerConfig::default())
    }

    /// Trips the breaker at `at` and then lets the open window elapse.
    fn half_open(breaker: &CircuitBreaker, at: Instant) -> Instant {
        breaker.record_failure_at(at);
        breaker.record_failure_at(at);
        let after = at + Duration::from_millis(10_001);
        assert!(breaker.allow_request_at(after));
        after
    }

    #[test]
    fn test_circuit_breaker_config_default() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 2);
        assert_eq!(config.half_open_success_ratio, 0.5);
        assert_eq!(config.min_request_threshold, 10);
        assert_eq!(config.open_duration_ms, 10_000);
    }

    #[test]
    fn test_closed_always_allows() {
        let breaker = breaker();
        for _ in 0..100 {
            assert!(breaker.allow_request());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_two_failures_open_the_circuit() {
        let breaker = breaker();
        let now = Instant::now();
        breaker.record_failure_at(now);
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure_at(now);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request_at(now + Duration::from_millis(5_000)));
    }

    #[test]
    fn test_open_rejects_until_window_elapses() {
        let breaker = breaker();
        let now = Instant::now();
        breaker.record_failure_at(now);
        breaker.record_failure_at(now);

        // The window must be strictly exceeded
        assert!(!breaker.allow_request_at(now + Duration::from_millis(10_000)));
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.allow_request_at(now + Duration::from_millis(10_001)));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_probe_counts_as_first_half_open_request() {
        let breaker = breaker();
        half_open(&breaker, Instant::now());

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::HalfOpen);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
        assert_eq!(snapshot.request_count, 1);
    }

    #[test]
    fn test_single_half_open_failure_reopens() {
        let breaker = breaker();
        let probe_at = half_open(&breaker, Instant::now());

        breaker.record_failure_at(probe_at);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request_at(probe_at + Duration::from_millis(1)));
    }

    #[test]
    fn test_half_open_closes_after_enough_successes() {
        let breaker = breaker();
        let at = half_open(&breaker, Instant::now());

        for _ in 1..10 {
            assert!(breaker.allow_request_at(at));
        }
        for _ in 0..4 {
            breaker.record_success();
            assert_eq!(breaker.state(), CircuitState::HalfOpen);
        }
        breaker.record_success();

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
        assert_eq!(snapshot.request_count, 0);
    }

    #[test]
    fn test_half_open_stays_below_min_requests() {
        let breaker = breaker();
        half_open(&breaker, Instant::now());

        // Full success ratio but too few requests observed
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_success_in_closed_clears_failures() {
        let breaker = breaker();
        let now = Instant::now();
        breaker.record_failure_at(now);
        breaker.record_success();
        breaker.record_failure_at(now);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[test]
    fn test_success_while_open_is_ignored() {
        let breaker = breaker();
        let now = Instant::now();
        breaker.record_failure_at(now);
        breaker.record_failure_at(now);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_returns_same_breaker() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get("UserService");
        let b = registry.get("UserService");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_breakers_are_independent() {
        let registry = CircuitBreakerRegistry::default();
        let now = Instant::now();
        registry.get("A").record_failure_at(now);
        registry.get("A").record_failure_at(now);

        assert_eq!(registry.get("A").state(), CircuitState::Open);
        assert_eq!(registry.get("B").state(), CircuitState::Closed);

        let states = registry.states();
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].0, "A");
        assert_eq!(states[0].1.state, CircuitState::Open);
    }

    #[test]
    #[should_panic]
    fn test_registry_empty_key_panics() {
        CircuitBreakerRegistry::default().get("");
    }

    #[test]
    fn test_registry_concurrent_first_access() {
        let registry = Arc::new(CircuitBreakerRegistry::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.get("UserService"))
            })
            .collect();

        let breakers: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for breaker in &breakers[1..] {
            assert!(Arc::ptr_eq(&breakers[0], breaker));
        }
    }

    #[test]
    fn test_concurrent_failures_are_all_counted() {
        let breaker = Arc::new(CircuitBreaker::new(
            "UserService",
            CircuitBreakerConfig {
                failure_threshold: 1_000,
                ..CircuitBreakerConfig::default()
            },
        ));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                thread::spawn(move || {
                    for _ in 0..100 {
                        breaker.record_failure();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(breaker.snapshot().failure_count, 400);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
