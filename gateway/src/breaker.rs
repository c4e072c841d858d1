use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::metrics::GatewayMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub window: Duration,
    pub min_samples: usize,
    pub failure_ratio: f64,
    pub cooldown: Duration,
    /// Cooldown doubles on every re-open, capped here.
    pub max_cooldown: Duration,
    pub half_open_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            min_samples: 20,
            failure_ratio: 0.5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            half_open_trials: 3,
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    records: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    cooldown: Duration,
    trial_inflight: u32,
    trial_successes: u32,
}

pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    inner: Mutex<CircuitInner>,
    metrics: Arc<GatewayMetrics>,
}

/// Returned when the circuit rejects a call without touching the network.
#[derive(Debug, thiserror::Error)]
#[error("circuit open for target '{target}'")]
pub struct CircuitOpen {
    pub target: String,
}

impl CircuitBreaker {
    fn new(target: String, config: BreakerConfig, metrics: Arc<GatewayMetrics>) -> Self {
        let cooldown = config.cooldown;
        Self {
            target,
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                records: VecDeque::new(),
                opened_at: None,
                cooldown,
                trial_inflight: 0,
                trial_successes: 0,
            }),
            metrics,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    /// Admission check. `Err` is the fast-fail path; `Ok` hands back a permit
    /// that must be resolved with `succeed`/`fail`. Dropping an unresolved
    /// half-open permit releases the trial slot (cancelled request).
    pub fn try_acquire(self: &Arc<Self>) -> Result<CallPermit, CircuitOpen> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let now = Instant::now();
        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| now.duration_since(t)).unwrap_or_default();
                if elapsed >= inner.cooldown {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.trial_inflight = 0;
                    inner.trial_successes = 0;
                } else {
                    self.metrics.record_breaker_fast_fail(&self.target);
                    return Err(CircuitOpen { target: self.target.clone() });
                }
            }
            CircuitState::HalfOpen => {}
        }

        if inner.state == CircuitState::HalfOpen {
            if inner.trial_inflight + inner.trial_successes >= self.config.half_open_trials {
                self.metrics.record_breaker_fast_fail(&self.target);
                return Err(CircuitOpen { target: self.target.clone() });
            }
            inner.trial_inflight += 1;
            return Ok(CallPermit { breaker: self.clone(), trial: true, resolved: false });
        }
        Ok(CallPermit { breaker: self.clone(), trial: false, resolved: false })
    }

    fn record(&self, trial: bool, failure: bool) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        let now = Instant::now();

        if trial {
            inner.trial_inflight = inner.trial_inflight.saturating_sub(1);
            if failure {
                // One failed trial re-opens with an extended cooldown.
                inner.cooldown = (inner.cooldown * 2).min(self.config.max_cooldown);
                inner.opened_at = Some(now);
                inner.records.clear();
                self.transition(&mut inner, CircuitState::Open);
            } else {
                inner.trial_successes += 1;
                if inner.trial_successes >= self.config.half_open_trials {
                    inner.cooldown = self.config.cooldown;
                    inner.records.clear();
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            return;
        }

        inner.records.push_back((now, failure));
        if let Some(horizon) = now.checked_sub(self.config.window) {
            while inner.records.front().is_some_and(|(t, _)| *t < horizon) {
                inner.records.pop_front();
            }
        }

        if inner.state == CircuitState::Closed && failure {
            let total = inner.records.len();
            let failures = inner.records.iter().filter(|(_, f)| *f).count();
            if total >= self.config.min_samples
                && failures as f64 / total as f64 >= self.config.failure_ratio
            {
                inner.opened_at = Some(now);
                inner.cooldown = self.config.cooldown;
                self.transition(&mut inner, CircuitState::Open);
            }
        }
    }

    fn release_trial(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.trial_inflight = inner.trial_inflight.saturating_sub(1);
    }

    fn transition(&self, inner: &mut CircuitInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        warn!(target = %self.target, from = inner.state.as_str(), to = to.as_str(), "circuit transition");
        self.metrics.record_breaker_transition(&self.target, to.as_str());
        inner.state = to;
    }
}

pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl CallPermit {
    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.record(self.trial, false);
    }

    pub fn fail(mut self) {
        self.resolved = true;
        self.breaker.record(self.trial, true);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        // Cancelled before an outcome was recorded: free the trial slot
        // without counting it for or against the circuit.
        if !self.resolved && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Process-wide table of circuits keyed by `(url, operation)`.
pub struct BreakerRegistry {
    config: BreakerConfig,
    metrics: Arc<GatewayMetrics>,
    inner: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig, metrics: Arc<GatewayMetrics>) -> Self {
        Self { config, metrics, inner: RwLock::new(HashMap::new()) }
    }

    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(found) = self.inner.read().expect("registry lock poisoned").get(target) {
            return found.clone();
        }
        let mut guard = self.inner.write().expect("registry lock poisoned");
        guard
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    target.to_string(),
                    self.config.clone(),
                    self.metrics.clone(),
                ))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(config: BreakerConfig) -> Arc<CircuitBreaker> {
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        Arc::new(CircuitBreaker::new("worker/transform".into(), config, metrics))
    }

    fn trip(b: &Arc<CircuitBreaker>, n: usize) {
        for _ in 0..n {
            b.try_acquire().unwrap().fail();
        }
    }

    #[test]
    fn trips_after_min_samples_of_failures() {
        let b = breaker(BreakerConfig::default());
        trip(&b, 19);
        assert_eq!(b.state(), CircuitState::Closed);
        trip(&b, 1);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.try_acquire().is_err());
    }

    #[test]
    fn stays_closed_below_failure_ratio() {
        let b = breaker(BreakerConfig::default());
        for _ in 0..30 {
            b.try_acquire().unwrap().succeed();
        }
        for _ in 0..20 {
            b.try_acquire().unwrap().fail();
        }
        // 20 failures of 50 records is below the 50% threshold.
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_trial_success_closes() {
        let config = BreakerConfig { cooldown: Duration::from_millis(0), half_open_trials: 2, ..Default::default() };
        let b = breaker(config);
        trip(&b, 20);
        assert_eq!(b.state(), CircuitState::Open);
        // Cooldown of zero lets the next acquire move to half-open.
        b.try_acquire().unwrap().succeed();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.try_acquire().unwrap().succeed();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_trial_failure_reopens_with_longer_cooldown() {
        let config = BreakerConfig { cooldown: Duration::from_millis(0), ..Default::default() };
        let b = breaker(config);
        trip(&b, 20);
        b.try_acquire().unwrap().fail();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_bounds_concurrent_trials() {
        let config = BreakerConfig { cooldown: Duration::from_millis(0), half_open_trials: 1, ..Default::default() };
        let b = breaker(config);
        trip(&b, 20);
        let permit = b.try_acquire().unwrap();
        assert!(b.try_acquire().is_err());
        // A cancelled trial releases its slot.
        drop(permit);
        assert!(b.try_acquire().is_ok());
    }
}
