//! Per-placement circuit breakers.
//!
//! Closed counts consecutive failures and trips open at the threshold; open
//! rejects until the timeout elapses, then admits a single half-open probe;
//! the probe's outcome closes the breaker or re-opens it. 5xx and transport
//! errors are failures; 4xx responses are an upstream decision and count as
//! successes.

use confsync::snapshot::{CircuitBreakerPolicy, Snapshot};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Used for placements that do not configure their own breaker.
pub const DEFAULT_POLICY: CircuitBreakerPolicy = CircuitBreakerPolicy {
    failure_threshold: 5,
    timeout: Duration::from_secs(30),
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gate consulted by the proxy engine before and after each upstream call.
pub trait CircuitGuard: Send + Sync {
    fn allow(&self, placement: &str) -> bool;
    fn record_success(&self, placement: &str);
    fn record_failure(&self, placement: &str);
    fn state(&self, placement: &str) -> CircuitState;
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    // Set when a half-open probe has been admitted and its outcome is still
    // pending. A probe whose outcome never arrives (e.g. the request was
    // diverted before contacting the upstream) goes stale after the breaker
    // timeout and the slot is handed out again.
    probe_started: Option<Instant>,
}

struct Breaker {
    policy: CircuitBreakerPolicy,
    inner: Mutex<BreakerInner>,
}

impl Breaker {
    fn new(policy: CircuitBreakerPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                open_until: None,
                probe_started: None,
            }),
        }
    }

    fn allow(&self, placement: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if inner.open_until.is_some_and(|until| Instant::now() >= until) {
                    transition(&mut inner, placement, CircuitState::HalfOpen);
                    inner.probe_started = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => match inner.probe_started {
                Some(started) if started.elapsed() < self.policy.timeout => false,
                _ => {
                    inner.probe_started = Some(Instant::now());
                    true
                }
            },
        }
    }

    fn record_success(&self, placement: &str) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                inner.probe_started = None;
                inner.consecutive_failures = 0;
                inner.open_until = None;
                transition(&mut inner, placement, CircuitState::Closed);
            }
            // Late outcome from a request that started before the trip.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, placement: &str) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.policy.failure_threshold {
                    inner.open_until = Some(Instant::now() + self.policy.timeout);
                    transition(&mut inner, placement, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.probe_started = None;
                inner.open_until = Some(Instant::now() + self.policy.timeout);
                transition(&mut inner, placement, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn state(&self) -> CircuitState {
        self.inner.lock().state
    }
}

// Must be called with the breaker lock held.
fn transition(inner: &mut BreakerInner, placement: &str, new_state: CircuitState) {
    if inner.state == new_state {
        return;
    }
    tracing::info!(
        placement,
        old_state = %inner.state,
        new_state = %new_state,
        failures = inner.consecutive_failures,
        "circuit state changed"
    );
    inner.state = new_state;
}

/// All breakers, keyed by placement. Reconciled against each published
/// snapshot: unchanged placements keep their state, new placements and
/// placements whose policy changed start closed, retired ones are dropped.
pub struct CircuitBreakerSet {
    breakers: RwLock<HashMap<String, Arc<Breaker>>>,
    default_policy: CircuitBreakerPolicy,
}

impl CircuitBreakerSet {
    pub fn new() -> Self {
        Self::with_default_policy(DEFAULT_POLICY)
    }

    pub fn with_default_policy(default_policy: CircuitBreakerPolicy) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            default_policy,
        }
    }

    fn policy_for(&self, placement: &confsync::snapshot::Placement) -> CircuitBreakerPolicy {
        placement.circuit_breaker.unwrap_or(self.default_policy)
    }

    pub fn apply(&self, snapshot: &Snapshot) {
        let mut breakers = self.breakers.write();
        breakers.retain(|key, breaker| {
            snapshot
                .placement(key)
                .is_some_and(|placement| self.policy_for(placement) == breaker.policy)
        });
        for (key, placement) in &snapshot.placements {
            if !breakers.contains_key(key) {
                breakers.insert(key.clone(), Arc::new(Breaker::new(self.policy_for(placement))));
            }
        }
    }

    fn breaker(&self, placement: &str) -> Option<Arc<Breaker>> {
        self.breakers.read().get(placement).cloned()
    }
}

impl Default for CircuitBreakerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitGuard for CircuitBreakerSet {
    fn allow(&self, placement: &str) -> bool {
        match self.breaker(placement) {
            Some(breaker) => breaker.allow(placement),
            None => true,
        }
    }

    fn record_success(&self, placement: &str) {
        if let Some(breaker) = self.breaker(placement) {
            breaker.record_success(placement);
        }
    }

    fn record_failure(&self, placement: &str) {
        if let Some(breaker) = self.breaker(placement) {
            breaker.record_failure(placement);
        }
    }

    fn state(&self, placement: &str) -> CircuitState {
        match self.breaker(placement) {
            Some(breaker) => breaker.state(),
            None => CircuitState::Closed,
        }
    }
}
