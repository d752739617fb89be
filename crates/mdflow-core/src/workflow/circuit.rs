//! Per-action circuit breaker.
//!
//! Each action name gets its own circuit. Repeated failures open it; an
//! open circuit rejects calls until its cooldown elapses, then lets a single
//! trial call through. The trial's outcome closes or re-opens the circuit.
//! A trial that never reports back is replaced by a new one once another
//! cooldown has passed. State lives for the lifetime of the engine and is
//! never persisted.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use mdflow_types::config::CircuitBreakerConfig;
use serde::Serialize;

/// Circuit breaker state for one target.
#[derive(Debug, Clone)]
pub enum CircuitState {
    /// Normal operation. Tracks consecutive failures toward the threshold.
    Closed { consecutive_failures: u32 },
    /// Calls fail fast until `wait_duration` elapses.
    Open {
        opened_at: Instant,
        wait_duration: Duration,
    },
    /// A trial call is in flight; other calls are rejected until it resolves
    /// or goes stale.
    HalfOpen { trial_started: Instant },
}

impl CircuitState {
    fn closed() -> Self {
        CircuitState::Closed {
            consecutive_failures: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CircuitState::Closed { .. } => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }
}

/// Point-in-time view of one circuit, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub target: String,
    pub state: &'static str,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    circuits: DashMap<String, CircuitState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            circuits: DashMap::new(),
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, Duration::from_secs(config.cooldown_secs))
    }

    /// Whether a call to `target` may proceed.
    ///
    /// Moves an open circuit whose cooldown has elapsed to half-open and
    /// admits that one call as the trial.
    pub fn allow(&self, target: &str) -> bool {
        let mut entry = self
            .circuits
            .entry(target.to_string())
            .or_insert_with(CircuitState::closed);

        let trial = CircuitState::HalfOpen {
            trial_started: Instant::now(),
        };
        let (allowed, next) = match &*entry {
            CircuitState::Closed { .. } => (true, None),
            CircuitState::Open {
                opened_at,
                wait_duration,
            } if opened_at.elapsed() >= *wait_duration => (true, Some(trial)),
            CircuitState::HalfOpen { trial_started } if trial_started.elapsed() >= self.cooldown => {
                tracing::warn!(target_name = target, "trial call never reported back, admitting a new one");
                (true, Some(trial))
            }
            CircuitState::Open { .. } | CircuitState::HalfOpen { .. } => (false, None),
        };

        if let Some(state) = next {
            tracing::debug!(target_name = target, "circuit half-open, admitting trial call");
            *entry = state;
        }
        allowed
    }

    /// Like [`allow`](Self::allow), but returns a permit that records a
    /// failure if it is dropped before the call reports its outcome.
    pub fn admit(&self, target: &str) -> Option<CircuitPermit<'_>> {
        self.allow(target).then(|| CircuitPermit {
            breaker: self,
            target: target.to_string(),
            settled: false,
        })
    }

    /// Whether a call to `target` would be rejected right now. Never
    /// changes state.
    pub fn is_open(&self, target: &str) -> bool {
        match self.circuits.get(target).as_deref() {
            Some(CircuitState::Open {
                opened_at,
                wait_duration,
            }) => opened_at.elapsed() < *wait_duration,
            Some(CircuitState::HalfOpen { trial_started }) => trial_started.elapsed() < self.cooldown,
            _ => false,
        }
    }

    pub fn record_success(&self, target: &str) {
        let mut entry = self
            .circuits
            .entry(target.to_string())
            .or_insert_with(CircuitState::closed);
        if !matches!(&*entry, CircuitState::Closed { .. }) {
            tracing::info!(target_name = target, "circuit closed");
        }
        *entry = CircuitState::closed();
    }

    pub fn record_failure(&self, target: &str) {
        let mut entry = self
            .circuits
            .entry(target.to_string())
            .or_insert_with(CircuitState::closed);

        let next = match &*entry {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let count = consecutive_failures + 1;
                if count >= self.failure_threshold {
                    tracing::warn!(target_name = target, failures = count, "circuit opened");
                    Some(self.opened())
                } else {
                    Some(CircuitState::Closed {
                        consecutive_failures: count,
                    })
                }
            }
            CircuitState::HalfOpen { .. } => {
                tracing::warn!(target_name = target, "trial call failed, circuit re-opened");
                Some(self.opened())
            }
            CircuitState::Open { .. } => None,
        };

        if let Some(state) = next {
            *entry = state;
        }
    }

    fn opened(&self) -> CircuitState {
        CircuitState::Open {
            opened_at: Instant::now(),
            wait_duration: self.cooldown,
        }
    }

    /// Current state name for `target` (`closed` when never seen).
    pub fn state(&self, target: &str) -> &'static str {
        self.circuits
            .get(target)
            .map(|s| s.name())
            .unwrap_or("closed")
    }

    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<CircuitSnapshot> = self
            .circuits
            .iter()
            .map(|entry| CircuitSnapshot {
                target: entry.key().clone(),
                state: entry.value().name(),
                consecutive_failures: match entry.value() {
                    CircuitState::Closed {
                        consecutive_failures,
                    } => *consecutive_failures,
                    _ => self.failure_threshold,
                },
            })
            .collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }

    pub fn reset(&self, target: &str) {
        self.circuits.remove(target);
    }
}

/// An admitted call. Report the outcome with [`succeeded`](Self::succeeded)
/// or [`failed`](Self::failed); dropping it unreported (a timeout or a
/// cancelled branch) counts as a failure.
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    target: String,
    settled: bool,
}

impl CircuitPermit<'_> {
    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.record_success(&self.target);
    }

    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.record_failure(&self.target);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::debug!(target_name = %self.target, "admitted call abandoned, counting as failure");
            self.breaker.record_failure(&self.target);
        }
    }
}
