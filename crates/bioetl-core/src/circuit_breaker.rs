use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::OutcomeStatus;

/// Runtime circuit state for one named client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(60),
        }
    }
}

/// Point-in-time view of a breaker, used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Time left before an open breaker admits a probe.
    pub open_for: Option<Duration>,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    probe_in_flight: bool,
    probe_generation: u64,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            open_until: None,
            probe_in_flight: false,
            probe_generation: 0,
        }
    }
}

impl CircuitInner {
    /// Back to closed; the probe generation survives so stale permits stay stale.
    fn close(&mut self) {
        *self = Self {
            probe_generation: self.probe_generation,
            ..Self::default()
        };
    }

    fn start_probe(&mut self) -> u64 {
        self.probe_in_flight = true;
        self.probe_generation = self.probe_generation.wrapping_add(1);
        self.probe_generation
    }
}

/// Admission ticket returned by [`CircuitBreaker::allow`].
///
/// A half-open probe slot stays reserved while the permit is alive. Dropping
/// the permit before the probe reports back (cancellation, timeout, panic)
/// frees the slot so the next caller can probe.
#[derive(Debug)]
#[must_use = "dropping the permit releases a half-open probe slot"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: Option<u64>,
}

impl CircuitPermit<'_> {
    pub const fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        let Some(generation) = self.probe else {
            return;
        };
        let mut inner = self.breaker.lock();
        if inner.state == CircuitState::HalfOpen
            && inner.probe_in_flight
            && inner.probe_generation == generation
        {
            tracing::debug!(client = %self.breaker.name, "probe abandoned, releasing slot");
            inner.probe_in_flight = false;
        }
    }
}

/// Thread-safe circuit breaker guarding one upstream dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new("default", CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits a call, or returns `None` while the breaker rejects traffic. An
    /// expired open breaker moves to half-open and hands out exactly one probe
    /// until that probe reports back or its permit is dropped.
    pub fn allow(&self) -> Option<CircuitPermit<'_>> {
        let mut inner = self.lock();
        let probe = match inner.state {
            CircuitState::Closed => None,
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return None;
                }
                Some(inner.start_probe())
            }
            CircuitState::Open => {
                let expired = inner
                    .open_until
                    .map(|open_until| Instant::now() >= open_until)
                    .unwrap_or(true);
                if !expired {
                    return None;
                }
                tracing::debug!(client = %self.name, "circuit half-open, admitting probe");
                inner.state = CircuitState::HalfOpen;
                inner.open_until = None;
                Some(inner.start_probe())
            }
        };
        Some(CircuitPermit {
            breaker: self,
            probe,
        })
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!(client = %self.name, "circuit closed after successful probe");
        }
        inner.close();
    }

    /// Records a failed call. Only retryable failures count toward the threshold;
    /// a fatal response proves the dependency is answering and leaves the count alone.
    pub fn record_failure(&self, status: OutcomeStatus) {
        let mut inner = self.lock();
        match status {
            OutcomeStatus::Success => {
                drop(inner);
                self.record_success();
            }
            OutcomeStatus::FatalFailure => {
                inner.probe_in_flight = false;
            }
            OutcomeStatus::RetryableFailure => {
                inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                inner.probe_in_flight = false;

                let tripped = inner.state == CircuitState::HalfOpen
                    || (inner.state == CircuitState::Closed
                        && inner.consecutive_failures >= self.config.failure_threshold);
                if tripped {
                    tracing::warn!(
                        client = %self.name,
                        failures = inner.consecutive_failures,
                        cool_down_ms = self.config.cool_down.as_millis() as u64,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                    inner.open_until = Some(Instant::now() + self.config.cool_down);
                }
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            open_for: inner
                .open_until
                .map(|open_until| open_until.saturating_duration_since(Instant::now())),
        }
    }

    /// Test/reset hook.
    pub fn reset(&self) {
        self.lock().close();
    }
}
