//! Per-handler circuit breaker.
//!
//! Closed until N failures accumulate within a rolling window, then open
//! for a fixed timeout, then half-open admitting a single probe. A probe
//! success closes the circuit; a probe failure reopens it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Breaker tuning. Defaults follow the runtime contract: 5 failures in
/// 60s open the circuit for 30s.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub window: Duration,
    pub open_for: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            open_for: Duration::from_secs(30),
        }
    }
}

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast.
    Open { since: Instant },
    /// One probe admitted to test recovery.
    HalfOpen,
}

/// Windowed circuit breaker for one handler.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failures: VecDeque<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            probe_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > self.config.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether a call may proceed right now. Transitions open → half-open
    /// once the open timeout has elapsed; in half-open only the single
    /// probe is admitted.
    pub fn is_call_permitted(&mut self) -> bool {
        self.is_call_permitted_at(Instant::now())
    }

    pub fn is_call_permitted_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open { since } => {
                if now.duration_since(since) >= self.config.open_for {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.failures.clear();
        self.probe_in_flight = false;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        if self.state == CircuitState::HalfOpen {
            // Failed probe: reopen.
            self.probe_in_flight = false;
            self.state = CircuitState::Open { since: now };
            return;
        }
        self.failures.push_back(now);
        self.prune(now);
        if self.failures.len() >= self.config.failure_threshold {
            self.state = CircuitState::Open { since: now };
            self.failures.clear();
        }
    }
}
