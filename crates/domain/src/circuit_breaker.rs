//! Circuit breaker guarding the primary lock backend.
//!
//! The breaker is a plain value; every transition takes `now` explicitly so
//! the state machine can be driven deterministically.

use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_millis(60_000),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds until an open circuit admits a probe call.
    pub retry_in_ms: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                success_threshold: config.success_threshold.max(1),
                open_duration: config.open_duration,
            },
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            next_attempt_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call may reach the backend. An open circuit whose wait has
    /// elapsed moves to half-open and admits the call.
    pub fn admit(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let due = self.next_attempt_at.is_none_or(|at| now >= at);
                if due {
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    tracing::info!("lock circuit half-open");
                }
                due
            }
        }
    }

    pub fn on_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.next_attempt_at = None;
                    tracing::info!("lock circuit closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.open(now);
                }
            }
            CircuitState::HalfOpen => {
                self.failure_count += 1;
                self.open(now);
            }
            CircuitState::Open => {}
        }
    }

    pub fn snapshot(&self, now: Instant) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            retry_in_ms: match (self.state, self.next_attempt_at) {
                (CircuitState::Open, Some(at)) => {
                    Some(at.saturating_duration_since(now).as_millis() as u64)
                }
                _ => None,
            },
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.success_count = 0;
        self.next_attempt_at = Some(now + self.config.open_duration);
        tracing::warn!(
            failures = self.failure_count,
            open_ms = self.config.open_duration.as_millis() as u64,
            "lock circuit opened"
        );
    }
}
