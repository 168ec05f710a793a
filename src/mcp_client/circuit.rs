//! Per-client circuit breaker.
//!
//! Pure state machine over caller-supplied instants so it can be driven in
//! tests without a clock. The client consults [`CircuitBreaker::admit`] before
//! any reconnect attempt and reports the outcome back.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Base delay before the first reconnect attempt.
const BACKOFF_BASE_MS: u64 = 1_000;

/// Upper bound on the reconnect delay.
const BACKOFF_CAP_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Decision for a pending reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal attempt; wait `delay` first.
    Attempt { delay: Duration },
    /// Single half-open trial; not delayed.
    Trial,
    /// Circuit is open; `retry_in` until the next trial is allowed.
    Rejected { retry_in: Duration },
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    attempts: u32,
    max_attempts: u32,
    reset_after: Duration,
    opened_at: Option<Instant>,
}

/// `min(1000 * 2^attempts, 30000)` milliseconds.
pub fn backoff_delay(attempts: u32) -> Duration {
    let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
    Duration::from_millis(BACKOFF_BASE_MS.saturating_mul(factor).min(BACKOFF_CAP_MS))
}

impl CircuitBreaker {
    pub fn new(max_attempts: u32, reset_after: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            reset_after,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the circuit is open and its reset deadline has not passed.
    pub fn is_open(&self, now: Instant) -> bool {
        self.state == CircuitState::Open && !self.reset_elapsed(now)
    }

    fn reset_elapsed(&self, now: Instant) -> bool {
        self.opened_at
            .map(|at| now.saturating_duration_since(at) >= self.reset_after)
            .unwrap_or(true)
    }

    /// Ask whether a reconnect attempt may run now.
    ///
    /// An open circuit whose reset deadline has passed moves to half-open and
    /// admits exactly one trial.
    pub fn admit(&mut self, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Attempt {
                delay: backoff_delay(self.attempts),
            },
            CircuitState::HalfOpen => Admission::Rejected {
                retry_in: Duration::ZERO,
            },
            CircuitState::Open => {
                if self.reset_elapsed(now) {
                    self.state = CircuitState::HalfOpen;
                    Admission::Trial
                } else {
                    let opened = self.opened_at.unwrap_or(now);
                    let elapsed = now.saturating_duration_since(opened);
                    Admission::Rejected {
                        retry_in: self.reset_after.saturating_sub(elapsed),
                    }
                }
            }
        }
    }

    /// A reconnect attempt (or half-open trial) succeeded.
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.attempts = 0;
        self.opened_at = None;
    }

    /// A reconnect attempt failed. Returns the resulting state.
    pub fn record_failure(&mut self, now: Instant) -> CircuitState {
        match self.state {
            CircuitState::HalfOpen => self.open(now),
            CircuitState::Open => self.open(now),
            CircuitState::Closed => {
                self.attempts = self.attempts.saturating_add(1);
                if self.attempts >= self.max_attempts {
                    self.open(now);
                }
            }
        }
        self.state
    }

    /// A half-open trial was abandoned before it finished; the next
    /// admission may run a new trial.
    pub fn release_trial(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Open;
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
