//! Per-provider circuit breaker
//!
//! Closed passes calls through and counts consecutive failures. Reaching the
//! failure threshold opens the breaker, which rejects calls without touching
//! the provider until the cooldown has elapsed. The next call attempt after
//! that moves it to half-open, where a limited number of trial calls probe the
//! provider: any failure re-opens it, a run of successes closes it.

use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RouterConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub success_threshold: u32,
    pub half_open_max_calls: u32,
}

impl From<&RouterConfig> for BreakerSettings {
    fn from(config: &RouterConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown: Duration::from_millis(config.cooldown_ms),
            success_threshold: config.success_threshold.max(1),
            half_open_max_calls: config.half_open_max_calls.max(1),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&RouterConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    successes_in_half_open: u32,
    /// Trial calls currently in flight while half-open
    half_open_in_flight: u32,
    /// Bumped on every state change so a late release from an earlier
    /// half-open window cannot free a slot in the current one
    epoch: u64,
    settings: BreakerSettings,
}

/// Read-only view of a breaker for observability
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub model: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub successes_in_half_open: u32,
    /// Milliseconds until an open breaker starts probing
    pub retry_in_ms: Option<u64>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            successes_in_half_open: 0,
            half_open_in_flight: 0,
            epoch: 0,
            settings,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Ask permission for a call. Moves an open breaker whose cooldown has
    /// elapsed to half-open. A `true` answer must be followed by exactly one
    /// of `record_success`, `record_failure` or `release`.
    pub fn try_acquire(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = self
                    .opened_at
                    .map(|at| at.elapsed() >= self.settings.cooldown)
                    .unwrap_or(true);
                if !cooled_down {
                    return false;
                }
                self.state = CircuitState::HalfOpen;
                self.epoch += 1;
                self.successes_in_half_open = 0;
                self.half_open_in_flight = 1;
                true
            }
            CircuitState::HalfOpen => {
                if self.half_open_in_flight >= self.settings.half_open_max_calls {
                    return false;
                }
                self.half_open_in_flight += 1;
                true
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
                self.successes_in_half_open += 1;
                if self.successes_in_half_open >= self.settings.success_threshold {
                    self.close();
                }
            }
            // A call admitted before the breaker re-opened; it proves nothing
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.settings.failure_threshold {
                    self.open();
                }
            }
            CircuitState::HalfOpen => {
                self.consecutive_failures += 1;
                self.open();
            }
            CircuitState::Open => {
                self.consecutive_failures += 1;
            }
        }
    }

    /// End an admitted call without judging the provider, e.g. when the
    /// response arrived but was malformed.
    pub fn release(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.half_open_in_flight = self.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Like `release`, but only when the breaker is still in the half-open
    /// window identified by `epoch`
    pub fn release_from(&mut self, epoch: u64) {
        if self.epoch == epoch {
            self.release();
        }
    }

    pub fn reset(&mut self) {
        self.close();
    }

    pub fn status(&self, model: &str) -> BreakerStatus {
        let retry_in_ms = match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) => Some(
                self.settings
                    .cooldown
                    .saturating_sub(at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };

        BreakerStatus {
            model: model.to_string(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            successes_in_half_open: self.successes_in_half_open,
            retry_in_ms,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.epoch += 1;
        self.opened_at = Some(Instant::now());
        self.successes_in_half_open = 0;
        self.half_open_in_flight = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.epoch += 1;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.successes_in_half_open = 0;
        self.half_open_in_flight = 0;
    }
}
