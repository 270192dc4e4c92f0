//! Circuit breaker guarding the vehicle link.
//!
//! # States
//!
//! - **Closed**: normal operation. Calls run, consecutive failures are counted.
//! - **Open**: the link is assumed down. Calls fail fast with
//!   [`LinkError::CircuitOpen`] without touching the transport.
//! - **Half-open**: the reset timeout has elapsed. Trial calls run to probe
//!   whether the link recovered.
//!
//! # Transitions
//!
//! ```text
//! Closed    → Open:      failure_count >= max_failures
//! Open      → HalfOpen:  on the first call after reset_timeout has elapsed
//! HalfOpen  → Closed:    trial call(s) succeed (see HalfOpenPolicy)
//! HalfOpen  → Open:      a trial call fails
//! ```
//!
//! The Open → HalfOpen move is lazy: [`CircuitBreaker::state`] keeps reporting
//! `Open` past the reset timeout until a call is attempted.

use std::fmt;
use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::duration_ms;
use crate::error::{LinkError, Result};

/// Observable state of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are rejected.
    Open,
    /// Trial calls are allowed.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// How many successful trial calls close a half-open circuit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HalfOpenPolicy {
    /// A single successful trial call closes the circuit.
    #[default]
    Lenient,
    /// `half_open_max_calls` consecutive successful trial calls are required.
    Consecutive,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub max_failures: u32,

    /// How long the circuit stays open before a trial call is allowed.
    #[serde(rename = "reset_timeout_ms", with = "duration_ms")]
    pub reset_timeout: Duration,

    /// Budget of successful trial calls while half-open.
    pub half_open_max_calls: u32,

    /// Rule for closing a half-open circuit.
    pub half_open_policy: HalfOpenPolicy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            half_open_policy: HalfOpenPolicy::Lenient,
        }
    }
}

impl CircuitBreakerConfig {
    /// Sets the failure threshold.
    #[must_use]
    pub const fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    /// Sets the reset timeout.
    #[must_use]
    pub const fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Sets the half-open call budget.
    #[must_use]
    pub const fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    /// Sets the half-open closing rule.
    #[must_use]
    pub const fn with_half_open_policy(mut self, policy: HalfOpenPolicy) -> Self {
        self.half_open_policy = policy;
        self
    }
}

/// Point-in-time view of the breaker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// Successful trial calls in the current half-open period.
    pub success_count: u32,
    /// When the most recent failure was recorded.
    pub last_failure: Option<Instant>,
}

#[derive(Debug)]
struct Counters {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Tracks link health across calls and fails fast while the link is down.
///
/// Calls are serialized: the operation itself runs while the breaker's call
/// lock is held, so bookkeeping for two concurrent calls never interleaves.
/// State reads ([`state`](Self::state), [`snapshot`](Self::snapshot)) do not
/// wait for an in-flight call.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    counters: RwLock<Counters>,
    call_lock: Mutex<()>,
}

impl CircuitBreaker {
    /// Creates a closed circuit breaker.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            counters: RwLock::new(Counters {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
            call_lock: Mutex::new(()),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Returns the current state without performing the lazy Open → HalfOpen
    /// check.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.counters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .state
    }

    /// Returns a copy of the current counters.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let counters = self
            .counters
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        BreakerSnapshot {
            state: counters.state,
            failure_count: counters.failure_count,
            success_count: counters.success_count,
            last_failure: counters.last_failure,
        }
    }

    /// Runs `operation` under breaker protection.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::CircuitOpen`] without running `operation` while the
    /// circuit is open or the half-open budget is spent; otherwise returns
    /// whatever `operation` returns.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _serialized = self.call_lock.lock().await;

        self.admit()?;

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(err) => self.record_failure(err),
        }
        result
    }

    fn admit(&self) -> Result<()> {
        let mut counters = self
            .counters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if counters.state == CircuitState::Open {
            let cooled_down = counters
                .last_failure
                .map_or(true, |at| at.elapsed() > self.config.reset_timeout);
            if !cooled_down {
                return Err(LinkError::CircuitOpen);
            }
            counters.state = CircuitState::HalfOpen;
            counters.success_count = 0;
            info!("circuit breaker half-open, allowing trial call");
        }

        if counters.state == CircuitState::HalfOpen
            && counters.success_count >= self.config.half_open_max_calls
        {
            return Err(LinkError::CircuitOpen);
        }

        Ok(())
    }

    fn record_success(&self) {
        let mut counters = self
            .counters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        counters.failure_count = 0;

        if counters.state == CircuitState::HalfOpen {
            counters.success_count += 1;
            let close = match self.config.half_open_policy {
                HalfOpenPolicy::Lenient => true,
                HalfOpenPolicy::Consecutive => {
                    counters.success_count >= self.config.half_open_max_calls
                }
            };
            if close {
                counters.state = CircuitState::Closed;
                counters.success_count = 0;
                info!("circuit breaker closed after successful trial call");
            }
        }
    }

    fn record_failure(&self, error: &LinkError) {
        let mut counters = self
            .counters
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        counters.failure_count = counters.failure_count.saturating_add(1);
        counters.last_failure = Some(Instant::now());

        match counters.state {
            CircuitState::HalfOpen => {
                counters.state = CircuitState::Open;
                warn!(%error, "trial call failed, circuit breaker re-opened");
            }
            CircuitState::Closed if counters.failure_count >= self.config.max_failures => {
                counters.state = CircuitState::Open;
                warn!(
                    failures = counters.failure_count,
                    %error,
                    "circuit breaker opened"
                );
            }
            _ => {}
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.snapshot())
            .finish_non_exhaustive()
    }
}
